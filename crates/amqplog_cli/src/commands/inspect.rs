//! Inspect command implementation.

use crate::error::{CliError, CliResult};
use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore};
use serde::Serialize;
use std::path::Path;

/// Log directory inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Directory path.
    pub path: String,
    /// Total entries across all logs.
    pub total_entries: u64,
    /// One line per log, sorted by id.
    pub logs: Vec<LogSummary>,
}

/// Summary of a single log.
#[derive(Debug, Serialize)]
pub struct LogSummary {
    /// Log identifier.
    pub log_id: String,
    /// Entity kind derived from the id (exchange, index, retired, topology).
    pub kind: &'static str,
    /// Whether the log survives a reopen.
    pub durable: bool,
    /// Number of entries.
    pub entries: u64,
    /// Position the next append would receive, as `segment:entry`.
    pub end: String,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> CliResult<()> {
    let result = inspect(path)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

/// Opens the directory and summarizes every log in it.
pub fn inspect(path: &Path) -> CliResult<InspectResult> {
    if !path.is_dir() {
        return Err(CliError::NotADirectory(path.display().to_string()));
    }
    let store = SegmentedLogStore::open_dir(path, LogStoreConfig::default())?;

    let mut logs: Vec<LogSummary> = store
        .list_logs()?
        .into_iter()
        .map(|info| LogSummary {
            kind: log_kind(&info.log_id),
            log_id: info.log_id,
            durable: info.durable,
            entries: info.entries,
            end: info.end.to_string(),
        })
        .collect();
    logs.sort_by(|a, b| a.log_id.cmp(&b.log_id));

    Ok(InspectResult {
        path: path.display().to_string(),
        total_entries: logs.iter().map(|log| log.entries).sum(),
        logs,
    })
}

fn log_kind(log_id: &str) -> &'static str {
    if log_id.ends_with("/topology") {
        "topology"
    } else if log_id.contains("/exchange/") {
        "exchange"
    } else if log_id.contains("/queue/") && log_id.ends_with("/index") {
        "index"
    } else if log_id.contains("/queue/") && log_id.ends_with("/retired") {
        "retired"
    } else {
        "other"
    }
}

fn print_text_output(result: &InspectResult) {
    println!("amqplog Log Directory");
    println!("=====================");
    println!();
    println!("Path: {}", result.path);
    println!("Logs: {}", result.logs.len());
    println!("Entries: {}", result.total_entries);
    println!();

    let width = result
        .logs
        .iter()
        .map(|log| log.log_id.len())
        .max()
        .unwrap_or(0);
    for log in &result.logs {
        println!(
            "  {:<width$}  {:<8}  {:<9}  {:>8} entries  end {}",
            log.log_id,
            log.kind,
            if log.durable { "durable" } else { "transient" },
            log.entries,
            log.end,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqplog_core::{Broker, BrokerConfig, Channel, QueueOptions};
    use amqplog_codec::MessageProperties;
    use tempfile::TempDir;

    #[test]
    fn lists_broker_logs() {
        let dir = TempDir::new().unwrap();
        {
            let broker =
                Broker::open_dir(dir.path(), BrokerConfig::default(), LogStoreConfig::default())
                    .unwrap();
            let channel = Channel::open(&broker.default_vhost().unwrap());
            channel.declare_queue("q", QueueOptions::new()).unwrap();
            channel
                .publish("", "q", MessageProperties::new(), b"x".to_vec())
                .unwrap();
        }

        let result = inspect(dir.path()).unwrap();
        let index = result
            .logs
            .iter()
            .find(|log| log.log_id == "//queue/q/index")
            .unwrap();
        assert_eq!(index.kind, "index");
        assert_eq!(index.entries, 1);
        assert!(index.durable);
        assert!(result.logs.iter().any(|log| log.kind == "topology"));
    }

    #[test]
    fn rejects_missing_directory() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent");
        assert!(matches!(
            inspect(&missing),
            Err(CliError::NotADirectory(_))
        ));
    }

    #[test]
    fn classifies_log_ids() {
        assert_eq!(log_kind("//exchange/orders"), "exchange");
        assert_eq!(log_kind("//queue/q/index"), "index");
        assert_eq!(log_kind("//queue/q/retired"), "retired");
        assert_eq!(log_kind("//topology"), "topology");
    }
}
