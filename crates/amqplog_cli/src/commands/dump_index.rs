//! Dump-index command implementation.

use crate::error::{CliError, CliResult};
use amqplog_codec::{MessageEnvelope, Position};
use amqplog_core::{exchange_log_id, queue_index_log_id, queue_retired_log_id, QueueIndex};
use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore, StorageError};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

const READ_BATCH: usize = 256;

/// One index record for output.
#[derive(Debug, Serialize)]
pub struct IndexRecordInfo {
    /// Position of the record in the queue index.
    pub index_position: String,
    /// Exchange holding the body.
    pub exchange: String,
    /// Position of the body in the exchange log.
    pub position: String,
    /// Whether the record was acked, dropped or purged.
    pub retired: bool,
    /// Routing key (with `--resolve`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_key: Option<String>,
    /// Body length in bytes (with `--resolve`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_len: Option<usize>,
    /// The body is gone (with `--resolve`).
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub orphaned: bool,
}

/// Runs the dump-index command.
pub fn run(path: &Path, vhost: &str, queue: &str, format: &str, resolve: bool) -> CliResult<()> {
    if !path.is_dir() {
        return Err(CliError::NotADirectory(path.display().to_string()));
    }
    let store: Arc<dyn LogStore> =
        Arc::new(SegmentedLogStore::open_dir(path, LogStoreConfig::default())?);
    let records = dump_index(&store, vhost, queue, resolve)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
        _ => {
            print_text_output(vhost, queue, &records);
        }
    }

    Ok(())
}

/// Reads every record of a queue index, in index order.
pub fn dump_index(
    store: &Arc<dyn LogStore>,
    vhost: &str,
    queue: &str,
    resolve: bool,
) -> CliResult<Vec<IndexRecordInfo>> {
    let index_log = queue_index_log_id(vhost, queue);
    if !store.log_exists(&index_log) {
        return Err(CliError::QueueNotFound {
            vhost: vhost.to_string(),
            queue: queue.to_string(),
        });
    }

    let index = QueueIndex::new(
        Arc::clone(store),
        index_log,
        queue_retired_log_id(vhost, queue),
        READ_BATCH,
    );
    let retired = if store.log_exists(index.retired_log()) {
        index.load_retired()?
    } else {
        Default::default()
    };

    let mut records = Vec::new();
    for entry in index.read_from(Position::EARLIEST) {
        let entry = entry?;
        let mut info = IndexRecordInfo {
            index_position: entry.index_position.to_string(),
            exchange: entry.record.exchange.clone(),
            position: entry.record.position.to_string(),
            retired: retired.contains(&entry.index_position),
            routing_key: None,
            body_len: None,
            orphaned: false,
        };
        if resolve {
            let log_id = exchange_log_id(vhost, &entry.record.exchange);
            match store.read_at(&log_id, entry.record.position) {
                Ok(bytes) => {
                    let envelope = MessageEnvelope::decode(&bytes)?;
                    info.routing_key = Some(envelope.routing_key);
                    info.body_len = Some(envelope.body.len());
                }
                Err(StorageError::LogNotFound { .. } | StorageError::PositionNotFound { .. }) => {
                    debug!(%log_id, position = %entry.record.position, "body missing");
                    info.orphaned = true;
                }
                Err(e) => return Err(e.into()),
            }
        }
        records.push(info);
    }
    Ok(records)
}

fn print_text_output(vhost: &str, queue: &str, records: &[IndexRecordInfo]) {
    let retired = records.iter().filter(|r| r.retired).count();
    println!("Queue '{}' in vhost '{}'", queue, vhost);
    println!(
        "{} record(s), {} retired, {} outstanding",
        records.len(),
        retired,
        records.len() - retired
    );
    println!();

    for record in records {
        let mut line = format!(
            "{:>12}  {} @ {}",
            record.index_position, record.exchange, record.position
        );
        if record.retired {
            line.push_str("  [retired]");
        }
        if let (Some(key), Some(len)) = (&record.routing_key, record.body_len) {
            line.push_str(&format!("  key={key} len={len}"));
        }
        if record.orphaned {
            line.push_str("  [orphaned]");
        }
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqplog_codec::MessageProperties;
    use amqplog_core::{
        Broker, BrokerConfig, Channel, ExchangeDeleteOptions, ExchangeOptions, ExchangeType,
        QueueOptions, DEFAULT_VHOST,
    };
    use tempfile::TempDir;

    fn populate(dir: &Path) {
        let broker =
            Broker::open_dir(dir, BrokerConfig::default(), LogStoreConfig::default()).unwrap();
        let channel = Channel::open(&broker.default_vhost().unwrap());
        channel
            .declare_exchange("ex", ExchangeType::Direct, ExchangeOptions::new())
            .unwrap();
        channel.declare_queue("q", QueueOptions::new()).unwrap();
        channel.bind("q", "ex", "k").unwrap();
        channel
            .publish("ex", "k", MessageProperties::new(), b"first".to_vec())
            .unwrap();
        channel
            .publish("", "q", MessageProperties::new(), b"second!".to_vec())
            .unwrap();
        let got = channel.get("q", true).unwrap().unwrap();
        channel.ack(got.delivery_tag, false).unwrap();
    }

    fn open(dir: &Path) -> Arc<dyn LogStore> {
        Arc::new(SegmentedLogStore::open_dir(dir, LogStoreConfig::default()).unwrap())
    }

    #[test]
    fn dumps_records_with_retired_flags() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());

        let records = dump_index(&open(dir.path()), DEFAULT_VHOST, "q", false).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].exchange, "ex");
        assert!(records[0].retired);
        assert_eq!(records[1].exchange, "");
        assert!(!records[1].retired);
        assert!(records[0].routing_key.is_none());
    }

    #[test]
    fn resolves_bodies() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());

        let records = dump_index(&open(dir.path()), DEFAULT_VHOST, "q", true).unwrap();
        assert_eq!(records[0].routing_key.as_deref(), Some("k"));
        assert_eq!(records[0].body_len, Some(5));
        assert_eq!(records[1].routing_key.as_deref(), Some("q"));
        assert_eq!(records[1].body_len, Some(7));
    }

    #[test]
    fn marks_orphaned_records() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());
        {
            let broker =
                Broker::open_dir(dir.path(), BrokerConfig::default(), LogStoreConfig::default())
                    .unwrap();
            let channel = Channel::open(&broker.default_vhost().unwrap());
            channel
                .delete_exchange("ex", ExchangeDeleteOptions::default())
                .unwrap();
        }

        let records = dump_index(&open(dir.path()), DEFAULT_VHOST, "q", true).unwrap();
        assert!(records[0].orphaned);
        assert!(!records[1].orphaned);
    }

    #[test]
    fn unknown_queue_is_an_error() {
        let dir = TempDir::new().unwrap();
        populate(dir.path());
        assert!(matches!(
            dump_index(&open(dir.path()), DEFAULT_VHOST, "nope", false),
            Err(CliError::QueueNotFound { .. })
        ));
    }
}
