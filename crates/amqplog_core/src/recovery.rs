//! Crash recovery.
//!
//! Opening a virtual host rebuilds its durable state in two passes per
//! queue:
//!
//! 1. Restore: every index record that is not in the retired set becomes
//!    pending again, flagged redelivered. Whether it reached a consumer
//!    before the crash is unknown, so delivery is at-least-once.
//! 2. Catch-up: for each exchange the queue is bound to (the default
//!    exchange included), re-scan the exchange log from just past the last
//!    position the queue indexed from it, or from the binding's start if
//!    later, and index every message the bindings match. This covers a crash
//!    between a body append and its index appends. Caught-up records were
//!    never delivered and are not flagged.
//!
//! Live records that point at an exchange which did not come back (a
//! transient one) are orphaned at the queue's current index end, and the
//! mark goes to the topology log so a later exchange of the same name never
//! resolves them.

use crate::error::CoreResult;
use crate::exchange::{binding_matches, Exchange};
use crate::queue::{IndexEntry, Queue};
use crate::topology::{TopologyRecord, TopologySnapshot};
use crate::types::QueueOptions;
use crate::vhost::{VirtualHost, DEFAULT_EXCHANGE};
use amqplog_codec::{IndexRecord, MessageEnvelope, Position};
use amqplog_storage::LogCursor;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

/// What opening a virtual host recovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Durable queues restored.
    pub queues: usize,
    /// Durable exchanges restored, predeclared ones excluded.
    pub exchanges: usize,
    /// Explicit bindings restored.
    pub bindings: usize,
    /// Unretired index records made pending again.
    pub records_recovered: u64,
    /// Messages indexed during catch-up.
    pub records_reindexed: u64,
    /// Exchanges orphaned because queues still referenced them after they
    /// were lost, counted once per queue.
    pub exchanges_orphaned: usize,
}

/// One exchange a queue catches up from, with the keys it is bound by and
/// the position each binding took effect at.
struct Source {
    exchange: Arc<Exchange>,
    keys: Vec<(String, Position)>,
}

/// Rebuilds `vhost` from `topology`.
pub(crate) fn recover(vhost: &VirtualHost, topology: &TopologySnapshot) -> CoreResult<RecoveryReport> {
    let host = vhost.host();
    let mut report = RecoveryReport::default();

    for (name, kind) in &topology.exchanges {
        if vhost.exchange(name).is_ok() {
            continue;
        }
        let exchange = Exchange::create(Arc::clone(host), name, *kind, true, false)?;
        vhost.install_exchange(exchange);
        report.exchanges += 1;
    }

    let default = vhost.exchange(DEFAULT_EXCHANGE)?;
    let no_marks = BTreeMap::new();
    for (name, record) in &topology.queues {
        let options = QueueOptions::new().auto_delete(record.auto_delete);
        let queue = Queue::create(Arc::clone(host), name, options, None, false)?;
        let marks = topology.orphan_marks.get(name).unwrap_or(&no_marks);
        for (exchange, mark) in marks {
            queue.restore_orphan_mark(exchange, *mark);
        }

        default.restore_binding(&queue, name);
        let mut sources = vec![Source {
            exchange: Arc::clone(&default),
            keys: vec![(name.clone(), record.default_start)],
        }];
        for (binding, start) in topology.bindings_of(name) {
            let Ok(exchange) = vhost.exchange(&binding.exchange) else {
                warn!(queue = %name, exchange = %binding.exchange, "binding to missing exchange skipped");
                continue;
            };
            exchange.restore_binding(&queue, &binding.key);
            report.bindings += 1;
            match sources
                .iter_mut()
                .find(|source| Arc::ptr_eq(&source.exchange, &exchange))
            {
                Some(source) => source.keys.push((binding.key.clone(), start)),
                None => sources.push(Source {
                    exchange,
                    keys: vec![(binding.key.clone(), start)],
                }),
            }
        }

        let restored = restore_queue(&queue, marks, &mut report)?;
        orphan_missing_exchanges(vhost, &queue, &restored.referenced, &mut report)?;
        let last_indexed = restored.last_indexed;
        for source in &sources {
            catch_up(vhost, &queue, source, last_indexed.get(source.exchange.name()), &mut report)?;
        }
        vhost.install_queue(queue);
        report.queues += 1;
    }

    info!(
        vhost = vhost.name(),
        queues = report.queues,
        exchanges = report.exchanges,
        bindings = report.bindings,
        recovered = report.records_recovered,
        reindexed = report.records_reindexed,
        orphaned = report.exchanges_orphaned,
        "recovered virtual host"
    );
    Ok(report)
}

/// What reading a queue's index back produced.
struct Restored {
    /// Per exchange, the last body position indexed from its current
    /// incarnation.
    last_indexed: HashMap<String, Position>,
    /// Exchanges named by live records of the current incarnation.
    referenced: BTreeSet<String>,
}

/// Loads the queue's live records into its tracker.
fn restore_queue(
    queue: &Queue,
    marks: &BTreeMap<String, Position>,
    report: &mut RecoveryReport,
) -> CoreResult<Restored> {
    let retired = queue.index().load_retired()?;
    let mut live: Vec<IndexEntry> = Vec::new();
    let mut last_indexed: HashMap<String, Position> = HashMap::new();
    let mut referenced = BTreeSet::new();

    for entry in queue.index().read_from(Position::EARLIEST) {
        let entry = entry?;
        let exchange = &entry.record.exchange;
        let stale = marks
            .get(exchange)
            .is_some_and(|mark| entry.index_position < *mark);
        if !stale {
            let slot = last_indexed
                .entry(exchange.clone())
                .or_insert(entry.record.position);
            if entry.record.position > *slot {
                *slot = entry.record.position;
            }
        }
        if !retired.contains(&entry.index_position) {
            if !stale {
                referenced.insert(exchange.clone());
            }
            live.push(entry);
        }
    }

    report.records_recovered += live.len() as u64;
    queue.restore(live, true);
    Ok(Restored {
        last_indexed,
        referenced,
    })
}

/// Marks every referenced exchange that is no longer declared as deleted
/// for this queue, in memory and in the topology log.
fn orphan_missing_exchanges(
    vhost: &VirtualHost,
    queue: &Queue,
    referenced: &BTreeSet<String>,
    report: &mut RecoveryReport,
) -> CoreResult<()> {
    let missing: Vec<&String> = referenced
        .iter()
        .filter(|exchange| vhost.exchange(exchange).is_err())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mark = queue.index().end_position()?;
    for exchange in missing {
        queue.restore_orphan_mark(exchange, mark);
        vhost.record_topology(&TopologyRecord::ExchangeDeleted {
            name: exchange.clone(),
            marks: BTreeMap::from([(queue.name().to_string(), mark)]),
        })?;
        warn!(queue = queue.name(), exchange = %exchange, %mark, "records point at a lost exchange");
        report.exchanges_orphaned += 1;
    }
    Ok(())
}

fn catch_up(
    vhost: &VirtualHost,
    queue: &Arc<Queue>,
    source: &Source,
    last_indexed: Option<&Position>,
    report: &mut RecoveryReport,
) -> CoreResult<()> {
    let Some(earliest_start) = source.keys.iter().map(|(_, start)| *start).min() else {
        return Ok(());
    };
    let from = match last_indexed {
        Some(last) => last.successor().max(earliest_start),
        None => earliest_start,
    };

    let exchange = &source.exchange;
    let cursor = LogCursor::open(
        vhost.store().as_ref(),
        exchange.log_id(),
        from,
        vhost.config().read_batch_size,
    );
    for entry in cursor {
        let entry = entry?;
        let envelope = MessageEnvelope::decode(&entry.data)?;
        let matched = source.keys.iter().any(|(key, start)| {
            *start <= entry.position && binding_matches(exchange.kind(), key, &envelope.routing_key)
        });
        if matched {
            queue.enqueue(IndexRecord::new(exchange.name(), entry.position))?;
            report.records_reindexed += 1;
        }
    }
    Ok(())
}
