//! Durable topology log.
//!
//! Every declaration, deletion, binding and unbinding of a durable entity is
//! appended to the virtual host's topology log as one CBOR record. Replaying
//! the log in order rebuilds the durable exchanges, queues and bindings.

use crate::error::CoreResult;
use crate::types::{BindingInfo, ExchangeType};
use amqplog_codec::{from_cbor, to_cbor, Position};
use amqplog_storage::{LogCursor, LogStore, StorageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One topology change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopologyRecord {
    /// A durable exchange was declared.
    ExchangeDeclared {
        /// Exchange name.
        name: String,
        /// Routing strategy.
        kind: ExchangeType,
    },
    /// A durable exchange was deleted, or recovery found live records of a
    /// queue pointing at an exchange that did not survive the restart.
    ExchangeDeleted {
        /// Exchange name.
        name: String,
        /// Per queue, the index end position at deletion time. Records below
        /// it that point at this exchange are orphaned.
        marks: BTreeMap<String, Position>,
    },
    /// A durable queue was declared.
    QueueDeclared {
        /// Queue name.
        name: String,
        /// Deleted when its last consumer is cancelled.
        auto_delete: bool,
        /// End of the default exchange log at declare time.
        default_start: Position,
    },
    /// A durable queue was deleted.
    QueueDeleted {
        /// Queue name.
        name: String,
    },
    /// A binding between durable entities was added.
    Bound {
        /// Exchange name.
        exchange: String,
        /// Queue name.
        queue: String,
        /// Binding key.
        key: String,
        /// End of the exchange log at bind time.
        start: Position,
    },
    /// A binding was removed.
    Unbound {
        /// Exchange name.
        exchange: String,
        /// Queue name.
        queue: String,
        /// Binding key.
        key: String,
    },
}

/// A durable queue as known to the topology log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueRecord {
    /// Deleted when its last consumer is cancelled.
    pub auto_delete: bool,
    /// End of the default exchange log at declare time.
    pub default_start: Position,
}

/// Durable topology after replay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    /// Durable exchanges by name.
    pub exchanges: BTreeMap<String, ExchangeType>,
    /// Durable queues by name.
    pub queues: BTreeMap<String, QueueRecord>,
    /// Bindings with the exchange position they took effect at.
    pub bindings: BTreeMap<BindingInfo, Position>,
    /// Per queue, per deleted exchange, the index position below which
    /// records from that exchange are orphaned.
    pub orphan_marks: BTreeMap<String, BTreeMap<String, Position>>,
}

impl TopologySnapshot {
    /// Applies one record.
    pub fn apply(&mut self, record: TopologyRecord) {
        match record {
            TopologyRecord::ExchangeDeclared { name, kind } => {
                self.exchanges.insert(name, kind);
            }
            TopologyRecord::ExchangeDeleted { name, marks } => {
                self.exchanges.remove(&name);
                self.bindings.retain(|binding, _| binding.exchange != name);
                for (queue, mark) in marks {
                    if !self.queues.contains_key(&queue) {
                        continue;
                    }
                    let slot = self
                        .orphan_marks
                        .entry(queue)
                        .or_default()
                        .entry(name.clone())
                        .or_insert(mark);
                    if mark > *slot {
                        *slot = mark;
                    }
                }
            }
            TopologyRecord::QueueDeclared {
                name,
                auto_delete,
                default_start,
            } => {
                self.orphan_marks.remove(&name);
                self.queues.insert(
                    name,
                    QueueRecord {
                        auto_delete,
                        default_start,
                    },
                );
            }
            TopologyRecord::QueueDeleted { name } => {
                self.queues.remove(&name);
                self.orphan_marks.remove(&name);
                self.bindings.retain(|binding, _| binding.queue != name);
            }
            TopologyRecord::Bound {
                exchange,
                queue,
                key,
                start,
            } => {
                self.bindings
                    .entry(BindingInfo {
                        exchange,
                        queue,
                        key,
                    })
                    .or_insert(start);
            }
            TopologyRecord::Unbound {
                exchange,
                queue,
                key,
            } => {
                self.bindings.remove(&BindingInfo {
                    exchange,
                    queue,
                    key,
                });
            }
        }
    }

    /// Bindings of one queue, with their start positions.
    pub fn bindings_of<'a>(
        &'a self,
        queue: &'a str,
    ) -> impl Iterator<Item = (&'a BindingInfo, Position)> + 'a {
        self.bindings
            .iter()
            .filter(move |(binding, _)| binding.queue == queue)
            .map(|(binding, start)| (binding, *start))
    }
}

/// Handle to a virtual host's topology log.
pub struct TopologyLog {
    store: Arc<dyn LogStore>,
    log_id: String,
    batch_size: usize,
}

impl TopologyLog {
    /// Opens the log, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn open(
        store: Arc<dyn LogStore>,
        log_id: impl Into<String>,
        batch_size: usize,
    ) -> CoreResult<Self> {
        let log = Self {
            store,
            log_id: log_id.into(),
            batch_size,
        };
        log.store.create_log(&log.log_id, true)?;
        Ok(log)
    }

    /// Identifier of the log.
    #[must_use]
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Discards every record.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn reset(&self) -> CoreResult<()> {
        match self.store.delete_log(&self.log_id) {
            Ok(()) | Err(StorageError::LogNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.store.create_log(&self.log_id, true)?;
        Ok(())
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns `Codec` or `StoreUnavailable` on failure.
    pub fn append(&self, record: &TopologyRecord) -> CoreResult<Position> {
        let bytes = to_cbor(record)?;
        Ok(self.store.append(&self.log_id, &bytes)?)
    }

    /// Reads every record in order.
    ///
    /// # Errors
    ///
    /// Returns `Codec` or `StoreUnavailable` on failure.
    pub fn records(&self) -> CoreResult<Vec<TopologyRecord>> {
        LogCursor::open(
            self.store.as_ref(),
            self.log_id.as_str(),
            Position::EARLIEST,
            self.batch_size,
        )
        .map(|entry| -> CoreResult<TopologyRecord> { Ok(from_cbor(&entry?.data)?) })
        .collect()
    }

    /// Replays every record.
    ///
    /// # Errors
    ///
    /// Returns `Codec` or `StoreUnavailable` on failure.
    pub fn replay(&self) -> CoreResult<TopologySnapshot> {
        let mut snapshot = TopologySnapshot::default();
        for record in self.records()? {
            snapshot.apply(record);
        }
        Ok(snapshot)
    }
}

impl std::fmt::Debug for TopologyLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyLog")
            .field("log_id", &self.log_id)
            .finish_non_exhaustive()
    }
}
