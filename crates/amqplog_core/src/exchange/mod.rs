//! Exchanges: a body log plus a routing table.
//!
//! Publishing appends the message envelope to the exchange log, then appends
//! one index record to every matched queue. The routing table lock is held
//! across both steps, so:
//!
//! - index records reach any one queue in publish order
//! - bind and unbind are linearizable with publishes: a publish sees a
//!   binding completely or not at all

mod routing;
mod topic;

pub use routing::binding_matches;
pub use topic::topic_matches;

use crate::error::{CoreError, CoreResult, RoutingFailure};
use crate::queue::Queue;
use crate::types::{BindingInfo, ExchangeType, PublishReceipt};
use crate::vhost::{exchange_log_id, HostContext};
use amqplog_codec::{IndexRecord, MessageEnvelope, MessageProperties, Position};
use amqplog_storage::StorageError;
use parking_lot::Mutex;
use routing::RoutingTable;
use std::sync::Arc;
use tracing::{debug, warn};

struct ExchangeState {
    routes: RoutingTable<Arc<Queue>>,
    deleted: bool,
}

/// A named exchange.
pub struct Exchange {
    name: String,
    kind: ExchangeType,
    durable: bool,
    log_id: String,
    host: Arc<HostContext>,
    state: Mutex<ExchangeState>,
}

impl Exchange {
    /// Creates the exchange and its log. With `reset`, an existing log of
    /// the same name is discarded first.
    pub(crate) fn create(
        host: Arc<HostContext>,
        name: &str,
        kind: ExchangeType,
        durable: bool,
        reset: bool,
    ) -> CoreResult<Arc<Self>> {
        let log_id = exchange_log_id(&host.vhost, name);
        if reset {
            match host.store.delete_log(&log_id) {
                Ok(()) | Err(StorageError::LogNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        host.store.create_log(&log_id, durable)?;

        Ok(Arc::new(Self {
            name: name.to_string(),
            kind,
            durable,
            log_id,
            host,
            state: Mutex::new(ExchangeState {
                routes: RoutingTable::new(),
                deleted: false,
            }),
        }))
    }

    /// Exchange name; empty for the default exchange.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routing strategy.
    #[must_use]
    pub fn kind(&self) -> ExchangeType {
        self.kind
    }

    /// Whether the exchange survives a restart.
    #[must_use]
    pub fn durable(&self) -> bool {
        self.durable
    }

    /// Identifier of the body log.
    #[must_use]
    pub fn log_id(&self) -> &str {
        &self.log_id
    }

    /// Whether this is the default exchange.
    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name.is_empty()
    }

    /// Position the next published body will receive.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn end_position(&self) -> CoreResult<Position> {
        Ok(self.host.store.end_position(&self.log_id)?)
    }

    /// Current bindings.
    #[must_use]
    pub fn bindings(&self) -> Vec<BindingInfo> {
        self.state
            .lock()
            .routes
            .bindings()
            .into_iter()
            .map(|(queue, key)| BindingInfo {
                exchange: self.name.clone(),
                queue,
                key,
            })
            .collect()
    }

    /// Appends the message to the exchange log and indexes it into every
    /// matched queue.
    ///
    /// The body is durable once this returns, whatever the routing outcome.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the exchange was deleted
    /// - `StoreUnavailable` if the body append fails; nothing was routed
    /// - `PartialRouting` if some matched queues could not be indexed; the
    ///   others were
    pub fn publish(
        &self,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> CoreResult<PublishReceipt> {
        let envelope = MessageEnvelope::new(routing_key, properties, body).encode()?;

        let state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("exchange", &self.name));
        }
        let position = self.host.store.append(&self.log_id, &envelope)?;

        let mut routed = 0;
        let mut failures = Vec::new();
        for (queue_name, queue) in state.routes.route(self.kind, routing_key) {
            match queue.enqueue(IndexRecord::new(self.name.as_str(), position)) {
                Ok(_) => routed += 1,
                Err(CoreError::NotFound { .. }) => {
                    debug!(exchange = %self.name, queue = queue_name, "skipped queue deleted during publish");
                }
                Err(error) => {
                    warn!(exchange = %self.name, queue = queue_name, %position, %error, "failed to index message");
                    self.host.stats.record_routing_failure();
                    failures.push(RoutingFailure {
                        queue: queue_name.to_string(),
                        error,
                    });
                }
            }
        }
        drop(state);

        self.host.stats.record_publish(routed);
        if failures.is_empty() {
            Ok(PublishReceipt { position, routed })
        } else {
            Err(CoreError::PartialRouting {
                exchange: self.name.clone(),
                position,
                routed,
                failures,
            })
        }
    }

    /// Adds a binding. Returns the end of the exchange log at bind time if
    /// the binding is new, `None` if it already existed.
    pub(crate) fn bind(&self, queue: &Arc<Queue>, key: &str) -> CoreResult<Option<Position>> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("exchange", &self.name));
        }
        if !state.routes.bind(queue.name(), queue, key) {
            return Ok(None);
        }
        debug!(exchange = %self.name, queue = queue.name(), key, "bound");
        Ok(Some(self.end_position()?))
    }

    /// Restores a binding without touching the log.
    pub(crate) fn restore_binding(&self, queue: &Arc<Queue>, key: &str) {
        self.state.lock().routes.bind(queue.name(), queue, key);
    }

    /// Removes a binding. Returns `false` if it did not exist.
    pub(crate) fn unbind(&self, queue: &str, key: &str) -> bool {
        let removed = self.state.lock().routes.unbind(queue, key);
        if removed {
            debug!(exchange = %self.name, queue, key, "unbound");
        }
        removed
    }

    /// Removes every binding of a deleted queue.
    pub(crate) fn remove_queue(&self, queue: &str) {
        self.state.lock().routes.remove_queue(queue);
    }

    /// Marks the exchange deleted and drops its log.
    pub(crate) fn delete(&self, if_unused: bool) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.deleted {
            return Err(CoreError::not_found("exchange", &self.name));
        }
        if if_unused && !state.routes.is_empty() {
            return Err(CoreError::ExchangeInUse {
                name: self.name.clone(),
            });
        }
        state.deleted = true;
        state.routes.clear();
        match self.host.store.delete_log(&self.log_id) {
            Ok(()) | Err(StorageError::LogNotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}
