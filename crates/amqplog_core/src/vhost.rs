//! Virtual hosts: the exchange and queue directory.
//!
//! A virtual host owns a name→exchange map, a name→queue map and a durable
//! topology log. Declarations, deletions, binds and unbinds are serialized
//! per virtual host; publishes and deliveries only take per-entity locks.
//!
//! Logs are named after the virtual host:
//!
//! | Log | Id |
//! |-----|----|
//! | exchange bodies | `<vhost>/exchange/<name>` |
//! | queue index | `<vhost>/queue/<name>/index` |
//! | retired set | `<vhost>/queue/<name>/retired` |
//! | topology | `<vhost>/topology` |

use crate::config::BrokerConfig;
use crate::error::{CoreError, CoreResult};
use crate::exchange::Exchange;
use crate::queue::Queue;
use crate::recovery::{self, RecoveryReport};
use crate::stats::{BrokerStats, BrokerStatsSnapshot, QueueStatsSnapshot};
use crate::topology::{TopologyLog, TopologyRecord, TopologySnapshot};
use crate::types::{
    BindingInfo, ChannelId, ExchangeDeleteOptions, ExchangeOptions, ExchangeType, PublishReceipt,
    QueueDeclareOk, QueueDeleteOptions, QueueOptions,
};
use amqplog_codec::MessageProperties;
use amqplog_storage::LogStore;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Name of the default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

/// Prefix of server-reserved names.
pub const RESERVED_PREFIX: &str = "amq.";

/// Longest exchange or queue name accepted.
pub const MAX_NAME_LEN: usize = 255;

const PREDECLARED: [(&str, ExchangeType); 4] = [
    (DEFAULT_EXCHANGE, ExchangeType::Direct),
    ("amq.direct", ExchangeType::Direct),
    ("amq.fanout", ExchangeType::Fanout),
    ("amq.topic", ExchangeType::Topic),
];

/// Log id of an exchange's body log.
#[must_use]
pub fn exchange_log_id(vhost: &str, name: &str) -> String {
    format!("{vhost}/exchange/{name}")
}

/// Log id of a queue's index log.
#[must_use]
pub fn queue_index_log_id(vhost: &str, name: &str) -> String {
    format!("{vhost}/queue/{name}/index")
}

/// Log id of a queue's retired log.
#[must_use]
pub fn queue_retired_log_id(vhost: &str, name: &str) -> String {
    format!("{vhost}/queue/{name}/retired")
}

/// Log id of a virtual host's topology log.
#[must_use]
pub fn topology_log_id(vhost: &str) -> String {
    format!("{vhost}/topology")
}

/// State shared by every exchange and queue of a virtual host.
pub(crate) struct HostContext {
    pub(crate) vhost: String,
    pub(crate) store: Arc<dyn LogStore>,
    pub(crate) config: BrokerConfig,
    pub(crate) stats: BrokerStats,
}

/// A virtual host.
pub struct VirtualHost {
    host: Arc<HostContext>,
    exchanges: RwLock<HashMap<String, Arc<Exchange>>>,
    queues: RwLock<HashMap<String, Arc<Queue>>>,
    topology: TopologyLog,
    ddl: Mutex<()>,
    next_channel: AtomicU64,
    recovery: RecoveryReport,
}

impl VirtualHost {
    /// Opens a virtual host on `store`, replaying its topology and queue
    /// indexes unless `config.recover_on_open` is false.
    pub(crate) fn open(
        name: &str,
        store: Arc<dyn LogStore>,
        config: BrokerConfig,
    ) -> CoreResult<Arc<Self>> {
        let topology = TopologyLog::open(
            Arc::clone(&store),
            topology_log_id(name),
            config.read_batch_size,
        )?;
        let snapshot = if config.recover_on_open {
            topology.replay()?
        } else {
            topology.reset()?;
            TopologySnapshot::default()
        };

        let host = Arc::new(HostContext {
            vhost: name.to_string(),
            store,
            config,
            stats: BrokerStats::new(),
        });
        let mut vhost = Self {
            host,
            exchanges: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            topology,
            ddl: Mutex::new(()),
            next_channel: AtomicU64::new(1),
            recovery: RecoveryReport::default(),
        };

        for (exchange, kind) in PREDECLARED {
            let created = Exchange::create(Arc::clone(&vhost.host), exchange, kind, true, false)?;
            vhost.install_exchange(created);
        }
        vhost.recovery = recovery::recover(&vhost, &snapshot)?;
        Ok(Arc::new(vhost))
    }

    /// Virtual host name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.host.vhost
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.host.config
    }

    /// The underlying log store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.host.store
    }

    /// What was recovered when the virtual host was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Counter snapshot across every exchange and queue.
    #[must_use]
    pub fn stats(&self) -> BrokerStatsSnapshot {
        self.host.stats.snapshot()
    }

    /// Looks up an exchange.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it does not exist.
    pub fn exchange(&self, name: &str) -> CoreResult<Arc<Exchange>> {
        self.exchanges
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found("exchange", name))
    }

    /// Looks up a queue.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if it does not exist.
    pub fn queue(&self, name: &str) -> CoreResult<Arc<Queue>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_found("queue", name))
    }

    /// Exchange names, sorted.
    #[must_use]
    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.exchanges.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue names, sorted.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every explicit binding, sorted. The default exchange's implicit
    /// bindings are not listed.
    #[must_use]
    pub fn bindings(&self) -> Vec<BindingInfo> {
        let exchanges: Vec<Arc<Exchange>> = self.exchanges.read().values().cloned().collect();
        let mut bindings: Vec<BindingInfo> = exchanges
            .iter()
            .filter(|exchange| !exchange.is_default())
            .flat_map(|exchange| exchange.bindings())
            .collect();
        bindings.sort();
        bindings
    }

    /// Declares an exchange, or returns the existing one if it was declared
    /// with the same type and durability.
    ///
    /// # Errors
    ///
    /// - `Conflict` if it exists with a different type or durability
    /// - `NotFound` for a passive declare of a missing exchange
    /// - `AccessRefused` for a new name starting with `amq.`
    /// - `StoreUnavailable` if its log cannot be created
    pub fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeType,
        options: ExchangeOptions,
    ) -> CoreResult<Arc<Exchange>> {
        let _ddl = self.ddl.lock();
        if let Some(existing) = self.exchanges.read().get(name).cloned() {
            if !options.passive {
                if existing.kind() != kind {
                    return Err(CoreError::conflict(
                        "exchange",
                        name,
                        format!("declared as {}, requested {kind}", existing.kind()),
                    ));
                }
                if existing.durable() != options.durable {
                    return Err(CoreError::conflict(
                        "exchange",
                        name,
                        format!("durable is {}", existing.durable()),
                    ));
                }
            }
            return Ok(existing);
        }
        if options.passive {
            return Err(CoreError::not_found("exchange", name));
        }
        check_new_name("exchange", name)?;

        let exchange = Exchange::create(Arc::clone(&self.host), name, kind, options.durable, true)?;
        if options.durable {
            self.topology.append(&TopologyRecord::ExchangeDeclared {
                name: name.to_string(),
                kind,
            })?;
        }
        self.install_exchange(Arc::clone(&exchange));
        debug!(vhost = self.name(), exchange = name, %kind, durable = options.durable, "exchange declared");
        Ok(exchange)
    }

    /// Deletes an exchange with its bindings and body log.
    ///
    /// Queues keep records that point into the deleted log; those surface as
    /// `OrphanedIndex` when they would be delivered.
    ///
    /// # Errors
    ///
    /// - `AccessRefused` for the default and `amq.` exchanges
    /// - `ExchangeInUse` with `if_unused` while bindings exist
    /// - `NotFound` if missing and not `missing_ok`
    pub fn delete_exchange(&self, name: &str, options: ExchangeDeleteOptions) -> CoreResult<()> {
        let _ddl = self.ddl.lock();
        if is_reserved(name) {
            return Err(CoreError::access_refused(format!(
                "exchange '{name}' cannot be deleted"
            )));
        }
        let Some(exchange) = self.exchanges.read().get(name).cloned() else {
            if options.missing_ok {
                return Ok(());
            }
            return Err(CoreError::not_found("exchange", name));
        };
        exchange.delete(options.if_unused)?;
        self.exchanges.write().remove(name);

        let queues: Vec<Arc<Queue>> = self.queues.read().values().cloned().collect();
        let mut marks = BTreeMap::new();
        for queue in queues {
            if let Some(mark) = queue.mark_exchange_deleted(name)? {
                if is_recorded(&queue) {
                    marks.insert(queue.name().to_string(), mark);
                }
            }
        }
        if exchange.durable() {
            self.topology.append(&TopologyRecord::ExchangeDeleted {
                name: name.to_string(),
                marks,
            })?;
        }
        debug!(vhost = self.name(), exchange = name, "exchange deleted");
        Ok(())
    }

    /// Declares a queue, or returns the existing one if it was declared with
    /// the same flags. An empty name generates `amq.gen-<uuid>`.
    ///
    /// `owner` is the declaring channel; it owns the queue if exclusive.
    ///
    /// # Errors
    ///
    /// - `Conflict` if it exists with different flags
    /// - `NotFound` for a passive declare of a missing queue
    /// - `ResourceLocked` if it is exclusive to another channel
    /// - `AccessRefused` for a new name starting with `amq.`
    /// - `StoreUnavailable` if its logs cannot be created
    pub fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
        owner: Option<ChannelId>,
    ) -> CoreResult<QueueDeclareOk> {
        let _ddl = self.ddl.lock();
        let name = if name.is_empty() && !options.passive {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        if let Some(existing) = self.queues.read().get(&name).cloned() {
            existing.check_access(owner)?;
            if !options.passive {
                let current = existing.options();
                if (current.durable, current.exclusive, current.auto_delete)
                    != (options.durable, options.exclusive, options.auto_delete)
                {
                    return Err(CoreError::conflict(
                        "queue",
                        &name,
                        format!(
                            "declared with durable={}, exclusive={}, auto_delete={}",
                            current.durable, current.exclusive, current.auto_delete
                        ),
                    ));
                }
            }
            return Ok(declare_ok(&existing));
        }
        if options.passive {
            return Err(CoreError::not_found("queue", &name));
        }
        if !name.starts_with("amq.gen-") {
            check_new_name("queue", &name)?;
        }

        let queue = Queue::create(Arc::clone(&self.host), &name, options, owner, true)?;
        let default = self.exchange(DEFAULT_EXCHANGE)?;
        let default_start = match default.bind(&queue, &name)? {
            Some(start) => start,
            None => default.end_position()?,
        };

        if is_recorded(&queue) {
            let record = TopologyRecord::QueueDeclared {
                name: name.clone(),
                auto_delete: options.auto_delete,
                default_start,
            };
            if let Err(e) = self.topology.append(&record) {
                default.remove_queue(&name);
                if let Err(cleanup) = queue.delete(QueueDeleteOptions::default()) {
                    warn!(vhost = self.name(), queue = %name, error = %cleanup, "failed to clean up queue after declare error");
                }
                return Err(e);
            }
        }

        self.queues.write().insert(name.clone(), Arc::clone(&queue));
        debug!(vhost = self.name(), queue = %name, ?options, "queue declared");
        Ok(declare_ok(&queue))
    }

    /// Deletes a queue and returns the number of records it discarded.
    ///
    /// # Errors
    ///
    /// - `NotFound` if it does not exist
    /// - `QueueInUse` with `if_unused` while consumers are attached
    /// - `QueueNotEmpty` with `if_empty` while records are outstanding
    pub fn delete_queue(&self, name: &str, options: QueueDeleteOptions) -> CoreResult<u64> {
        let _ddl = self.ddl.lock();
        let queue = self.queue(name)?;
        self.delete_queue_locked(&queue, options)
    }

    fn delete_queue_locked(&self, queue: &Arc<Queue>, options: QueueDeleteOptions) -> CoreResult<u64> {
        let name = queue.name();
        let discarded = queue.delete(options)?;

        let exchanges: Vec<Arc<Exchange>> = self.exchanges.read().values().cloned().collect();
        for exchange in exchanges {
            exchange.remove_queue(name);
        }
        self.queues.write().remove(name);

        if is_recorded(queue) {
            self.topology.append(&TopologyRecord::QueueDeleted {
                name: name.to_string(),
            })?;
        }
        debug!(vhost = self.name(), queue = name, discarded, "queue deleted");
        Ok(discarded)
    }

    /// Retires every ready record of a queue and returns how many.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` or `StoreUnavailable`.
    pub fn purge_queue(&self, name: &str) -> CoreResult<u64> {
        self.queue(name)?.purge()
    }

    /// Counter snapshot of one queue.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue does not exist.
    pub fn queue_stats(&self, name: &str) -> CoreResult<QueueStatsSnapshot> {
        Ok(self.queue(name)?.stats())
    }

    /// Binds a queue to an exchange. Binding twice is a no-op.
    ///
    /// # Errors
    ///
    /// - `AccessRefused` for the default exchange
    /// - `NotFound` if either end is missing
    pub fn bind(&self, queue: &str, exchange: &str, key: &str) -> CoreResult<()> {
        let _ddl = self.ddl.lock();
        let (exchange, queue) = self.binding_ends(queue, exchange)?;
        let Some(start) = exchange.bind(&queue, key)? else {
            return Ok(());
        };
        if exchange.durable() && is_recorded(&queue) {
            self.topology.append(&TopologyRecord::Bound {
                exchange: exchange.name().to_string(),
                queue: queue.name().to_string(),
                key: key.to_string(),
                start,
            })?;
        }
        Ok(())
    }

    /// Removes a binding. Removing a missing binding is a no-op.
    ///
    /// # Errors
    ///
    /// - `AccessRefused` for the default exchange
    /// - `NotFound` if either end is missing
    pub fn unbind(&self, queue: &str, exchange: &str, key: &str) -> CoreResult<()> {
        let _ddl = self.ddl.lock();
        let (exchange, queue) = self.binding_ends(queue, exchange)?;
        if exchange.unbind(queue.name(), key) && exchange.durable() && is_recorded(&queue) {
            self.topology.append(&TopologyRecord::Unbound {
                exchange: exchange.name().to_string(),
                queue: queue.name().to_string(),
                key: key.to_string(),
            })?;
        }
        Ok(())
    }

    fn binding_ends(&self, queue: &str, exchange: &str) -> CoreResult<(Arc<Exchange>, Arc<Queue>)> {
        if exchange == DEFAULT_EXCHANGE {
            return Err(CoreError::access_refused(
                "the default exchange cannot be bound or unbound explicitly",
            ));
        }
        Ok((self.exchange(exchange)?, self.queue(queue)?))
    }

    /// Publishes a message to an exchange.
    ///
    /// # Errors
    ///
    /// As for [`Exchange::publish`], plus `NotFound` if the exchange does
    /// not exist.
    pub fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> CoreResult<PublishReceipt> {
        self.exchange(exchange)?
            .publish(routing_key, properties, body)
    }

    pub(crate) fn host(&self) -> &Arc<HostContext> {
        &self.host
    }

    pub(crate) fn record_topology(&self, record: &TopologyRecord) -> CoreResult<()> {
        self.topology.append(record)?;
        Ok(())
    }

    pub(crate) fn install_exchange(&self, exchange: Arc<Exchange>) {
        self.exchanges
            .write()
            .insert(exchange.name().to_string(), exchange);
    }

    pub(crate) fn install_queue(&self, queue: Arc<Queue>) {
        self.queues.write().insert(queue.name().to_string(), queue);
    }

    pub(crate) fn register_channel(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::SeqCst))
    }

    /// Deletes an exclusive auto-delete queue that lost its last consumer,
    /// unless it was replaced, gained a consumer or received records in the
    /// meantime.
    pub(crate) fn auto_delete_queue(&self, queue: &Arc<Queue>) -> CoreResult<()> {
        let _ddl = self.ddl.lock();
        let current = self.queues.read().get(queue.name()).cloned();
        if !current.is_some_and(|current| Arc::ptr_eq(&current, queue)) {
            return Ok(());
        }
        let options = QueueDeleteOptions {
            if_unused: true,
            if_empty: true,
        };
        match self.delete_queue_locked(queue, options) {
            Ok(_)
            | Err(
                CoreError::QueueInUse { .. }
                | CoreError::QueueNotEmpty { .. }
                | CoreError::NotFound { .. },
            ) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Deletes the exclusive queues owned by a closing channel.
    pub(crate) fn release_channel(&self, channel: ChannelId) -> CoreResult<()> {
        let _ddl = self.ddl.lock();
        let owned: Vec<Arc<Queue>> = self
            .queues
            .read()
            .values()
            .filter(|queue| queue.owner() == Some(channel))
            .cloned()
            .collect();
        for queue in owned {
            match self.delete_queue_locked(&queue, QueueDeleteOptions::default()) {
                Ok(_) | Err(CoreError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHost")
            .field("name", &self.host.vhost)
            .field("exchanges", &self.exchanges.read().len())
            .field("queues", &self.queues.read().len())
            .finish_non_exhaustive()
    }
}

fn is_reserved(name: &str) -> bool {
    name == DEFAULT_EXCHANGE || name.starts_with(RESERVED_PREFIX)
}

/// Whether a queue's lifecycle goes to the topology log.
fn is_recorded(queue: &Queue) -> bool {
    queue.durable() && !queue.options().exclusive
}

fn check_new_name(kind: &'static str, name: &str) -> CoreResult<()> {
    if name.starts_with(RESERVED_PREFIX) {
        return Err(CoreError::access_refused(format!(
            "{kind} name '{name}' uses the reserved prefix '{RESERVED_PREFIX}'"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::invalid_operation(format!(
            "{kind} name is {} bytes, limit is {MAX_NAME_LEN}",
            name.len()
        )));
    }
    Ok(())
}

fn declare_ok(queue: &Queue) -> QueueDeclareOk {
    QueueDeclareOk {
        queue: queue.name().to_string(),
        message_count: queue.message_count(),
        consumer_count: queue.consumer_count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::channel::{Channel, ConsumeOptions};

    fn vhost() -> Arc<VirtualHost> {
        Broker::in_memory().default_vhost().unwrap()
    }

    fn props() -> MessageProperties {
        MessageProperties::new()
    }

    #[test]
    fn log_ids() {
        assert_eq!(exchange_log_id("/", "orders"), "//exchange/orders");
        assert_eq!(queue_index_log_id("prod", "q"), "prod/queue/q/index");
        assert_eq!(queue_retired_log_id("prod", "q"), "prod/queue/q/retired");
        assert_eq!(topology_log_id("prod"), "prod/topology");
    }

    #[test]
    fn predeclared_exchanges_exist() {
        let vhost = vhost();
        assert_eq!(
            vhost.exchange_names(),
            vec!["", "amq.direct", "amq.fanout", "amq.topic"]
        );
        assert_eq!(vhost.exchange("amq.topic").unwrap().kind(), ExchangeType::Topic);
    }

    #[test]
    fn redeclare_is_idempotent_and_conflicts_are_reported() {
        let vhost = vhost();
        let options = ExchangeOptions::new();
        vhost
            .declare_exchange("ex", ExchangeType::Direct, options)
            .unwrap();
        vhost
            .declare_exchange("ex", ExchangeType::Direct, options)
            .unwrap();
        assert!(matches!(
            vhost.declare_exchange("ex", ExchangeType::Fanout, options),
            Err(CoreError::Conflict { .. })
        ));
        assert!(matches!(
            vhost.declare_exchange("ex", ExchangeType::Direct, options.durable(false)),
            Err(CoreError::Conflict { .. })
        ));

        vhost.declare_queue("q", QueueOptions::new(), None).unwrap();
        assert!(matches!(
            vhost.declare_queue("q", QueueOptions::new().auto_delete(true), None),
            Err(CoreError::Conflict { .. })
        ));
    }

    #[test]
    fn passive_declares_require_existence() {
        let vhost = vhost();
        assert!(vhost
            .declare_exchange("nope", ExchangeType::Direct, ExchangeOptions::new().passive(true))
            .unwrap_err()
            .is_not_found());
        assert!(vhost
            .declare_queue("nope", QueueOptions::new().passive(true), None)
            .unwrap_err()
            .is_not_found());

        vhost.declare_queue("q", QueueOptions::new(), None).unwrap();
        let ok = vhost
            .declare_queue("q", QueueOptions::new().durable(false).passive(true), None)
            .unwrap();
        assert_eq!(ok.queue, "q");
    }

    #[test]
    fn reserved_names_are_refused() {
        let vhost = vhost();
        assert!(matches!(
            vhost.declare_exchange("amq.custom", ExchangeType::Direct, ExchangeOptions::new()),
            Err(CoreError::AccessRefused { .. })
        ));
        assert!(matches!(
            vhost.delete_exchange("", ExchangeDeleteOptions::default()),
            Err(CoreError::AccessRefused { .. })
        ));
        vhost.declare_queue("q", QueueOptions::new(), None).unwrap();
        assert!(matches!(
            vhost.bind("q", "", "q"),
            Err(CoreError::AccessRefused { .. })
        ));
        assert!(matches!(
            vhost.unbind("q", "", "q"),
            Err(CoreError::AccessRefused { .. })
        ));
    }

    #[test]
    fn default_exchange_routes_by_queue_name() {
        let vhost = vhost();
        vhost.declare_queue("jobs", QueueOptions::new(), None).unwrap();
        let receipt = vhost.publish("", "jobs", props(), b"run".to_vec()).unwrap();
        assert_eq!(receipt.routed, 1);
        let unroutable = vhost.publish("", "nobody", props(), b"lost".to_vec()).unwrap();
        assert_eq!(unroutable.routed, 0);
        assert_eq!(vhost.queue("jobs").unwrap().message_count(), 1);
        assert_eq!(vhost.stats().unroutable, 1);
    }

    #[test]
    fn server_named_queue() {
        let vhost = vhost();
        let ok = vhost
            .declare_queue("", QueueOptions::server_named(), Some(ChannelId(1)))
            .unwrap();
        assert!(ok.queue.starts_with("amq.gen-"));
        assert_eq!(vhost.queue(&ok.queue).unwrap().owner(), Some(ChannelId(1)));
    }

    #[test]
    fn delete_exchange_modes() {
        let vhost = vhost();
        vhost
            .declare_exchange("ex", ExchangeType::Fanout, ExchangeOptions::new())
            .unwrap();
        vhost.declare_queue("q", QueueOptions::new(), None).unwrap();
        vhost.bind("q", "ex", "").unwrap();

        let if_unused = ExchangeDeleteOptions {
            if_unused: true,
            missing_ok: false,
        };
        assert!(matches!(
            vhost.delete_exchange("ex", if_unused),
            Err(CoreError::ExchangeInUse { .. })
        ));
        vhost.unbind("q", "ex", "").unwrap();
        vhost.unbind("q", "ex", "").unwrap();
        vhost.delete_exchange("ex", if_unused).unwrap();

        assert!(vhost
            .delete_exchange("ex", ExchangeDeleteOptions::default())
            .unwrap_err()
            .is_not_found());
        let missing_ok = ExchangeDeleteOptions {
            if_unused: false,
            missing_ok: true,
        };
        vhost.delete_exchange("ex", missing_ok).unwrap();
    }

    #[test]
    fn delete_queue_modes() {
        let vhost = vhost();
        vhost.declare_queue("q", QueueOptions::new(), None).unwrap();
        vhost.publish("", "q", props(), b"a".to_vec()).unwrap();

        let if_empty = QueueDeleteOptions {
            if_unused: false,
            if_empty: true,
        };
        assert!(matches!(
            vhost.delete_queue("q", if_empty),
            Err(CoreError::QueueNotEmpty { messages: 1, .. })
        ));
        assert_eq!(vhost.delete_queue("q", QueueDeleteOptions::default()).unwrap(), 1);
        assert!(vhost.queue("q").unwrap_err().is_not_found());
        assert!(!vhost.store().log_exists(&queue_index_log_id("/", "q")));
    }

    #[test]
    fn deleting_a_queue_cancels_its_consumers() {
        let vhost = vhost();
        let channel = Channel::open(&vhost);
        channel.declare_queue("q", QueueOptions::new()).unwrap();
        let consumer = channel.consume("q", ConsumeOptions::new()).unwrap();

        let in_use = QueueDeleteOptions {
            if_unused: true,
            if_empty: false,
        };
        assert!(matches!(
            vhost.delete_queue("q", in_use),
            Err(CoreError::QueueInUse { consumers: 1, .. })
        ));
        vhost.delete_queue("q", QueueDeleteOptions::default()).unwrap();

        let event = consumer.recv_timeout(std::time::Duration::from_secs(1));
        assert!(matches!(
            event,
            Some(crate::channel::ChannelEvent::Cancelled { reason: CoreError::NotFound { .. }, .. })
        ));
    }

    #[test]
    fn exclusive_auto_delete_queue_goes_with_last_consumer() {
        let vhost = vhost();
        let channel = Channel::open(&vhost);
        channel
            .declare_queue("temp", QueueOptions::new().exclusive(true).auto_delete(true))
            .unwrap();
        let first = channel.consume("temp", ConsumeOptions::new()).unwrap();
        let second = channel.consume("temp", ConsumeOptions::new()).unwrap();

        channel.cancel(&first.tag).unwrap();
        assert!(vhost.queue("temp").is_ok());
        channel.cancel(&second.tag).unwrap();
        assert!(vhost.queue("temp").unwrap_err().is_not_found());
    }

    #[test]
    fn shared_auto_delete_queue_survives_last_consumer() {
        let vhost = vhost();
        let channel = Channel::open(&vhost);
        channel
            .declare_queue("shared", QueueOptions::new().durable(false).auto_delete(true))
            .unwrap();
        let consumer = channel.consume("shared", ConsumeOptions::new()).unwrap();
        channel.cancel(&consumer.tag).unwrap();
        assert!(vhost.queue("shared").is_ok());
    }
}
