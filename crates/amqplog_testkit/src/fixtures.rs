//! Test fixtures and broker helpers.
//!
//! Provides convenience functions for setting up test brokers
//! and common test scenarios.

use amqplog_core::{Broker, BrokerConfig, Channel, VirtualHost};
use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// How long fixtures wait for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// How long fixtures wait to confirm that nothing arrives.
pub const QUIET_PERIOD: Duration = Duration::from_millis(50);

/// Segment size used by fixture stores, small enough that tests cross
/// segment boundaries.
pub const FIXTURE_SEGMENT_ENTRIES: u64 = 8;

/// A test broker with automatic cleanup.
pub struct TestBroker {
    /// The broker instance.
    pub broker: Broker,
    /// The store under the broker.
    pub store: Arc<dyn LogStore>,
    config: BrokerConfig,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestBroker {
    /// Creates a broker over a fresh in-memory store.
    pub fn memory() -> Self {
        Self::memory_with(BrokerConfig::default())
    }

    /// Creates an in-memory broker with a custom configuration.
    pub fn memory_with(config: BrokerConfig) -> Self {
        let store: Arc<dyn LogStore> = Arc::new(SegmentedLogStore::in_memory(store_config()));
        Self::over(store, config)
    }

    /// Creates a broker over a fresh temp-dir store.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = SegmentedLogStore::open_dir(temp_dir.path(), store_config())
            .expect("Failed to open log directory");
        let mut broker = Self::over(Arc::new(store), BrokerConfig::default());
        broker.temp_dir = Some(temp_dir);
        broker
    }

    /// Creates a broker over an existing store.
    pub fn over(store: Arc<dyn LogStore>, config: BrokerConfig) -> Self {
        let broker =
            Broker::open(Arc::clone(&store), config.clone()).expect("Failed to open broker");
        Self {
            broker,
            store,
            config,
            temp_dir: None,
        }
    }

    /// Drops the broker and opens a new one on the same data, as after a
    /// restart. A temp-dir store is reopened from disk.
    pub fn reopen(self) -> Self {
        let Self {
            broker,
            store,
            config,
            temp_dir,
        } = self;
        drop(broker);

        let store: Arc<dyn LogStore> = match &temp_dir {
            Some(dir) => {
                drop(store);
                Arc::new(
                    SegmentedLogStore::open_dir(dir.path(), store_config())
                        .expect("Failed to reopen log directory"),
                )
            }
            None => store,
        };
        let mut reopened = Self::over(store, config);
        reopened.temp_dir = temp_dir;
        reopened
    }

    /// Directory of a temp-dir store.
    pub fn path(&self) -> Option<&Path> {
        self.temp_dir.as_ref().map(TempDir::path)
    }

    /// The default virtual host.
    pub fn vhost(&self) -> Arc<VirtualHost> {
        self.broker
            .default_vhost()
            .expect("Failed to open default vhost")
    }

    /// Opens a channel on the default virtual host.
    pub fn channel(&self) -> Channel {
        Channel::open(&self.vhost())
    }
}

impl std::ops::Deref for TestBroker {
    type Target = Broker;

    fn deref(&self) -> &Self::Target {
        &self.broker
    }
}

fn store_config() -> LogStoreConfig {
    LogStoreConfig::new().max_segment_entries(FIXTURE_SEGMENT_ENTRIES)
}

/// Runs a test with a temporary in-memory broker.
///
/// # Example
///
/// ```rust,ignore
/// use amqplog_testkit::with_broker;
///
/// #[test]
/// fn my_test() {
///     with_broker(|broker| {
///         let vhost = broker.vhost();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_broker<F, R>(f: F) -> R
where
    F: FnOnce(&TestBroker) -> R,
{
    let broker = TestBroker::memory();
    f(&broker)
}

/// Runs a test with a channel on a temporary in-memory broker.
pub fn with_channel<F, R>(f: F) -> R
where
    F: FnOnce(&Channel) -> R,
{
    let broker = TestBroker::memory();
    let channel = broker.channel();
    f(&channel)
}

/// Test scenario helpers.
pub mod scenarios {
    use amqplog_codec::MessageProperties;
    use amqplog_core::{Channel, ExchangeOptions, ExchangeType, PublishReceipt, QueueOptions};

    /// Declares a durable exchange and queue and binds them with `key`.
    pub fn bound_queue(channel: &Channel, exchange: &str, kind: ExchangeType, queue: &str, key: &str) {
        channel
            .declare_exchange(exchange, kind, ExchangeOptions::new())
            .expect("Failed to declare exchange");
        channel
            .declare_queue(queue, QueueOptions::new())
            .expect("Failed to declare queue");
        channel
            .bind(queue, exchange, key)
            .expect("Failed to bind queue");
    }

    /// Declares a fanout exchange with `queues` bound to it and returns the
    /// queue names.
    pub fn fanout_with_queues(channel: &Channel, exchange: &str, queues: usize) -> Vec<String> {
        channel
            .declare_exchange(exchange, ExchangeType::Fanout, ExchangeOptions::new())
            .expect("Failed to declare exchange");
        (0..queues)
            .map(|i| {
                let name = format!("{exchange}.q{i}");
                channel
                    .declare_queue(&name, QueueOptions::new())
                    .expect("Failed to declare queue");
                channel.bind(&name, exchange, "").expect("Failed to bind queue");
                name
            })
            .collect()
    }

    /// Publishes a text body with default properties.
    pub fn publish_text(channel: &Channel, exchange: &str, key: &str, body: &str) -> PublishReceipt {
        channel
            .publish(exchange, key, MessageProperties::new(), body.as_bytes().to_vec())
            .expect("Failed to publish")
    }
}
