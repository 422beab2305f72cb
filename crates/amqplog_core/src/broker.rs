//! Broker handle and virtual host registry.

use crate::config::BrokerConfig;
use crate::error::CoreResult;
use crate::vhost::VirtualHost;
use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Name of the default virtual host.
pub const DEFAULT_VHOST: &str = "/";

const TOPOLOGY_SUFFIX: &str = "/topology";

/// The main broker handle.
///
/// A broker owns one log store and the virtual hosts living in it. Virtual
/// hosts are opened on first use; with `recover_on_open`, every virtual host
/// that has a topology log in the store is opened and recovered eagerly.
///
/// # Example
///
/// ```rust,ignore
/// use amqplog_core::{Broker, BrokerConfig};
/// use amqplog_storage::LogStoreConfig;
///
/// let broker = Broker::open_dir("data", BrokerConfig::default(), LogStoreConfig::default())?;
/// let vhost = broker.default_vhost()?;
/// println!("{:?}", vhost.recovery_report());
/// ```
pub struct Broker {
    store: Arc<dyn LogStore>,
    config: BrokerConfig,
    vhosts: RwLock<HashMap<String, Arc<VirtualHost>>>,
}

impl Broker {
    /// Opens a broker on an existing store.
    ///
    /// # Errors
    ///
    /// Returns an error if listing the store or recovering a virtual host
    /// fails.
    pub fn open(store: Arc<dyn LogStore>, config: BrokerConfig) -> CoreResult<Self> {
        let broker = Self::new(store, config);
        if broker.config.recover_on_open {
            let mut names: Vec<String> = broker
                .store
                .list_logs()?
                .into_iter()
                .filter_map(|log| log.log_id.strip_suffix(TOPOLOGY_SUFFIX).map(str::to_string))
                .collect();
            names.sort();
            for name in names {
                broker.vhost(&name)?;
            }
            info!(vhosts = broker.vhosts.read().len(), "broker opened");
        }
        Ok(broker)
    }

    /// Creates a broker over a fresh in-memory store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(SegmentedLogStore::in_memory(LogStoreConfig::default())),
            BrokerConfig::default(),
        )
    }

    /// Opens a broker on a log directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the directory cannot be opened, or any
    /// recovery error.
    pub fn open_dir(
        path: impl AsRef<Path>,
        config: BrokerConfig,
        store_config: LogStoreConfig,
    ) -> CoreResult<Self> {
        let store = SegmentedLogStore::open_dir(path, store_config)?;
        Self::open(Arc::new(store), config)
    }

    fn new(store: Arc<dyn LogStore>, config: BrokerConfig) -> Self {
        Self {
            store,
            config,
            vhosts: RwLock::new(HashMap::new()),
        }
    }

    /// Returns a virtual host, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the virtual host cannot be opened or recovered.
    pub fn vhost(&self, name: &str) -> CoreResult<Arc<VirtualHost>> {
        if let Some(vhost) = self.vhosts.read().get(name) {
            return Ok(Arc::clone(vhost));
        }
        let mut vhosts = self.vhosts.write();
        if let Some(vhost) = vhosts.get(name) {
            return Ok(Arc::clone(vhost));
        }
        let vhost = VirtualHost::open(name, Arc::clone(&self.store), self.config.clone())?;
        vhosts.insert(name.to_string(), Arc::clone(&vhost));
        Ok(vhost)
    }

    /// Returns the default virtual host, `/`.
    ///
    /// # Errors
    ///
    /// As for [`vhost`](Self::vhost).
    pub fn default_vhost(&self) -> CoreResult<Arc<VirtualHost>> {
        self.vhost(DEFAULT_VHOST)
    }

    /// Names of the open virtual hosts, sorted.
    #[must_use]
    pub fn vhost_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.vhosts.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The log store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    /// Broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("vhosts", &self.vhost_names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueOptions;

    #[test]
    fn vhosts_are_opened_once() {
        let broker = Broker::in_memory();
        let a = broker.vhost("prod").unwrap();
        let b = broker.vhost("prod").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        broker.default_vhost().unwrap();
        assert_eq!(broker.vhost_names(), vec!["/", "prod"]);
    }

    #[test]
    fn vhosts_are_isolated() {
        let broker = Broker::in_memory();
        let prod = broker.vhost("prod").unwrap();
        let test = broker.vhost("test").unwrap();
        prod.declare_queue("q", QueueOptions::new(), None).unwrap();
        assert!(test.queue("q").unwrap_err().is_not_found());
    }

    #[test]
    fn reopening_a_directory_restores_vhosts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let broker =
                Broker::open_dir(dir.path(), BrokerConfig::default(), LogStoreConfig::default())
                    .unwrap();
            let vhost = broker.vhost("prod").unwrap();
            vhost.declare_queue("orders", QueueOptions::new(), None).unwrap();
        }

        let broker =
            Broker::open_dir(dir.path(), BrokerConfig::default(), LogStoreConfig::default()).unwrap();
        assert_eq!(broker.vhost_names(), vec!["prod"]);
        assert!(broker.vhost("prod").unwrap().queue("orders").is_ok());
    }

    #[test]
    fn recovery_can_be_disabled() {
        let dir = tempfile::tempdir().unwrap();
        {
            let broker =
                Broker::open_dir(dir.path(), BrokerConfig::default(), LogStoreConfig::default())
                    .unwrap();
            let vhost = broker.default_vhost().unwrap();
            vhost.declare_queue("orders", QueueOptions::new(), None).unwrap();
        }

        let config = BrokerConfig::new().recover_on_open(false);
        let broker = Broker::open_dir(dir.path(), config, LogStoreConfig::default()).unwrap();
        assert!(broker.vhost_names().is_empty());
        let vhost = broker.default_vhost().unwrap();
        assert!(vhost.queue_names().is_empty());
    }
}
