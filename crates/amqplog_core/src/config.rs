//! Broker configuration.

/// Where a requeued record is offered again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequeuePolicy {
    /// Ahead of every pending record: the next delivery is the requeued one.
    #[default]
    Head,
    /// Behind every pending record.
    Tail,
}

/// Configuration for a [`Broker`](crate::Broker) and its virtual hosts.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Placement of requeued records, applied to every queue.
    pub requeue_policy: RequeuePolicy,

    /// Prefetch for channels that never call `qos` (0 = unlimited).
    pub default_prefetch: u16,

    /// Entries fetched per read when scanning index and exchange logs.
    pub read_batch_size: usize,

    /// Whether opening a virtual host replays its topology and queue indexes.
    /// When false the virtual host starts empty and persisted topology is
    /// discarded.
    pub recover_on_open: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            requeue_policy: RequeuePolicy::Head,
            default_prefetch: 0,
            read_batch_size: 256,
            recover_on_open: true,
        }
    }
}

impl BrokerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the requeue policy.
    #[must_use]
    pub const fn requeue_policy(mut self, policy: RequeuePolicy) -> Self {
        self.requeue_policy = policy;
        self
    }

    /// Sets the default per-consumer prefetch.
    #[must_use]
    pub const fn default_prefetch(mut self, prefetch: u16) -> Self {
        self.default_prefetch = prefetch;
        self
    }

    /// Sets the log read batch size.
    #[must_use]
    pub const fn read_batch_size(mut self, size: usize) -> Self {
        self.read_batch_size = size;
        self
    }

    /// Sets whether recovery runs on open.
    #[must_use]
    pub const fn recover_on_open(mut self, value: bool) -> Self {
        self.recover_on_open = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.requeue_policy, RequeuePolicy::Head);
        assert_eq!(config.default_prefetch, 0);
        assert!(config.recover_on_open);
    }

    #[test]
    fn builder_pattern() {
        let config = BrokerConfig::new()
            .requeue_policy(RequeuePolicy::Tail)
            .default_prefetch(10)
            .read_batch_size(8)
            .recover_on_open(false);

        assert_eq!(config.requeue_policy, RequeuePolicy::Tail);
        assert_eq!(config.default_prefetch, 10);
        assert_eq!(config.read_batch_size, 8);
        assert!(!config.recover_on_open);
    }
}
