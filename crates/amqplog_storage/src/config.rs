//! Log store configuration.

/// Configuration for a [`SegmentedLogStore`](crate::SegmentedLogStore).
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    /// Entries per segment before a new segment is started.
    pub max_segment_entries: u64,

    /// Bytes per segment, framing included, before a new segment is started.
    pub max_segment_bytes: u64,

    /// Whether durable logs sync to disk on every append.
    pub sync_on_append: bool,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            max_segment_entries: 65_536,
            max_segment_bytes: 64 * 1024 * 1024, // 64 MB
            sync_on_append: true,
        }
    }
}

impl LogStoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the entry limit per segment.
    #[must_use]
    pub const fn max_segment_entries(mut self, entries: u64) -> Self {
        self.max_segment_entries = entries;
        self
    }

    /// Sets the byte limit per segment.
    #[must_use]
    pub const fn max_segment_bytes(mut self, bytes: u64) -> Self {
        self.max_segment_bytes = bytes;
        self
    }

    /// Sets whether durable appends are synced before returning.
    #[must_use]
    pub const fn sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = LogStoreConfig::default();
        assert!(config.sync_on_append);
        assert!(config.max_segment_entries > 0);
    }

    #[test]
    fn builder_pattern() {
        let config = LogStoreConfig::new()
            .max_segment_entries(3)
            .max_segment_bytes(1024)
            .sync_on_append(false);

        assert_eq!(config.max_segment_entries, 3);
        assert_eq!(config.max_segment_bytes, 1024);
        assert!(!config.sync_on_append);
    }
}
