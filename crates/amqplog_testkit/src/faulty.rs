//! Fault-injecting log store.
//!
//! Wraps another [`LogStore`] and fails selected operations with
//! [`StorageError::Unavailable`], so tests can drive per-queue routing
//! failures and store outages without touching the real store.

use amqplog_codec::Position;
use amqplog_storage::{LogEntry, LogInfo, LogStore, StorageError, StorageResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// A log store that fails appends and reads on demand.
pub struct FaultyLogStore {
    inner: Arc<dyn LogStore>,
    failing_appends: Mutex<HashSet<String>>,
    failing_reads: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    injected: AtomicUsize,
}

impl FaultyLogStore {
    /// Wraps a store; nothing fails until configured.
    pub fn new(inner: Arc<dyn LogStore>) -> Self {
        Self {
            inner,
            failing_appends: Mutex::new(HashSet::new()),
            failing_reads: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            injected: AtomicUsize::new(0),
        }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &Arc<dyn LogStore> {
        &self.inner
    }

    /// Makes appends to `log_id` fail.
    pub fn fail_appends_to(&self, log_id: impl Into<String>) {
        self.failing_appends.lock().insert(log_id.into());
    }

    /// Makes reads of `log_id` fail.
    pub fn fail_reads_of(&self, log_id: impl Into<String>) {
        self.failing_reads.lock().insert(log_id.into());
    }

    /// Makes every operation fail.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.fail_all.store(unavailable, Ordering::SeqCst);
    }

    /// Clears every injected fault.
    pub fn heal(&self) {
        self.failing_appends.lock().clear();
        self.failing_reads.lock().clear();
        self.fail_all.store(false, Ordering::SeqCst);
    }

    /// Number of operations failed so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn check(&self, log_id: &str, targeted: &Mutex<HashSet<String>>) -> StorageResult<()> {
        if self.fail_all.load(Ordering::SeqCst) || targeted.lock().contains(log_id) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Unavailable(format!(
                "injected fault on {log_id}"
            )));
        }
        Ok(())
    }

    fn check_all(&self) -> StorageResult<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StorageError::Unavailable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl LogStore for FaultyLogStore {
    fn create_log(&self, log_id: &str, durable: bool) -> StorageResult<()> {
        self.check_all()?;
        self.inner.create_log(log_id, durable)
    }

    fn delete_log(&self, log_id: &str) -> StorageResult<()> {
        self.check_all()?;
        self.inner.delete_log(log_id)
    }

    fn list_logs(&self) -> StorageResult<Vec<LogInfo>> {
        self.check_all()?;
        self.inner.list_logs()
    }

    fn log_exists(&self, log_id: &str) -> bool {
        self.inner.log_exists(log_id)
    }

    fn append(&self, log_id: &str, data: &[u8]) -> StorageResult<Position> {
        self.check(log_id, &self.failing_appends)?;
        self.inner.append(log_id, data)
    }

    fn read_from(&self, log_id: &str, from: Position, max: usize) -> StorageResult<Vec<LogEntry>> {
        self.check(log_id, &self.failing_reads)?;
        self.inner.read_from(log_id, from, max)
    }

    fn read_at(&self, log_id: &str, position: Position) -> StorageResult<Vec<u8>> {
        self.check(log_id, &self.failing_reads)?;
        self.inner.read_at(log_id, position)
    }

    fn end_position(&self, log_id: &str) -> StorageResult<Position> {
        self.check_all()?;
        self.inner.end_position(log_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqplog_storage::{LogStoreConfig, SegmentedLogStore};

    fn faulty() -> FaultyLogStore {
        FaultyLogStore::new(Arc::new(SegmentedLogStore::in_memory(
            LogStoreConfig::default(),
        )))
    }

    #[test]
    fn targeted_append_failures() {
        let store = faulty();
        store.create_log("a", true).unwrap();
        store.create_log("b", true).unwrap();
        store.fail_appends_to("a");

        assert!(matches!(
            store.append("a", b"x"),
            Err(StorageError::Unavailable(_))
        ));
        store.append("b", b"x").unwrap();
        assert_eq!(store.injected_failures(), 1);

        store.heal();
        store.append("a", b"x").unwrap();
    }

    #[test]
    fn outage_fails_everything() {
        let store = faulty();
        store.create_log("a", true).unwrap();
        store.set_unavailable(true);
        assert!(store.append("a", b"x").is_err());
        assert!(store.read_at("a", Position::EARLIEST).is_err());
        assert!(store.list_logs().is_err());
        store.set_unavailable(false);
        assert_eq!(store.append("a", b"x").unwrap(), Position::EARLIEST);
    }
}
