//! Persistent queue index.
//!
//! A queue owns two logs:
//!
//! - the index log: one [`IndexRecord`] per routed message, in routing order
//! - the retired log: the 16-byte index position of every record that was
//!   acknowledged, dropped or found orphaned
//!
//! The live content of the queue is the index minus the retired set. Bodies
//! stay in the exchange logs; the index only stores pointers to them.

use crate::error::{CoreError, CoreResult};
use amqplog_codec::{IndexRecord, Position};
use amqplog_storage::{LogCursor, LogStore, StorageError};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// One record read back from the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Position of the record in the index log.
    pub index_position: Position,
    /// The record.
    pub record: IndexRecord,
}

/// Index and retired logs of one queue.
pub struct QueueIndex {
    store: Arc<dyn LogStore>,
    index_log: String,
    retired_log: String,
    batch_size: usize,
}

impl QueueIndex {
    /// Creates a handle; no log is touched until [`create`](Self::create).
    pub fn new(
        store: Arc<dyn LogStore>,
        index_log: impl Into<String>,
        retired_log: impl Into<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            index_log: index_log.into(),
            retired_log: retired_log.into(),
            batch_size,
        }
    }

    /// Creates both logs if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn create(&self, durable: bool) -> CoreResult<()> {
        self.store.create_log(&self.index_log, durable)?;
        self.store.create_log(&self.retired_log, durable)?;
        Ok(())
    }

    /// Drops any existing content and creates both logs empty.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn reset(&self, durable: bool) -> CoreResult<()> {
        self.delete()?;
        self.create(durable)
    }

    /// Deletes both logs. Missing logs are ignored.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn delete(&self) -> CoreResult<()> {
        for log_id in [&self.index_log, &self.retired_log] {
            match self.store.delete_log(log_id) {
                Ok(()) | Err(StorageError::LogNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Appends a record and returns its index position.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Codec` on failure.
    pub fn append(&self, record: &IndexRecord) -> CoreResult<Position> {
        let bytes = record.encode()?;
        Ok(self.store.append(&self.index_log, &bytes)?)
    }

    /// Lazily reads records at or after `from`, in index order.
    ///
    /// The cursor is finite relative to the current end but picks up later
    /// appends when polled again.
    pub fn read_from(&self, from: Position) -> IndexCursor<'_> {
        IndexCursor {
            inner: LogCursor::open(self.store.as_ref(), self.index_log.as_str(), from, self.batch_size),
        }
    }

    /// Marks a record as retired.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the append fails.
    pub fn retire(&self, index_position: Position) -> CoreResult<()> {
        self.store
            .append(&self.retired_log, &index_position.encode())?;
        Ok(())
    }

    /// Reads the retired set.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Codec` on failure.
    pub fn load_retired(&self) -> CoreResult<BTreeSet<Position>> {
        let cursor = LogCursor::open(
            self.store.as_ref(),
            self.retired_log.as_str(),
            Position::EARLIEST,
            self.batch_size,
        );
        let mut retired = BTreeSet::new();
        for entry in cursor {
            retired.insert(Position::decode(&entry?.data)?);
        }
        Ok(retired)
    }

    /// Highest source position indexed from each exchange, retired records
    /// included.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` or `Codec` on failure.
    pub fn last_indexed_by_exchange(&self) -> CoreResult<HashMap<String, Position>> {
        let mut last: HashMap<String, Position> = HashMap::new();
        for entry in self.read_from(Position::EARLIEST) {
            let IndexRecord { position, exchange } = entry?.record;
            let slot = last.entry(exchange).or_insert(position);
            if position > *slot {
                *slot = position;
            }
        }
        Ok(last)
    }

    /// Position the next appended record will receive.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store fails.
    pub fn end_position(&self) -> CoreResult<Position> {
        Ok(self.store.end_position(&self.index_log)?)
    }

    /// Identifier of the index log.
    #[must_use]
    pub fn index_log(&self) -> &str {
        &self.index_log
    }

    /// Identifier of the retired log.
    #[must_use]
    pub fn retired_log(&self) -> &str {
        &self.retired_log
    }
}

/// Lazy reader over a queue index. See [`QueueIndex::read_from`].
pub struct IndexCursor<'a> {
    inner: LogCursor<'a>,
}

impl IndexCursor<'_> {
    /// Index position the cursor will read next; pass it back to
    /// [`QueueIndex::read_from`] to resume.
    #[must_use]
    pub fn position(&self) -> Position {
        self.inner.position()
    }
}

impl Iterator for IndexCursor<'_> {
    type Item = CoreResult<IndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(CoreError::from(e))),
        };
        Some(
            IndexRecord::decode(&entry.data)
                .map(|record| IndexEntry {
                    index_position: entry.position,
                    record,
                })
                .map_err(CoreError::from),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqplog_storage::{LogStoreConfig, SegmentedLogStore};

    fn index() -> QueueIndex {
        let store: Arc<dyn LogStore> = Arc::new(SegmentedLogStore::in_memory(
            LogStoreConfig::new().max_segment_entries(2),
        ));
        let index = QueueIndex::new(store, "vh/queue/q/index", "vh/queue/q/retired", 2);
        index.create(true).unwrap();
        index
    }

    #[test]
    fn append_and_read_in_order() {
        let index = index();
        let a = index.append(&IndexRecord::new("ex", Position::new(0, 5))).unwrap();
        let b = index.append(&IndexRecord::new("other", Position::new(3, 1))).unwrap();
        let c = index.append(&IndexRecord::new("ex", Position::new(0, 9))).unwrap();
        assert!(a < b && b < c);

        let entries: Vec<IndexEntry> = index.read_from(Position::EARLIEST).map(Result::unwrap).collect();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].record.exchange, "other");
        assert_eq!(entries[2].index_position, c);
    }

    #[test]
    fn cursor_resumes_from_observed_position() {
        let index = index();
        for i in 0..3 {
            index.append(&IndexRecord::new("ex", Position::new(0, i))).unwrap();
        }
        let mut cursor = index.read_from(Position::EARLIEST);
        cursor.next().unwrap().unwrap();
        let resume = cursor.position();

        let rest: Vec<u64> = index
            .read_from(resume)
            .map(|e| e.unwrap().record.position.entry)
            .collect();
        assert_eq!(rest, vec![1, 2]);

        index.append(&IndexRecord::new("ex", Position::new(0, 3))).unwrap();
        let tail: Vec<u64> = cursor.map(|e| e.unwrap().record.position.entry).collect();
        assert_eq!(tail, vec![1, 2, 3]);
    }

    #[test]
    fn retired_set_and_last_indexed() {
        let index = index();
        let first = index.append(&IndexRecord::new("ex", Position::new(0, 1))).unwrap();
        index.append(&IndexRecord::new("ex", Position::new(1, 0))).unwrap();
        index.append(&IndexRecord::new("fan", Position::new(0, 4))).unwrap();
        index.retire(first).unwrap();

        assert_eq!(index.load_retired().unwrap(), BTreeSet::from([first]));
        let last = index.last_indexed_by_exchange().unwrap();
        assert_eq!(last["ex"], Position::new(1, 0));
        assert_eq!(last["fan"], Position::new(0, 4));
    }

    #[test]
    fn reset_clears_content() {
        let index = index();
        index.append(&IndexRecord::new("ex", Position::EARLIEST)).unwrap();
        index.reset(true).unwrap();
        assert_eq!(index.read_from(Position::EARLIEST).count(), 0);
        assert_eq!(index.end_position().unwrap(), Position::EARLIEST);
    }
}
