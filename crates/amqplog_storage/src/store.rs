//! The log store: named, append-only, position-addressed logs.

use crate::backend::StorageBackend;
use crate::config::LogStoreConfig;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use crate::segment::Segment;
use amqplog_codec::Position;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Extension of segment files.
pub const SEGMENT_EXTENSION: &str = "seg";

/// One entry read from a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Position of the entry.
    pub position: Position,
    /// Entry payload.
    pub data: Vec<u8>,
}

/// Summary of one log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfo {
    /// Log identifier.
    pub log_id: String,
    /// Whether the log survives a reopen.
    pub durable: bool,
    /// Number of entries.
    pub entries: u64,
    /// Position the next append would receive.
    pub end: Position,
}

/// A store of named append-only logs.
///
/// Positions handed out by one log are strictly increasing in append order.
/// `append` on a durable log returns only once the entry is durable (subject
/// to the store's sync setting).
pub trait LogStore: Send + Sync {
    /// Creates a log. Creating an existing log is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the identifier is invalid or storage fails.
    fn create_log(&self, log_id: &str, durable: bool) -> StorageResult<()>;

    /// Deletes a log and all of its entries.
    ///
    /// # Errors
    ///
    /// Returns `LogNotFound` if the log does not exist.
    fn delete_log(&self, log_id: &str) -> StorageResult<()>;

    /// Lists every log, ordered by identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if storage fails.
    fn list_logs(&self) -> StorageResult<Vec<LogInfo>>;

    /// Returns whether the log exists.
    fn log_exists(&self, log_id: &str) -> bool;

    /// Appends an entry and returns its position.
    ///
    /// # Errors
    ///
    /// Returns `LogNotFound` if the log does not exist, or an I/O error.
    fn append(&self, log_id: &str, data: &[u8]) -> StorageResult<Position>;

    /// Reads up to `max` entries at or after `from`, in position order.
    ///
    /// # Errors
    ///
    /// Returns `LogNotFound` if the log does not exist, or an I/O error.
    fn read_from(&self, log_id: &str, from: Position, max: usize) -> StorageResult<Vec<LogEntry>>;

    /// Reads the entry at exactly `position`.
    ///
    /// # Errors
    ///
    /// Returns `PositionNotFound` if no entry exists there.
    fn read_at(&self, log_id: &str, position: Position) -> StorageResult<Vec<u8>>;

    /// Returns the position the next append would receive.
    ///
    /// # Errors
    ///
    /// Returns `LogNotFound` if the log does not exist.
    fn end_position(&self, log_id: &str) -> StorageResult<Position>;
}

/// Lazy sequential reader over one log.
///
/// Reads in batches. Once it reaches the current end it yields `None`, but it
/// can be polled again later and picks up entries appended in the meantime.
pub struct LogCursor<'a> {
    store: &'a dyn LogStore,
    log_id: String,
    next: Position,
    batch: VecDeque<LogEntry>,
    batch_size: usize,
}

impl<'a> LogCursor<'a> {
    /// Opens a cursor at `from`.
    pub fn open(
        store: &'a dyn LogStore,
        log_id: impl Into<String>,
        from: Position,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            log_id: log_id.into(),
            next: from,
            batch: VecDeque::new(),
            batch_size: batch_size.max(1),
        }
    }

    /// Position the cursor will read from next.
    #[must_use]
    pub fn position(&self) -> Position {
        self.batch.front().map_or(self.next, |entry| entry.position)
    }

    /// Log the cursor reads.
    #[must_use]
    pub fn log_id(&self) -> &str {
        &self.log_id
    }
}

impl Iterator for LogCursor<'_> {
    type Item = StorageResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.batch.is_empty() {
            match self.store.read_from(&self.log_id, self.next, self.batch_size) {
                Ok(entries) => self.batch.extend(entries),
                Err(e) => return Some(Err(e)),
            }
        }
        let entry = self.batch.pop_front()?;
        self.next = entry.position.successor();
        Some(Ok(entry))
    }
}

struct SegmentedLog {
    durable: bool,
    dir: Option<PathBuf>,
    segments: Vec<Segment>,
    deleted: bool,
}

impl SegmentedLog {
    fn entries(&self) -> u64 {
        self.segments.iter().map(Segment::len).sum()
    }

    fn is_full(segment: &Segment, config: &LogStoreConfig) -> bool {
        segment.len() >= config.max_segment_entries || segment.size() >= config.max_segment_bytes
    }

    fn end_position(&self, config: &LogStoreConfig) -> Position {
        match self.segments.last() {
            None => Position::EARLIEST,
            Some(last) if Self::is_full(last, config) => Position::new(last.id() + 1, 0),
            Some(last) => Position::new(last.id(), last.len()),
        }
    }

    fn new_segment(&self, id: u64) -> StorageResult<Segment> {
        let backend: Box<dyn StorageBackend> = match &self.dir {
            Some(dir) => Box::new(FileBackend::open(&segment_path(dir, id))?),
            None => Box::new(InMemoryBackend::new()),
        };
        Segment::create(id, backend)
    }

    fn append(&mut self, data: &[u8], config: &LogStoreConfig) -> StorageResult<Position> {
        let needs_roll = self
            .segments
            .last()
            .map_or(true, |last| Self::is_full(last, config));
        if needs_roll {
            let id = self.segments.last().map_or(0, |last| last.id() + 1);
            let segment = self.new_segment(id)?;
            self.segments.push(segment);
        }

        let sync = self.durable && config.sync_on_append;
        let segment = self
            .segments
            .last_mut()
            .ok_or_else(|| StorageError::corrupted("log has no active segment"))?;
        let entry = segment.append(data, sync)?;
        Ok(Position::new(segment.id(), entry))
    }

    fn read_from(&self, from: Position, max: usize) -> StorageResult<Vec<LogEntry>> {
        let mut out = Vec::new();
        for segment in self.segments.iter().filter(|s| s.id() >= from.segment) {
            let start = if segment.id() == from.segment {
                from.entry
            } else {
                0
            };
            for entry in start..segment.len() {
                if out.len() >= max {
                    return Ok(out);
                }
                if let Some(data) = segment.read(entry)? {
                    out.push(LogEntry {
                        position: Position::new(segment.id(), entry),
                        data,
                    });
                }
            }
        }
        Ok(out)
    }

    fn read_at(&self, position: Position) -> StorageResult<Option<Vec<u8>>> {
        match self.segments.iter().find(|s| s.id() == position.segment) {
            Some(segment) => segment.read(position.entry),
            None => Ok(None),
        }
    }
}

/// Segmented implementation of [`LogStore`].
///
/// In memory mode every log lives in memory. In directory mode durable logs
/// are stored under `<root>/<escaped log id>/<segment>.seg` and are recovered
/// on [`open_dir`](Self::open_dir); non-durable logs still live in memory.
pub struct SegmentedLogStore {
    root: Option<PathBuf>,
    config: LogStoreConfig,
    logs: RwLock<HashMap<String, Arc<Mutex<SegmentedLog>>>>,
}

impl SegmentedLogStore {
    /// Creates a store that keeps everything in memory.
    #[must_use]
    pub fn in_memory(config: LogStoreConfig) -> Self {
        Self {
            root: None,
            config,
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Opens or creates a store in `root`, recovering every durable log.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be read, or a segment is
    /// corrupted beyond a torn tail.
    pub fn open_dir(root: impl AsRef<Path>, config: LogStoreConfig) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut logs = HashMap::new();
        for dir_entry in fs::read_dir(&root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.file_type()?.is_dir() {
                continue;
            }
            let name = dir_entry.file_name();
            let Some(log_id) = name.to_str().and_then(unescape_log_id) else {
                continue;
            };
            let dir = dir_entry.path();
            let segments = recover_segments(&dir)?;
            debug!(log_id = %log_id, segments = segments.len(), "recovered log");
            logs.insert(
                log_id,
                Arc::new(Mutex::new(SegmentedLog {
                    durable: true,
                    dir: Some(dir),
                    segments,
                    deleted: false,
                })),
            );
        }

        info!(path = %root.display(), logs = logs.len(), "opened log store");
        Ok(Self {
            root: Some(root),
            config,
            logs: RwLock::new(logs),
        })
    }

    /// Root directory, if the store is directory backed.
    #[must_use]
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Store configuration.
    #[must_use]
    pub fn config(&self) -> &LogStoreConfig {
        &self.config
    }

    fn log(&self, log_id: &str) -> StorageResult<Arc<Mutex<SegmentedLog>>> {
        self.logs
            .read()
            .get(log_id)
            .cloned()
            .ok_or_else(|| StorageError::log_not_found(log_id))
    }
}

impl LogStore for SegmentedLogStore {
    fn create_log(&self, log_id: &str, durable: bool) -> StorageResult<()> {
        if log_id.is_empty() {
            return Err(StorageError::InvalidLogId {
                log_id: log_id.to_string(),
            });
        }

        let mut logs = self.logs.write();
        if logs.contains_key(log_id) {
            return Ok(());
        }

        let dir = match (&self.root, durable) {
            (Some(root), true) => {
                let dir = root.join(escape_log_id(log_id));
                fs::create_dir_all(&dir)?;
                Some(dir)
            }
            _ => None,
        };
        logs.insert(
            log_id.to_string(),
            Arc::new(Mutex::new(SegmentedLog {
                durable,
                dir,
                segments: Vec::new(),
                deleted: false,
            })),
        );
        debug!(log_id, durable, "created log");
        Ok(())
    }

    fn delete_log(&self, log_id: &str) -> StorageResult<()> {
        let log = self
            .logs
            .write()
            .remove(log_id)
            .ok_or_else(|| StorageError::log_not_found(log_id))?;

        let mut log = log.lock();
        log.deleted = true;
        log.segments.clear();
        if let Some(dir) = log.dir.take() {
            fs::remove_dir_all(&dir)?;
        }
        debug!(log_id, "deleted log");
        Ok(())
    }

    fn list_logs(&self) -> StorageResult<Vec<LogInfo>> {
        let logs: Vec<(String, Arc<Mutex<SegmentedLog>>)> = self
            .logs
            .read()
            .iter()
            .map(|(id, log)| (id.clone(), Arc::clone(log)))
            .collect();

        let mut infos: Vec<LogInfo> = logs
            .into_iter()
            .map(|(log_id, log)| {
                let log = log.lock();
                LogInfo {
                    log_id,
                    durable: log.durable,
                    entries: log.entries(),
                    end: log.end_position(&self.config),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.log_id.cmp(&b.log_id));
        Ok(infos)
    }

    fn log_exists(&self, log_id: &str) -> bool {
        self.logs.read().contains_key(log_id)
    }

    fn append(&self, log_id: &str, data: &[u8]) -> StorageResult<Position> {
        let log = self.log(log_id)?;
        let mut log = log.lock();
        if log.deleted {
            return Err(StorageError::log_not_found(log_id));
        }
        log.append(data, &self.config)
    }

    fn read_from(&self, log_id: &str, from: Position, max: usize) -> StorageResult<Vec<LogEntry>> {
        let log = self.log(log_id)?;
        let log = log.lock();
        if log.deleted {
            return Err(StorageError::log_not_found(log_id));
        }
        log.read_from(from, max)
    }

    fn read_at(&self, log_id: &str, position: Position) -> StorageResult<Vec<u8>> {
        let log = self.log(log_id)?;
        let log = log.lock();
        if log.deleted {
            return Err(StorageError::log_not_found(log_id));
        }
        log.read_at(position)?
            .ok_or_else(|| StorageError::PositionNotFound {
                log_id: log_id.to_string(),
                position,
            })
    }

    fn end_position(&self, log_id: &str) -> StorageResult<Position> {
        let log = self.log(log_id)?;
        let log = log.lock();
        if log.deleted {
            return Err(StorageError::log_not_found(log_id));
        }
        Ok(log.end_position(&self.config))
    }
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{SEGMENT_EXTENSION}"))
}

fn recover_segments(dir: &Path) -> StorageResult<Vec<Segment>> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        if let Some(id) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            ids.push(id);
        }
    }
    ids.sort_unstable();

    ids.into_iter()
        .map(|id| Segment::recover(id, Box::new(FileBackend::open(&segment_path(dir, id))?)))
        .collect()
}

/// Escapes a log identifier into a single directory name.
///
/// ASCII alphanumerics, `-` and `_` are kept; every other byte becomes `%XX`.
#[must_use]
pub fn escape_log_id(log_id: &str) -> String {
    let mut out = String::with_capacity(log_id.len());
    for byte in log_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Reverses [`escape_log_id`]. Returns `None` for names it did not produce.
#[must_use]
pub fn unescape_log_id(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
