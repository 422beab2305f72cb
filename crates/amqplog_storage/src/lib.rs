//! # amqplog Storage
//!
//! The log store underneath the amqplog routing engine.
//!
//! A log is a named, append-only sequence of entries addressed by
//! [`Position`](amqplog_codec::Position). Logs are split into segments; each
//! segment is a run of CRC-framed entries in an opaque byte backend.
//!
//! ## Layers
//!
//! - [`StorageBackend`] - opaque byte store ([`InMemoryBackend`], [`FileBackend`])
//! - segments - entry framing and torn-tail recovery
//! - [`LogStore`] - named logs with position-addressed reads ([`SegmentedLogStore`])
//!
//! ## Example
//!
//! ```rust
//! use amqplog_storage::{LogStore, LogStoreConfig, SegmentedLogStore};
//! use amqplog_codec::Position;
//!
//! let store = SegmentedLogStore::in_memory(LogStoreConfig::default());
//! store.create_log("orders", true).unwrap();
//! let position = store.append("orders", b"hello world").unwrap();
//! assert_eq!(position, Position::EARLIEST);
//! assert_eq!(store.read_at("orders", position).unwrap(), b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod config;
mod error;
mod file;
mod frame;
mod memory;
mod segment;
mod store;

pub use backend::StorageBackend;
pub use config::LogStoreConfig;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use frame::{
    compute_crc32, encode_frame, parse_header, verify_frame, FRAME_CRC_SIZE, FRAME_HEADER_SIZE,
    FRAME_MAGIC, FRAME_OVERHEAD,
};
pub use memory::InMemoryBackend;
pub use store::{
    escape_log_id, unescape_log_id, LogCursor, LogEntry, LogInfo, LogStore, SegmentedLogStore,
    SEGMENT_EXTENSION,
};
