//! Error types for storage operations.

use amqplog_codec::Position;
use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of a backend.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Stored data failed validation.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// The named log does not exist.
    #[error("log not found: {log_id}")]
    LogNotFound {
        /// Log identifier.
        log_id: String,
    },

    /// No entry exists at the position.
    #[error("no entry at {position} in log {log_id}")]
    PositionNotFound {
        /// Log identifier.
        log_id: String,
        /// Requested position.
        position: Position,
    },

    /// The log identifier cannot be used.
    #[error("invalid log id: {log_id:?}")]
    InvalidLogId {
        /// Offending identifier.
        log_id: String,
    },

    /// The store refused the operation.
    #[error("log store unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Creates a log-not-found error.
    pub fn log_not_found(log_id: impl Into<String>) -> Self {
        Self::LogNotFound {
            log_id: log_id.into(),
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
