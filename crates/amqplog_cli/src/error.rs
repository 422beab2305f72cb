//! Error types for the CLI.

use thiserror::Error;

/// Result type for CLI commands.
pub type CliResult<T> = Result<T, CliError>;

/// Errors a CLI command can fail with.
#[derive(Debug, Error)]
pub enum CliError {
    /// The command needs `--path`.
    #[error("log directory path required for {0}")]
    PathRequired(&'static str),

    /// The path is not a directory.
    #[error("no log directory at {0}")]
    NotADirectory(String),

    /// The queue has no index log.
    #[error("queue '{queue}' not found in vhost '{vhost}'")]
    QueueNotFound {
        /// Virtual host.
        vhost: String,
        /// Queue name.
        queue: String,
    },

    /// The log store failed.
    #[error("storage error: {0}")]
    Storage(#[from] amqplog_storage::StorageError),

    /// A stored record could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] amqplog_codec::CodecError),

    /// Reading the queue index failed.
    #[error("{0}")]
    Core(#[from] amqplog_core::CoreError),

    /// JSON output failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
