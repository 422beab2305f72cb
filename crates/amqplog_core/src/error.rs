//! Error types for amqplog core.

use amqplog_codec::Position;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// A matched queue that did not receive its index record.
#[derive(Debug)]
pub struct RoutingFailure {
    /// Queue name.
    pub queue: String,
    /// Why the index append failed.
    pub error: CoreError,
}

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Redeclare with parameters that differ from the existing entity.
    #[error("{kind} '{name}' already exists with different parameters: {detail}")]
    Conflict {
        /// Entity kind ("exchange", "queue").
        kind: &'static str,
        /// Entity name.
        name: String,
        /// What differs.
        detail: String,
    },

    /// Entity does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Entity kind ("exchange", "queue", "consumer").
        kind: &'static str,
        /// Entity name.
        name: String,
    },

    /// An index record points at a body that no longer exists.
    #[error("queue '{queue}' index record at {index_position} references missing body {position} in exchange '{exchange}'")]
    OrphanedIndex {
        /// Queue holding the record.
        queue: String,
        /// Position of the record in the queue index.
        index_position: Position,
        /// Exchange named by the record.
        exchange: String,
        /// Body position named by the record.
        position: Position,
    },

    /// Delivery tag is not outstanding on the channel.
    #[error("unknown delivery tag {tag}")]
    UnknownDeliveryTag {
        /// The tag.
        tag: u64,
    },

    /// The log store failed.
    #[error("log store unavailable: {0}")]
    StoreUnavailable(#[from] amqplog_storage::StorageError),

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(#[from] amqplog_codec::CodecError),

    /// The body is durable but some matched queues did not get an index record.
    #[error("publish to '{exchange}' at {position} reached {routed} queue(s) but failed for {}", .failures.len())]
    PartialRouting {
        /// Exchange published to.
        exchange: String,
        /// Durable body position.
        position: Position,
        /// Queues that did receive the record.
        routed: usize,
        /// Queues that did not.
        failures: Vec<RoutingFailure>,
    },

    /// Exclusive queue owned by another channel.
    #[error("queue '{name}' is locked by another channel")]
    ResourceLocked {
        /// Queue name.
        name: String,
    },

    /// Conditional delete on a queue with messages.
    #[error("queue '{name}' has {messages} message(s)")]
    QueueNotEmpty {
        /// Queue name.
        name: String,
        /// Message count.
        messages: u64,
    },

    /// Conditional delete on a queue with consumers.
    #[error("queue '{name}' has {consumers} consumer(s)")]
    QueueInUse {
        /// Queue name.
        name: String,
        /// Consumer count.
        consumers: usize,
    },

    /// Conditional delete on an exchange with bindings.
    #[error("exchange '{name}' has bindings")]
    ExchangeInUse {
        /// Exchange name.
        name: String,
    },

    /// Operation on a reserved name or entity.
    #[error("access refused: {message}")]
    AccessRefused {
        /// Description.
        message: String,
    },

    /// Channel was closed.
    #[error("channel {channel} is closed")]
    ChannelClosed {
        /// Channel id.
        channel: u64,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a conflict error.
    pub fn conflict(kind: &'static str, name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Conflict {
            kind,
            name: name.into(),
            detail: detail.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Creates an access refused error.
    pub fn access_refused(message: impl Into<String>) -> Self {
        Self::AccessRefused {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Whether the caller may retry the operation unchanged.
    ///
    /// Only store failures are transient; the core itself never retries.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }

    /// Whether this is a not-found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amqplog_storage::StorageError;

    #[test]
    fn only_store_errors_are_retryable() {
        let store = CoreError::from(StorageError::Unavailable("down".into()));
        assert!(store.is_retryable());
        assert!(!CoreError::not_found("queue", "q").is_retryable());
        assert!(!CoreError::conflict("exchange", "x", "type").is_retryable());
    }

    #[test]
    fn partial_routing_message_counts_failures() {
        let err = CoreError::PartialRouting {
            exchange: "ex".into(),
            position: Position::new(0, 3),
            routed: 2,
            failures: vec![RoutingFailure {
                queue: "q3".into(),
                error: CoreError::not_found("queue", "q3"),
            }],
        };
        assert_eq!(
            err.to_string(),
            "publish to 'ex' at 0:3 reached 2 queue(s) but failed for 1"
        );
    }
}
