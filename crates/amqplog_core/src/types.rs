//! Core type definitions for amqplog.

use crate::error::{CoreError, CoreResult};
use amqplog_codec::Position;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a channel, unique within a virtual host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u64);

impl ChannelId {
    /// Returns the raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch:{}", self.0)
    }
}

/// Routing strategy of an exchange, fixed at declare time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    /// Binding key equals routing key.
    Direct,
    /// Every bound queue.
    Fanout,
    /// Dot-separated pattern with `*` and `#` wildcards.
    Topic,
}

impl ExchangeType {
    /// Protocol name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeType {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "direct" => Ok(Self::Direct),
            "fanout" => Ok(Self::Fanout),
            "topic" => Ok(Self::Topic),
            other => Err(CoreError::invalid_operation(format!(
                "unsupported exchange type '{other}'"
            ))),
        }
    }
}

/// Options for declaring an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    /// Survives a restart.
    pub durable: bool,
    /// Only check that the exchange exists.
    pub passive: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            passive: false,
        }
    }
}

impl ExchangeOptions {
    /// Durable, non-passive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets durability.
    #[must_use]
    pub const fn durable(mut self, value: bool) -> Self {
        self.durable = value;
        self
    }

    /// Sets passive mode.
    #[must_use]
    pub const fn passive(mut self, value: bool) -> Self {
        self.passive = value;
        self
    }
}

/// Options for deleting an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeDeleteOptions {
    /// Fail with `ExchangeInUse` if any binding exists.
    pub if_unused: bool,
    /// Deleting a missing exchange succeeds.
    pub missing_ok: bool,
}

/// Options for declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives a restart.
    pub durable: bool,
    /// Owned by the declaring channel and deleted when it closes.
    pub exclusive: bool,
    /// Deleted when its last consumer is cancelled.
    pub auto_delete: bool,
    /// Only check that the queue exists.
    pub passive: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            passive: false,
        }
    }
}

impl QueueOptions {
    /// Durable, shared, non-passive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Options of a server-named queue: transient, exclusive, auto-delete.
    #[must_use]
    pub const fn server_named() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
            passive: false,
        }
    }

    /// Sets durability.
    #[must_use]
    pub const fn durable(mut self, value: bool) -> Self {
        self.durable = value;
        self
    }

    /// Sets exclusivity.
    #[must_use]
    pub const fn exclusive(mut self, value: bool) -> Self {
        self.exclusive = value;
        self
    }

    /// Sets auto-delete.
    #[must_use]
    pub const fn auto_delete(mut self, value: bool) -> Self {
        self.auto_delete = value;
        self
    }

    /// Sets passive mode.
    #[must_use]
    pub const fn passive(mut self, value: bool) -> Self {
        self.passive = value;
        self
    }
}

/// Options for deleting a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDeleteOptions {
    /// Fail with `QueueInUse` if consumers are attached.
    pub if_unused: bool,
    /// Fail with `QueueNotEmpty` if records are outstanding.
    pub if_empty: bool,
}

/// Reply to a queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclareOk {
    /// Queue name, generated for server-named queues.
    pub queue: String,
    /// Records ready for delivery.
    pub message_count: u64,
    /// Attached consumers.
    pub consumer_count: usize,
}

/// Result of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishReceipt {
    /// Durable position of the body in the exchange log.
    pub position: Position,
    /// Number of queues that received an index record.
    pub routed: usize,
}

/// One binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct BindingInfo {
    /// Exchange name.
    pub exchange: String,
    /// Queue name.
    pub queue: String,
    /// Binding key.
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_type_parse() {
        assert_eq!("topic".parse::<ExchangeType>().unwrap(), ExchangeType::Topic);
        assert_eq!(ExchangeType::Fanout.to_string(), "fanout");
        assert!("headers".parse::<ExchangeType>().is_err());
    }

    #[test]
    fn server_named_defaults() {
        let opts = QueueOptions::server_named();
        assert!(!opts.durable);
        assert!(opts.exclusive);
        assert!(opts.auto_delete);
    }

    #[test]
    fn channel_id_display() {
        assert_eq!(ChannelId(7).to_string(), "ch:7");
    }
}
