//! # amqplog Core
//!
//! Exchange/queue routing and delivery tracking over an append-only log
//! store.
//!
//! This crate provides:
//! - [`Exchange`]: a body log plus a direct, fanout or topic routing table
//! - [`Queue`]: a persistent index of pointers into exchange logs, and a
//!   [`DeliveryTracker`] for reservations, acks and redelivery
//! - [`VirtualHost`]: the exchange and queue directory, with a durable
//!   topology log and crash recovery
//! - [`Channel`]: the session boundary (delivery tags, consumers, ack/nack)
//! - [`Broker`]: the entry point owning the log store
//!
//! Message bodies are stored once, in the log of the exchange they were
//! published to. Each matched queue appends a 16-byte position plus the
//! exchange name to its own index log, so fan-out never copies a body.
//!
//! ## Example
//!
//! ```rust,ignore
//! use amqplog_core::{Broker, Channel, ConsumeOptions, ExchangeOptions, ExchangeType, QueueOptions};
//! use amqplog_codec::MessageProperties;
//!
//! let broker = Broker::in_memory();
//! let vhost = broker.default_vhost()?;
//! let channel = Channel::open(&vhost);
//!
//! channel.declare_exchange("logs", ExchangeType::Fanout, ExchangeOptions::new())?;
//! channel.declare_queue("audit", QueueOptions::new())?;
//! channel.bind("audit", "logs", "")?;
//! channel.publish("logs", "", MessageProperties::new(), b"login".to_vec())?;
//!
//! let got = channel.get("audit", true)?.expect("one message");
//! channel.ack(got.delivery_tag, false)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod channel;
mod config;
mod error;
mod exchange;
mod queue;
mod recovery;
mod stats;
mod topology;
mod types;
mod vhost;

pub use broker::{Broker, DEFAULT_VHOST};
pub use channel::{Channel, ChannelEvent, ConsumeOptions, ConsumerHandle, Delivery, GetOk};
pub use config::{BrokerConfig, RequeuePolicy};
pub use error::{CoreError, CoreResult, RoutingFailure};
pub use exchange::{binding_matches, topic_matches, Exchange};
pub use queue::{
    DeliveryTracker, IndexCursor, IndexEntry, Owner, Queue, QueueIndex, Reservation, TrackerState,
};
pub use recovery::RecoveryReport;
pub use stats::{BrokerStats, BrokerStatsSnapshot, QueueStats, QueueStatsSnapshot};
pub use topology::{QueueRecord, TopologyLog, TopologyRecord, TopologySnapshot};
pub use types::{
    BindingInfo, ChannelId, ExchangeDeleteOptions, ExchangeOptions, ExchangeType, PublishReceipt,
    QueueDeclareOk, QueueDeleteOptions, QueueOptions,
};
pub use vhost::{
    exchange_log_id, queue_index_log_id, queue_retired_log_id, topology_log_id, VirtualHost,
    DEFAULT_EXCHANGE, MAX_NAME_LEN, RESERVED_PREFIX,
};
