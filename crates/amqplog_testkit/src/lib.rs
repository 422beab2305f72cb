//! # amqplog Testkit
//!
//! Test utilities for amqplog.
//!
//! This crate provides:
//! - Broker fixtures over in-memory and temp-dir stores
//! - Property-based generators using proptest
//! - A fault-injecting log store
//! - Crash recovery harnesses
//! - Concurrent publish/consume stress runs
//! - Byte-level vectors for the position and index-record layouts
//!
//! Scenario tests live in this crate's `tests/` directory.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use amqplog_testkit::prelude::*;
//!
//! #[test]
//! fn test_with_broker() {
//!     with_channel(|channel| {
//!         channel.declare_queue("q", QueueOptions::new()).unwrap();
//!         // ... test operations
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faulty;
pub mod fixtures;
pub mod generators;
pub mod stress;
pub mod vectors;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faulty::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use amqplog_codec::{MessageProperties, Position};
    pub use amqplog_core::{
        Channel, ChannelEvent, ConsumeOptions, CoreError, Delivery, ExchangeOptions,
        ExchangeType, QueueDeleteOptions, QueueOptions,
    };
}

pub use crash::*;
pub use faulty::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
pub use vectors::*;
