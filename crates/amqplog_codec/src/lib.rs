//! # amqplog Codec
//!
//! Fixed-width and CBOR codecs shared by the amqplog log store and routing core.
//!
//! This crate provides:
//! - [`Position`]: the durable address of a log entry, encoded as two
//!   big-endian `u64`s (16 bytes total)
//! - [`IndexRecord`]: the pointer a queue index stores for each routed message
//! - [`MessageEnvelope`]: a published message as stored in an exchange log
//! - [`to_cbor`] / [`from_cbor`]: CBOR helpers for metadata records
//!
//! ## Usage
//!
//! ```
//! use amqplog_codec::{IndexRecord, Position};
//!
//! let record = IndexRecord::new("orders", Position::new(3, 17));
//! let bytes = record.encode().unwrap();
//! assert_eq!(Position::decode_prefix(&bytes).unwrap(), Position::new(3, 17));
//! assert_eq!(IndexRecord::decode(&bytes).unwrap(), record);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod index_record;
mod position;

pub use envelope::{from_cbor, to_cbor, MessageEnvelope, MessageProperties};
pub use error::{CodecError, CodecResult};
pub use index_record::{IndexRecord, MAX_EXCHANGE_NAME_LEN};
pub use position::{Position, POSITION_SIZE};
