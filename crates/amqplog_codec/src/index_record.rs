//! Queue index records.
//!
//! A queue index stores one record per message routed to the queue. The
//! record points at the body in the exchange log instead of copying it:
//!
//! ```text
//! | segment u64 BE | entry u64 BE | name_len u16 BE | exchange name (UTF-8) |
//! ```
//!
//! The first 16 bytes are exactly the encoded [`Position`], so a reader that
//! only cares about the source position can use [`Position::decode_prefix`].

use crate::error::{CodecError, CodecResult};
use crate::position::{Position, POSITION_SIZE};

/// Maximum encoded length of an exchange name in an index record.
pub const MAX_EXCHANGE_NAME_LEN: usize = u16::MAX as usize;

/// Pointer from a queue index to a message body in an exchange log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexRecord {
    /// Position of the body in the exchange log.
    pub position: Position,
    /// Name of the exchange that owns the log.
    pub exchange: String,
}

impl IndexRecord {
    /// Creates an index record.
    pub fn new(exchange: impl Into<String>, position: Position) -> Self {
        Self {
            position,
            exchange: exchange.into(),
        }
    }

    /// Encodes the record.
    ///
    /// # Errors
    ///
    /// Returns an error if the exchange name does not fit the `u16` prefix.
    pub fn encode(&self) -> CodecResult<Vec<u8>> {
        let name = self.exchange.as_bytes();
        let len = u16::try_from(name.len()).map_err(|_| CodecError::NameTooLong {
            len: name.len(),
            max: MAX_EXCHANGE_NAME_LEN,
        })?;

        let mut buf = Vec::with_capacity(POSITION_SIZE + 2 + name.len());
        buf.extend_from_slice(&self.position.encode());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(name);
        Ok(buf)
    }

    /// Decodes a record, rejecting truncated input and trailing bytes.
    ///
    /// # Errors
    ///
    /// Returns an error on short input, invalid UTF-8, or trailing bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let position = Position::decode_prefix(bytes)?;
        let mut cursor = POSITION_SIZE;

        if bytes.len() < cursor + 2 {
            return Err(CodecError::UnexpectedEof {
                needed: cursor + 2,
                actual: bytes.len(),
            });
        }
        let len = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]) as usize;
        cursor += 2;

        if bytes.len() < cursor + len {
            return Err(CodecError::UnexpectedEof {
                needed: cursor + len,
                actual: bytes.len(),
            });
        }
        let exchange = std::str::from_utf8(&bytes[cursor..cursor + len])
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();
        cursor += len;

        if cursor != bytes.len() {
            return Err(CodecError::TrailingBytes {
                expected: cursor,
                actual: bytes.len(),
            });
        }

        Ok(Self { position, exchange })
    }
}
