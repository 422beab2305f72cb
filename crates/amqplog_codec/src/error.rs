//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during encoding or decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Failed to encode a value.
    #[error("encoding failed: {message}")]
    EncodingFailed {
        /// Description of the encoding error.
        message: String,
    },

    /// Failed to decode bytes.
    #[error("decoding failed: {message}")]
    DecodingFailed {
        /// Description of the decoding error.
        message: String,
    },

    /// Input ended before a fixed-width field was complete.
    #[error("unexpected end of input: needed {needed} bytes, got {actual}")]
    UnexpectedEof {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Bytes remained after a fixed-layout record was decoded.
    #[error("trailing bytes: expected {expected} bytes, got {actual}")]
    TrailingBytes {
        /// Bytes consumed by the record.
        expected: usize,
        /// Bytes supplied.
        actual: usize,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A name was too long for its length prefix.
    #[error("name too long: {len} bytes exceeds maximum of {max}")]
    NameTooLong {
        /// Actual length.
        len: usize,
        /// Maximum length.
        max: usize,
    },
}

impl CodecError {
    /// Create an encoding failed error.
    pub fn encoding_failed(message: impl Into<String>) -> Self {
        Self::EncodingFailed {
            message: message.into(),
        }
    }

    /// Create a decoding failed error.
    pub fn decoding_failed(message: impl Into<String>) -> Self {
        Self::DecodingFailed {
            message: message.into(),
        }
    }
}
