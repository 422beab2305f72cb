//! Log positions and their fixed-width encoding.

use crate::error::{CodecError, CodecResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Encoded size of a [`Position`]: two big-endian `u64`s.
pub const POSITION_SIZE: usize = 16;

/// Durable address of one entry within a log.
///
/// Positions order first by segment, then by entry within the segment, and
/// stay comparable across reopens of the same log.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Position {
    /// Segment identifier.
    pub segment: u64,
    /// Entry index within the segment.
    pub entry: u64,
}

impl Position {
    /// The first possible position of any log.
    pub const EARLIEST: Self = Self::new(0, 0);

    /// Creates a position.
    #[must_use]
    pub const fn new(segment: u64, entry: u64) -> Self {
        Self { segment, entry }
    }

    /// Returns the smallest position strictly after this one.
    ///
    /// Readers treat a position past the end of a segment as the start of the
    /// next segment, so this is a valid resume point.
    #[must_use]
    pub const fn successor(self) -> Self {
        Self {
            segment: self.segment,
            entry: self.entry + 1,
        }
    }

    /// Encodes as `segment` then `entry`, both big-endian.
    #[must_use]
    pub fn encode(&self) -> [u8; POSITION_SIZE] {
        let mut out = [0u8; POSITION_SIZE];
        out[..8].copy_from_slice(&self.segment.to_be_bytes());
        out[8..].copy_from_slice(&self.entry.to_be_bytes());
        out
    }

    /// Decodes exactly [`POSITION_SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is shorter or longer than 16 bytes.
    pub fn decode(bytes: &[u8]) -> CodecResult<Self> {
        let position = Self::decode_prefix(bytes)?;
        if bytes.len() != POSITION_SIZE {
            return Err(CodecError::TrailingBytes {
                expected: POSITION_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(position)
    }

    /// Decodes the first [`POSITION_SIZE`] bytes, ignoring the rest.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than 16 bytes are available.
    pub fn decode_prefix(bytes: &[u8]) -> CodecResult<Self> {
        if bytes.len() < POSITION_SIZE {
            return Err(CodecError::UnexpectedEof {
                needed: POSITION_SIZE,
                actual: bytes.len(),
            });
        }
        let mut segment = [0u8; 8];
        let mut entry = [0u8; 8];
        segment.copy_from_slice(&bytes[..8]);
        entry.copy_from_slice(&bytes[8..POSITION_SIZE]);
        Ok(Self {
            segment: u64::from_be_bytes(segment),
            entry: u64::from_be_bytes(entry),
        })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.segment, self.entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_is_big_endian_segment_then_entry() {
        let bytes = Position::new(1, 2).encode();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 1]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 0, 0, 0, 0, 2]);
    }

    #[test]
    fn short_input_fails() {
        let result = Position::decode(&[0u8; 15]);
        assert!(matches!(
            result,
            Err(CodecError::UnexpectedEof {
                needed: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn trailing_bytes_fail_strict_decode() {
        let mut bytes = Position::new(3, 4).encode().to_vec();
        bytes.push(0xFF);
        assert!(matches!(
            Position::decode(&bytes),
            Err(CodecError::TrailingBytes { .. })
        ));
        assert_eq!(Position::decode_prefix(&bytes).unwrap(), Position::new(3, 4));
    }

    #[test]
    fn ordering_is_segment_major() {
        assert!(Position::new(0, 100) < Position::new(1, 0));
        assert!(Position::new(2, 1) < Position::new(2, 2));
        assert_eq!(Position::new(5, 9).successor(), Position::new(5, 10));
    }

    #[test]
    fn display() {
        assert_eq!(Position::new(7, 42).to_string(), "7:42");
    }

    proptest! {
        #[test]
        fn roundtrip(segment in any::<u64>(), entry in any::<u64>()) {
            let position = Position::new(segment, entry);
            let decoded = Position::decode(&position.encode()).unwrap();
            prop_assert_eq!(decoded, position);
        }

        #[test]
        fn encoded_order_matches_position_order(a in any::<(u64, u64)>(), b in any::<(u64, u64)>()) {
            let pa = Position::new(a.0, a.1);
            let pb = Position::new(b.0, b.1);
            prop_assert_eq!(pa.cmp(&pb), pa.encode().cmp(&pb.encode()));
        }
    }
}
