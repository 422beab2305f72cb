//! Entry framing within a segment.
//!
//! ```text
//! | magic "ALOG" (4) | length u32 LE (4) | payload (N) | crc32 LE (4) |
//! ```
//!
//! The CRC covers magic, length and payload. A frame whose header or body
//! runs past the end of the segment is a torn write; a frame with a bad magic
//! or CRC is corruption.

use crate::error::{StorageError, StorageResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"ALOG";

/// Magic (4) + length (4).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Trailing CRC32.
pub const FRAME_CRC_SIZE: usize = 4;

/// Total framing overhead per entry.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAME_CRC_SIZE;

/// Wraps a payload in a frame.
///
/// # Errors
///
/// Returns an error if the payload exceeds `u32::MAX` bytes.
pub fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::corrupted("entry payload exceeds 4 GiB"))?;

    let mut data = Vec::with_capacity(FRAME_OVERHEAD + payload.len());
    data.extend_from_slice(&FRAME_MAGIC);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Validates a frame header and returns the payload length.
///
/// # Errors
///
/// Returns `Corrupted` if the magic bytes do not match.
pub fn parse_header(header: &[u8], offset: u64) -> StorageResult<usize> {
    if header.len() < FRAME_HEADER_SIZE || header[..4] != FRAME_MAGIC {
        return Err(StorageError::corrupted(format!(
            "invalid frame magic at offset {offset}"
        )));
    }
    Ok(u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize)
}

/// Verifies the CRC of a complete frame and returns its payload.
///
/// # Errors
///
/// Returns `Corrupted` on a CRC mismatch.
pub fn verify_frame(frame: &[u8], offset: u64) -> StorageResult<&[u8]> {
    let body_end = frame.len() - FRAME_CRC_SIZE;
    let stored = u32::from_le_bytes([
        frame[body_end],
        frame[body_end + 1],
        frame[body_end + 2],
        frame[body_end + 3],
    ]);
    let computed = compute_crc32(&frame[..body_end]);
    if stored != computed {
        return Err(StorageError::corrupted(format!(
            "checksum mismatch at offset {offset}: expected {stored:08x}, got {computed:08x}"
        )));
    }
    Ok(&frame[FRAME_HEADER_SIZE..body_end])
}

/// Computes the IEEE CRC32 of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(b"payload").unwrap();
        assert_eq!(frame.len(), FRAME_OVERHEAD + 7);
        assert_eq!(parse_header(&frame[..FRAME_HEADER_SIZE], 0).unwrap(), 7);
        assert_eq!(verify_frame(&frame, 0).unwrap(), b"payload");
    }

    #[test]
    fn flipped_bit_is_detected() {
        let mut frame = encode_frame(b"payload").unwrap();
        frame[FRAME_HEADER_SIZE] ^= 0x01;
        assert!(matches!(
            verify_frame(&frame, 0),
            Err(StorageError::Corrupted(_))
        ));
    }

    #[test]
    fn bad_magic_is_detected() {
        let mut frame = encode_frame(b"x").unwrap();
        frame[0] = b'X';
        assert!(parse_header(&frame, 12).is_err());
    }
}
