//! Segments: framed entries over one byte backend.

use crate::backend::StorageBackend;
use crate::error::StorageResult;
use crate::frame::{encode_frame, parse_header, verify_frame, FRAME_CRC_SIZE, FRAME_HEADER_SIZE};
use tracing::warn;

/// One segment of a log.
///
/// Keeps an in-memory table of entry offsets so entries can be read by index
/// without scanning.
pub(crate) struct Segment {
    id: u64,
    backend: Box<dyn StorageBackend>,
    offsets: Vec<u64>,
    size: u64,
}

impl Segment {
    /// Wraps an empty backend.
    pub(crate) fn create(id: u64, backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let size = backend.size()?;
        Ok(Self {
            id,
            backend,
            offsets: Vec::new(),
            size,
        })
    }

    /// Rebuilds the offset table of an existing backend.
    ///
    /// A frame that runs past the end of the backend is a write torn by a
    /// crash: it is truncated away and recovery continues. Bad magic or CRC
    /// is returned as an error.
    pub(crate) fn recover(id: u64, mut backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let size = backend.size()?;
        let mut offsets = Vec::new();
        let mut offset = 0u64;

        while offset < size {
            if offset + FRAME_HEADER_SIZE as u64 > size {
                break;
            }
            let header = backend.read_at(offset, FRAME_HEADER_SIZE)?;
            let len = parse_header(&header, offset)?;
            let frame_len = (FRAME_HEADER_SIZE + len + FRAME_CRC_SIZE) as u64;
            if offset + frame_len > size {
                break;
            }
            let frame = backend.read_at(offset, frame_len as usize)?;
            verify_frame(&frame, offset)?;
            offsets.push(offset);
            offset += frame_len;
        }

        if offset < size {
            warn!(
                segment = id,
                torn_bytes = size - offset,
                "truncating torn segment tail"
            );
            backend.truncate(offset)?;
        }

        Ok(Self {
            id,
            backend,
            offsets,
            size: offset,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Number of entries.
    pub(crate) fn len(&self) -> u64 {
        self.offsets.len() as u64
    }

    /// Bytes used, including framing.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    /// Appends a payload and returns its entry index.
    pub(crate) fn append(&mut self, payload: &[u8], sync: bool) -> StorageResult<u64> {
        let frame = encode_frame(payload)?;
        let offset = self.backend.append(&frame)?;
        if sync {
            self.backend.sync()?;
        }
        self.offsets.push(offset);
        self.size = offset + frame.len() as u64;
        Ok(self.offsets.len() as u64 - 1)
    }

    /// Reads the payload of entry `entry`, or `None` if out of range.
    pub(crate) fn read(&self, entry: u64) -> StorageResult<Option<Vec<u8>>> {
        let Some(&offset) = usize::try_from(entry).ok().and_then(|i| self.offsets.get(i)) else {
            return Ok(None);
        };
        let header = self.backend.read_at(offset, FRAME_HEADER_SIZE)?;
        let len = parse_header(&header, offset)?;
        let frame = self
            .backend
            .read_at(offset, FRAME_HEADER_SIZE + len + FRAME_CRC_SIZE)?;
        Ok(Some(verify_frame(&frame, offset)?.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;

    #[test]
    fn append_and_read_entries() {
        let mut segment = Segment::create(4, Box::new(InMemoryBackend::new())).unwrap();
        assert_eq!(segment.append(b"a", false).unwrap(), 0);
        assert_eq!(segment.append(b"bb", false).unwrap(), 1);
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.read(1).unwrap().unwrap(), b"bb");
        assert!(segment.read(2).unwrap().is_none());
        assert_eq!(segment.id(), 4);
    }

    #[test]
    fn recover_truncates_torn_tail() {
        let mut image = encode_frame(b"first").unwrap();
        image.extend_from_slice(&encode_frame(b"second").unwrap());
        let whole = image.len();
        let mut torn = encode_frame(b"third").unwrap();
        torn.truncate(torn.len() - 2);
        image.extend_from_slice(&torn);

        let segment = Segment::recover(0, Box::new(InMemoryBackend::with_data(image))).unwrap();
        assert_eq!(segment.len(), 2);
        assert_eq!(segment.size(), whole as u64);
        assert_eq!(segment.read(1).unwrap().unwrap(), b"second");
    }

    #[test]
    fn recover_rejects_corruption() {
        let mut image = encode_frame(b"first").unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        let result = Segment::recover(0, Box::new(InMemoryBackend::with_data(image)));
        assert!(result.is_err());
    }
}
