//! Chunk entries — the body of a version record.
//!
//! # On-disk layout (26 bytes per entry, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      2   tag          0 = End, 1 = Reference, 2 = Direct
//!
//! Reference:
//!    2      4   length       bytes this entry contributes
//!    6      4   weak         rolling checksum of the chunk
//!   10     16   strong       MD5 of the chunk
//!
//! Direct:
//!    2      1   len          0..=23
//!    3     23   data         chunk bytes, zero-padded
//!
//! End: bytes 2..26 are zero.
//! ```
//!
//! All three variants occupy the same 26 bytes so a version record is a
//! flat array of entries; the `End` tag terminates it.
//!
//! # The direct threshold
//! A chunk of 23 bytes or fewer is always stored inline and never
//! referenced; the block store therefore holds no chunk smaller than 24
//! bytes.  A reference to the store costs 24 bytes of entry body, so
//! inlining below that is strictly cheaper.

use thiserror::Error;

use crate::id::{ChunkId, CHUNK_ID_LEN};

/// Largest chunk stored inline in a version record.
pub const MAX_DIRECT_CHUNK_SIZE: usize = 23;

/// Fixed on-disk footprint of every entry.
pub const ENTRY_SIZE: usize = 26;

/// Entry tags.  Frozen; also the wire discriminants.
pub const TAG_END: u16 = 0;
pub const TAG_REFERENCE: u16 = 1;
pub const TAG_DIRECT: u16 = 2;

#[derive(Error, Debug)]
pub enum EntryError {
    #[error("unknown chunk entry tag {0}")]
    UnknownTag(u16),
    #[error("direct chunk length {0} exceeds {MAX_DIRECT_CHUNK_SIZE}")]
    DirectTooLong(u8),
    #[error("truncated chunk entry: {0} of {ENTRY_SIZE} bytes")]
    Truncated(usize),
}

/// One entry in a version record's chunk stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkEntry {
    /// Sentinel; the last entry of every record.
    End,
    /// `length` bytes equal to the chunk stored under `id`.
    Reference { length: u32, id: ChunkId },
    /// Up to 23 bytes stored inline.
    Direct { len: u8, data: [u8; MAX_DIRECT_CHUNK_SIZE] },
}

impl ChunkEntry {
    /// Build a direct entry from a short run of bytes.
    ///
    /// Panics if `bytes` exceeds the direct threshold; callers dispatch
    /// on length before constructing.
    pub fn direct(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_DIRECT_CHUNK_SIZE);
        let mut data = [0u8; MAX_DIRECT_CHUNK_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        ChunkEntry::Direct { len: bytes.len() as u8, data }
    }

    #[inline]
    pub fn tag(&self) -> u16 {
        match self {
            ChunkEntry::End => TAG_END,
            ChunkEntry::Reference { .. } => TAG_REFERENCE,
            ChunkEntry::Direct { .. } => TAG_DIRECT,
        }
    }

    /// Bytes this entry contributes to the reconstructed stream.
    #[inline]
    pub fn payload_len(&self) -> u64 {
        match self {
            ChunkEntry::End => 0,
            ChunkEntry::Reference { length, .. } => *length as u64,
            ChunkEntry::Direct { len, .. } => *len as u64,
        }
    }

    /// Encode into the fixed 26-byte footprint.
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[..2].copy_from_slice(&self.tag().to_be_bytes());
        match self {
            ChunkEntry::End => {}
            ChunkEntry::Reference { length, id } => {
                buf[2..6].copy_from_slice(&length.to_be_bytes());
                buf[6..6 + CHUNK_ID_LEN].copy_from_slice(&id.to_bytes());
            }
            ChunkEntry::Direct { len, data } => {
                buf[2] = *len;
                buf[3..3 + MAX_DIRECT_CHUNK_SIZE].copy_from_slice(data);
            }
        }
        buf
    }

    /// Decode one entry from the front of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, EntryError> {
        if buf.len() < ENTRY_SIZE {
            return Err(EntryError::Truncated(buf.len()));
        }
        let tag = u16::from_be_bytes(buf[..2].try_into().unwrap());
        match tag {
            TAG_END => Ok(ChunkEntry::End),
            TAG_REFERENCE => {
                let length = u32::from_be_bytes(buf[2..6].try_into().unwrap());
                let id_bytes: [u8; CHUNK_ID_LEN] =
                    buf[6..6 + CHUNK_ID_LEN].try_into().unwrap();
                Ok(ChunkEntry::Reference { length, id: ChunkId::from_bytes(&id_bytes) })
            }
            TAG_DIRECT => {
                let len = buf[2];
                if len as usize > MAX_DIRECT_CHUNK_SIZE {
                    return Err(EntryError::DirectTooLong(len));
                }
                let data: [u8; MAX_DIRECT_CHUNK_SIZE] =
                    buf[3..3 + MAX_DIRECT_CHUNK_SIZE].try_into().unwrap();
                Ok(ChunkEntry::Direct { len, data })
            }
            other => Err(EntryError::UnknownTag(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_is_all_zeros() {
        assert_eq!(ChunkEntry::End.encode(), [0u8; ENTRY_SIZE]);
    }

    #[test]
    fn reference_round_trip() {
        let entry = ChunkEntry::Reference {
            length: 700,
            id: ChunkId::compute(b"chunk body well past the direct threshold"),
        };
        assert_eq!(ChunkEntry::decode(&entry.encode()).unwrap(), entry);
    }

    #[test]
    fn direct_round_trip_at_threshold() {
        let bytes = [0xAB; MAX_DIRECT_CHUNK_SIZE];
        let entry = ChunkEntry::direct(&bytes);
        let decoded = ChunkEntry::decode(&entry.encode()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.payload_len(), MAX_DIRECT_CHUNK_SIZE as u64);
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut buf = [0u8; ENTRY_SIZE];
        buf[1] = 9;
        assert!(matches!(ChunkEntry::decode(&buf), Err(EntryError::UnknownTag(9))));
    }

    #[test]
    fn rejects_overlong_direct() {
        let mut buf = ChunkEntry::direct(b"x").encode();
        buf[2] = 24;
        assert!(matches!(ChunkEntry::decode(&buf), Err(EntryError::DirectTooLong(24))));
    }

    #[test]
    fn rejects_truncation() {
        let buf = [0u8; ENTRY_SIZE - 1];
        assert!(matches!(ChunkEntry::decode(&buf), Err(EntryError::Truncated(_))));
    }
}
