//! Chunk identity and version-record naming.
//!
//! A chunk is identified by the pair of its weak rolling checksum and
//! its MD5.  The weak sum is the cheap probe key; the MD5 is
//! authoritative.  Identity carries no positional or per-file
//! information: equal bytes are the same chunk everywhere.
//!
//! Version records are identified by an opaque random 128-bit UUID.  On
//! disk a UUID appears as `<xx>/<b64hi>.<b64lo>` — the first byte in
//! hex selecting one of 256 shard directories, then the two big-endian
//! 64-bit halves base-64 encoded and joined with a dot.  The same form
//! is the symlink target in the source tree index.

use md5::{Digest, Md5};
use uuid::Uuid;

use crate::b64;
use crate::rollsum::Rollsum;

/// MD5 digest length in bytes.
pub const MD5_LEN: usize = 16;

/// Encoded length of a [`ChunkId`] in slots and on the wire:
/// weak as big-endian u32, then the 16 strong bytes.
pub const CHUNK_ID_LEN: usize = 4 + MD5_LEN;

/// Content address of a chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChunkId {
    /// Rolling weak checksum of the chunk bytes.
    pub weak: u32,
    /// MD5 of the chunk bytes.  Authoritative.
    pub strong: [u8; MD5_LEN],
}

impl ChunkId {
    /// The all-zero id, used as the empty-slot sentinel.
    pub const NULL: ChunkId = ChunkId { weak: 0, strong: [0; MD5_LEN] };

    /// Compute both sums over `data`.
    pub fn compute(data: &[u8]) -> Self {
        let mut rs = Rollsum::new();
        rs.update(data);
        ChunkId {
            weak: rs.digest(),
            strong: Md5::digest(data).into(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    pub fn to_bytes(&self) -> [u8; CHUNK_ID_LEN] {
        let mut buf = [0u8; CHUNK_ID_LEN];
        buf[..4].copy_from_slice(&self.weak.to_be_bytes());
        buf[4..].copy_from_slice(&self.strong);
        buf
    }

    pub fn from_bytes(buf: &[u8; CHUNK_ID_LEN]) -> Self {
        ChunkId {
            weak: u32::from_be_bytes(buf[..4].try_into().unwrap()),
            strong: buf[4..].try_into().unwrap(),
        }
    }

    /// The low eight strong-hash bytes as a big-endian integer — the
    /// value the store's linear hash maps to a bucket.
    #[inline]
    pub fn hash_value(&self) -> u64 {
        u64::from_be_bytes(self.strong[8..16].try_into().unwrap())
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}/{}", self.weak, hex::encode(self.strong))
    }
}

// ── UUID naming ──────────────────────────────────────────────────────────────

/// Split a UUID into its big-endian 64-bit halves.
#[inline]
pub fn uuid_to_longs(uuid: &Uuid) -> (u64, u64) {
    let b = uuid.as_bytes();
    (
        u64::from_be_bytes(b[..8].try_into().unwrap()),
        u64::from_be_bytes(b[8..].try_into().unwrap()),
    )
}

/// Rebuild a UUID from its big-endian halves.
#[inline]
pub fn uuid_from_longs(upper: u64, lower: u64) -> Uuid {
    let mut b = [0u8; 16];
    b[..8].copy_from_slice(&upper.to_be_bytes());
    b[8..].copy_from_slice(&lower.to_be_bytes());
    Uuid::from_bytes(b)
}

/// The dotted short form `b64(hi).b64(lo)`.
pub fn uuid_basename(uuid: &Uuid) -> String {
    let (upper, lower) = uuid_to_longs(uuid);
    format!("{}.{}", b64::encode(upper), b64::encode(lower))
}

/// The record path relative to the `files/` root (and the symlink
/// target form in the tree index): `<xx>/<b64hi>.<b64lo>`.
pub fn uuid_rel_path(uuid: &Uuid) -> String {
    format!("{:02x}/{}", uuid.as_bytes()[0], uuid_basename(uuid))
}

/// Parse the `<xx>/<b64hi>.<b64lo>` form back into a UUID.  The shard
/// prefix is redundant with the first UUID byte and is not verified
/// beyond its shape.
pub fn uuid_from_rel_path(path: &str) -> Option<Uuid> {
    let (_shard, name) = path.split_once('/')?;
    let (hi, lo) = name.split_once('.')?;
    Some(uuid_from_longs(b64::decode(hi)?, b64::decode(lo)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_id_is_all_zero_bytes() {
        assert_eq!(ChunkId::NULL.to_bytes(), [0u8; CHUNK_ID_LEN]);
        assert!(ChunkId::NULL.is_null());
    }

    #[test]
    fn id_bytes_round_trip() {
        let id = ChunkId::compute(b"some chunk of data, longer than nothing");
        assert!(!id.is_null());
        assert_eq!(ChunkId::from_bytes(&id.to_bytes()), id);
    }

    #[test]
    fn equal_bytes_equal_ids() {
        assert_eq!(ChunkId::compute(b"aaaa"), ChunkId::compute(b"aaaa"));
        assert_ne!(ChunkId::compute(b"aaaa"), ChunkId::compute(b"aaab"));
    }

    #[test]
    fn uuid_path_round_trip() {
        for _ in 0..32 {
            let u = Uuid::new_v4();
            let path = uuid_rel_path(&u);
            assert_eq!(uuid_from_rel_path(&path), Some(u), "path {path}");
        }
    }

    #[test]
    fn uuid_longs_round_trip() {
        let u = Uuid::new_v4();
        let (hi, lo) = uuid_to_longs(&u);
        assert_eq!(uuid_from_longs(hi, lo), u);
    }
}
