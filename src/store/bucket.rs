//! One bucket of the block store — a single memory-mapped file.
//!
//! # On-disk layout (all fields big-endian)
//!
//! ```text
//! Offset        Size  Field
//!    0             4  magic        = "ARWB"
//!    4             1  format version = 1
//!    5             2  chunk_count  number of key slots
//!    7             4  alloc_size   data region bytes
//!   11  count × 30    key slots:
//!                        0..20  ChunkId (weak u32 BE + strong[16])
//!                       20..24  offset  u32  (into the data region)
//!                       24..28  length  u32
//!                       28..30  references u16
//!   ...  alloc_size   data region (chunk bodies, tightly packed)
//!   ...               parity reservation, all zeros (see below)
//! ```
//!
//! An all-zero slot is the null key: the slot is empty.  Non-empty slots
//! appear in non-decreasing offset order with no overlap, and every
//! non-empty slot has `references >= 1`.
//!
//! # Parity reservation
//! The file tail reserves two parity bytes per 253-byte codeword of the
//! rest of the file, zero-filled, for a Reed–Solomon repair pass that a
//! later format version may populate.  Current readers and writers never
//! touch it; `repair` reports nothing fixable.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::trace;

use crate::id::{ChunkId, CHUNK_ID_LEN};
use crate::FILE_VERSION;

use super::{PutOutcome, StoreError};

/// On-disk magic for every bucket file.
pub const BUCKET_MAGIC: &[u8; 4] = b"ARWB";

/// Fixed byte size of the bucket header.
pub const BUCKET_HEADER_SIZE: usize = 11;

/// Byte size of one key slot.
pub const SLOT_SIZE: usize = 30;

/// Key slots allocated to a fresh bucket.
pub const BUCKET_INITIAL_COUNT: u16 = 5 * 1024;

/// Nominal chunk length the data region is sized for.  Real chunks can
/// be any length up to the synchronizer maximum.
pub const NOMINAL_CHUNK_SIZE: u32 = 1000;

/// Reed–Solomon codeword size the parity reservation is computed over.
pub const RS_CODEWORD_SIZE: u64 = 253;

/// Reserved parity bytes per codeword.
pub const RS_PARITY_SIZE: u64 = 2;

fn align_up(value: u64, step: u64) -> u64 {
    value.div_ceil(step) * step
}

/// Total file size for a bucket with the given geometry, including the
/// zero-filled parity reservation.
fn bucket_file_size(chunk_count: u16, alloc_size: u32) -> u64 {
    let body = BUCKET_HEADER_SIZE as u64
        + chunk_count as u64 * SLOT_SIZE as u64
        + alloc_size as u64;
    let aligned = align_up(body, RS_CODEWORD_SIZE);
    aligned + (aligned / RS_CODEWORD_SIZE) * RS_PARITY_SIZE
}

// ── Slot ─────────────────────────────────────────────────────────────────────

/// Decoded key slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    pub id: ChunkId,
    pub offset: u32,
    pub length: u32,
    pub references: u16,
}

impl Slot {
    #[inline]
    pub fn is_null(&self) -> bool {
        self.id.is_null() && self.offset == 0 && self.length == 0 && self.references == 0
    }
}

// ── Bucket ───────────────────────────────────────────────────────────────────

pub struct Bucket {
    pub ordinal: u64,
    map: MmapMut,
    #[allow(dead_code)]
    file: File,
}

impl Bucket {
    pub fn path_of(blocks_dir: &Path, ordinal: u64) -> PathBuf {
        blocks_dir.join(crate::b64::encode(ordinal))
    }

    /// Create a bucket file with the default geometry.  A no-op if the
    /// file already exists, so re-running an interrupted split never
    /// clobbers a populated destination.
    pub fn create(blocks_dir: &Path, ordinal: u64) -> Result<(), StoreError> {
        let path = Self::path_of(blocks_dir, ordinal);
        if path.exists() {
            return Ok(());
        }
        let alloc_size = BUCKET_INITIAL_COUNT as u32 * NOMINAL_CHUNK_SIZE;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.set_len(bucket_file_size(BUCKET_INITIAL_COUNT, alloc_size))?;

        let mut header = [0u8; BUCKET_HEADER_SIZE];
        header[..4].copy_from_slice(BUCKET_MAGIC);
        header[4] = FILE_VERSION;
        header[5..7].copy_from_slice(&BUCKET_INITIAL_COUNT.to_be_bytes());
        header[7..11].copy_from_slice(&alloc_size.to_be_bytes());
        use std::os::unix::fs::FileExt;
        file.write_all_at(&header, 0)?;
        trace!(ordinal, alloc_size, "created bucket");
        Ok(())
    }

    /// Map an existing bucket read-write and validate its header.
    pub fn open(blocks_dir: &Path, ordinal: u64) -> Result<Bucket, StoreError> {
        let path = Self::path_of(blocks_dir, ordinal);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        // Safety: bucket files are never truncated while mapped, and the
        // store is single-writer by contract.
        let map = unsafe { MmapMut::map_mut(&file)? };

        if map.len() < BUCKET_HEADER_SIZE {
            return Err(StoreError::Corrupt(format!(
                "bucket {ordinal}: file shorter than header"
            )));
        }
        if &map[..4] != BUCKET_MAGIC {
            return Err(StoreError::Corrupt(format!("bucket {ordinal}: bad magic")));
        }
        if map[4] != FILE_VERSION {
            return Err(StoreError::Corrupt(format!(
                "bucket {ordinal}: unsupported version {}",
                map[4]
            )));
        }

        let bucket = Bucket { ordinal, map, file };
        let needed = bucket.data_offset() + bucket.alloc_size() as usize;
        if bucket.map.len() < needed {
            return Err(StoreError::Corrupt(format!(
                "bucket {ordinal}: file shorter than declared regions"
            )));
        }
        Ok(bucket)
    }

    // ── Header ──────────────────────────────────────────────────────────────

    #[inline]
    pub fn chunk_count(&self) -> u16 {
        u16::from_be_bytes(self.map[5..7].try_into().unwrap())
    }

    #[inline]
    pub fn alloc_size(&self) -> u32 {
        u32::from_be_bytes(self.map[7..11].try_into().unwrap())
    }

    #[inline]
    fn data_offset(&self) -> usize {
        BUCKET_HEADER_SIZE + self.chunk_count() as usize * SLOT_SIZE
    }

    // ── Slots ───────────────────────────────────────────────────────────────

    #[inline]
    fn slot_offset(&self, index: usize) -> usize {
        BUCKET_HEADER_SIZE + index * SLOT_SIZE
    }

    pub fn slot(&self, index: usize) -> Slot {
        let at = self.slot_offset(index);
        let buf = &self.map[at..at + SLOT_SIZE];
        let id_bytes: [u8; CHUNK_ID_LEN] = buf[..CHUNK_ID_LEN].try_into().unwrap();
        Slot {
            id: ChunkId::from_bytes(&id_bytes),
            offset: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            length: u32::from_be_bytes(buf[24..28].try_into().unwrap()),
            references: u16::from_be_bytes(buf[28..30].try_into().unwrap()),
        }
    }

    pub fn set_slot(&mut self, index: usize, slot: &Slot) {
        let at = self.slot_offset(index);
        let buf = &mut self.map[at..at + SLOT_SIZE];
        buf[..CHUNK_ID_LEN].copy_from_slice(&slot.id.to_bytes());
        buf[20..24].copy_from_slice(&slot.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&slot.length.to_be_bytes());
        buf[28..30].copy_from_slice(&slot.references.to_be_bytes());
    }

    pub fn clear_slot(&mut self, index: usize) {
        let at = self.slot_offset(index);
        self.map[at..at + SLOT_SIZE].fill(0);
    }

    fn find(&self, id: &ChunkId) -> Option<(usize, Slot)> {
        (0..self.chunk_count() as usize)
            .map(|i| (i, self.slot(i)))
            .find(|(_, s)| s.id == *id && !s.is_null())
    }

    /// The chunk body stored under slot `index`.
    pub fn chunk_bytes(&self, index: usize) -> &[u8] {
        let slot = self.slot(index);
        let base = self.data_offset() + slot.offset as usize;
        &self.map[base..base + slot.length as usize]
    }

    // ── Operations ──────────────────────────────────────────────────────────

    /// Insert `data` under `id`, or bump the refcount if already present.
    pub fn put(&mut self, id: &ChunkId, data: &[u8]) -> Result<PutOutcome, StoreError> {
        match self.put_inner(id, data, 1, true) {
            Ok(true) => Ok(PutOutcome::Inserted),
            Ok(false) => Ok(PutOutcome::AlreadyPresent),
            Err(e) => Err(e),
        }
    }

    /// Split-move insert: place `data` with `references` preserved, or
    /// leave an existing slot untouched.  Returns whether a slot was
    /// written, so an interrupted and re-run split stays idempotent.
    pub fn put_preserving(
        &mut self,
        id: &ChunkId,
        data: &[u8],
        references: u16,
    ) -> Result<bool, StoreError> {
        self.put_inner(id, data, references, false)
    }

    fn put_inner(
        &mut self,
        id: &ChunkId,
        data: &[u8],
        references: u16,
        bump_existing: bool,
    ) -> Result<bool, StoreError> {
        let count = self.chunk_count() as usize;
        let alloc = self.alloc_size();
        let len = data.len() as u32;

        // End of the chunk data preceding the current slot.
        let mut offset: u32 = 0;
        for i in 0..count {
            let slot = self.slot(i);
            if !slot.is_null() {
                if slot.id == *id {
                    if bump_existing {
                        let mut s = slot;
                        s.references = s.references.saturating_add(1);
                        self.set_slot(i, &s);
                        trace!(bucket = self.ordinal, %id, references = s.references,
                               "chunk already present");
                    }
                    return Ok(false);
                }
                offset = slot.offset + slot.length;
                continue;
            }

            // Empty slot: does the gap before the next occupied slot fit?
            let gap = match (i + 1..count)
                .map(|j| self.slot(j))
                .find(|s| !s.is_null())
            {
                Some(next) => next.offset - offset,
                None => alloc - offset,
            };
            if gap >= len {
                let base = self.data_offset() + offset as usize;
                self.map[base..base + data.len()].copy_from_slice(data);
                self.set_slot(i, &Slot { id: *id, offset, length: len, references });
                trace!(bucket = self.ordinal, %id, slot = i, offset, len, "stored chunk");
                return Ok(true);
            }
        }

        Err(StoreError::BucketFull(self.ordinal))
    }

    pub fn addref(&mut self, id: &ChunkId) -> Result<(), StoreError> {
        let (i, mut slot) = self.find(id).ok_or(StoreError::NotFound)?;
        slot.references = slot.references.saturating_add(1);
        self.set_slot(i, &slot);
        Ok(())
    }

    #[cfg(feature = "dec-ref")]
    pub fn decref(&mut self, id: &ChunkId) -> Result<u16, StoreError> {
        let (i, mut slot) = self.find(id).ok_or(StoreError::NotFound)?;
        slot.references = slot.references.saturating_sub(1);
        self.set_slot(i, &slot);
        // Zero-refcount chunks stay in place; reclamation is a separate,
        // future compaction pass.
        Ok(slot.references)
    }

    /// Copy the chunk into `out` (up to its capacity) and return the
    /// full chunk length.
    pub fn get(&self, id: &ChunkId, out: &mut [u8]) -> Result<usize, StoreError> {
        let (i, slot) = self.find(id).ok_or(StoreError::NotFound)?;
        let bytes = self.chunk_bytes(i);
        let n = bytes.len().min(out.len());
        out[..n].copy_from_slice(&bytes[..n]);
        Ok(slot.length as usize)
    }

    pub fn get_len(&self, id: &ChunkId) -> Result<usize, StoreError> {
        self.find(id)
            .map(|(_, s)| s.length as usize)
            .ok_or(StoreError::NotFound)
    }

    #[inline]
    pub fn contains(&self, id: &ChunkId) -> bool {
        self.find(id).is_some()
    }

    /// Current refcount of a chunk, if stored here.
    pub fn references(&self, id: &ChunkId) -> Option<u16> {
        self.find(id).map(|(_, s)| s.references)
    }

    /// Fraction of key slots in use.
    pub fn load_factor(&self) -> f64 {
        let count = self.chunk_count() as usize;
        let used = (0..count).filter(|&i| !self.slot(i).is_null()).count();
        used as f64 / count as f64
    }

    /// Number of occupied slots and total chunk bytes they hold.
    pub fn usage(&self) -> (usize, u64) {
        let mut slots = 0usize;
        let mut bytes = 0u64;
        for i in 0..self.chunk_count() as usize {
            let s = self.slot(i);
            if !s.is_null() {
                slots += 1;
                bytes += s.length as u64;
            }
        }
        (slots, bytes)
    }

    /// Shift occupied slots to the front, in order, and repack the data
    /// region with no holes.
    pub fn compact(&mut self) {
        let count = self.chunk_count() as usize;
        let data_base = self.data_offset();
        let mut write_slot = 0usize;
        let mut write_off: u32 = 0;

        for i in 0..count {
            let slot = self.slot(i);
            if slot.is_null() {
                continue;
            }
            if i != write_slot || slot.offset != write_off {
                let src = data_base + slot.offset as usize;
                let dst = data_base + write_off as usize;
                self.map
                    .copy_within(src..src + slot.length as usize, dst);
                self.set_slot(write_slot, &Slot { offset: write_off, ..slot });
                if i != write_slot {
                    self.clear_slot(i);
                }
            }
            write_off += slot.length;
            write_slot += 1;
        }
        trace!(bucket = self.ordinal, slots = write_slot, bytes = write_off, "compacted");
    }

    /// Recompute both sums for every occupied slot; return the indices
    /// that no longer match their recorded id.
    pub fn verify(&self) -> Vec<usize> {
        let mut bad = Vec::new();
        let alloc = self.alloc_size();
        for i in 0..self.chunk_count() as usize {
            let slot = self.slot(i);
            if slot.is_null() {
                continue;
            }
            // A corrupt offset or length would make the recompute read
            // the wrong bytes; flag it without touching the data region.
            if slot.offset > alloc || slot.offset.saturating_add(slot.length) > alloc {
                bad.push(i);
                continue;
            }
            let actual = ChunkId::compute(self.chunk_bytes(i));
            if actual.weak != slot.id.weak || actual.strong != slot.id.strong {
                trace!(bucket = self.ordinal, slot = i, expected = %slot.id,
                       got = %actual, "checksum mismatch");
                bad.push(i);
            }
        }
        bad
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fresh_bucket() -> (TempDir, Bucket) {
        let dir = TempDir::new().unwrap();
        Bucket::create(dir.path(), 0).unwrap();
        let bucket = Bucket::open(dir.path(), 0).unwrap();
        (dir, bucket)
    }

    fn chunk(fill: u8, len: usize) -> (ChunkId, Vec<u8>) {
        let data = vec![fill; len];
        (ChunkId::compute(&data), data)
    }

    #[test]
    fn create_sizes_and_header() {
        let (_dir, bucket) = fresh_bucket();
        assert_eq!(bucket.chunk_count(), BUCKET_INITIAL_COUNT);
        assert_eq!(
            bucket.alloc_size(),
            BUCKET_INITIAL_COUNT as u32 * NOMINAL_CHUNK_SIZE
        );
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, mut bucket) = fresh_bucket();
        let (id, data) = chunk(0x5A, 900);
        assert!(matches!(bucket.put(&id, &data), Ok(PutOutcome::Inserted)));

        let mut out = vec![0u8; 2000];
        let len = bucket.get(&id, &mut out).unwrap();
        assert_eq!(len, 900);
        assert_eq!(&out[..900], &data[..]);
        assert_eq!(bucket.get_len(&id).unwrap(), 900);
        assert!(bucket.contains(&id));
    }

    #[test]
    fn put_again_bumps_references() {
        let (_dir, mut bucket) = fresh_bucket();
        let (id, data) = chunk(1, 100);
        bucket.put(&id, &data).unwrap();
        assert!(matches!(
            bucket.put(&id, &data),
            Ok(PutOutcome::AlreadyPresent)
        ));
        let (_, slot) = bucket.find(&id).unwrap();
        assert_eq!(slot.references, 2);
    }

    #[test]
    fn get_truncates_to_capacity() {
        let (_dir, mut bucket) = fresh_bucket();
        let (id, data) = chunk(7, 500);
        bucket.put(&id, &data).unwrap();
        let mut out = vec![0u8; 64];
        assert_eq!(bucket.get(&id, &mut out).unwrap(), 500);
        assert_eq!(&out[..], &data[..64]);
    }

    #[test]
    fn missing_key_is_not_found() {
        let (_dir, mut bucket) = fresh_bucket();
        let (id, _) = chunk(9, 50);
        assert!(matches!(bucket.get_len(&id), Err(StoreError::NotFound)));
        assert!(matches!(bucket.addref(&id), Err(StoreError::NotFound)));
    }

    #[test]
    fn compact_repacks_after_holes() {
        let (_dir, mut bucket) = fresh_bucket();
        let chunks: Vec<_> = (0u8..8).map(|i| chunk(i, 200 + i as usize)).collect();
        for (id, data) in &chunks {
            bucket.put(id, data).unwrap();
        }
        // Punch holes at slots 1, 3, 5.
        for i in [1usize, 3, 5] {
            bucket.clear_slot(i);
        }
        bucket.compact();

        // Survivors are packed at the front, in order, data intact.
        let mut expect_off = 0u32;
        for (slot_idx, orig_idx) in [0usize, 2, 4, 6, 7].iter().enumerate() {
            let slot = bucket.slot(slot_idx);
            let (id, data) = &chunks[*orig_idx];
            assert_eq!(slot.id, *id);
            assert_eq!(slot.offset, expect_off);
            assert_eq!(bucket.chunk_bytes(slot_idx), &data[..]);
            expect_off += slot.length;
        }
        assert!(bucket.slot(5).is_null());
        assert!(bucket.slot(7).is_null());
    }

    #[test]
    fn verify_flags_flipped_bytes() {
        let (_dir, mut bucket) = fresh_bucket();
        let (id, data) = chunk(0x42, 300);
        bucket.put(&id, &data).unwrap();
        assert!(bucket.verify().is_empty());

        let base = bucket.data_offset();
        bucket.map[base] ^= 0xFF;
        assert_eq!(bucket.verify(), vec![0]);
    }

    #[test]
    fn magic_mismatch_is_corrupt() {
        let dir = TempDir::new().unwrap();
        Bucket::create(dir.path(), 3).unwrap();
        let path = Bucket::path_of(dir.path(), 3);
        let contents = std::fs::read(&path).unwrap();
        let mut broken = contents;
        broken[0] = b'X';
        std::fs::write(&path, &broken).unwrap();
        assert!(matches!(
            Bucket::open(dir.path(), 3),
            Err(StoreError::Corrupt(_))
        ));
    }
}
