//! Content-addressed block store with linear hashing.
//!
//! The store is one logical map `ChunkId -> (bytes, refcount)` sharded
//! across bucket files (see [`bucket`]).  Bucket selection is classic
//! linear hashing over the low eight bytes of the strong sum: with
//! superblock state `(i, n)`, `key = x mod 2^i`, and keys below the
//! split pointer `n` re-hash at level `i + 1`.
//!
//! # Superblock (`.superblock`, 15 bytes, big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      4   magic   = "ARWS"
//!    4      1   format version = 1
//!    5      2   i       linear hash level
//!    7      8   n       split pointer
//! ```
//!
//! # Splits
//! When an insert pushes a bucket's load factor past
//! [`MAX_LOAD_FACTOR`], bucket `n` is split into a new bucket `2^i + n`:
//! every slot re-hashing to the new bucket moves (refcount preserved),
//! the source compacts, both buckets flush, and only then does the
//! superblock advance.  Source slots are zeroed only after the
//! destination slot is written and destination inserts skip
//! already-present keys, so an interrupted split can simply be re-run.
//!
//! # Single writer
//! At most one process may mutate a store at a time; in-process, every
//! mutating operation takes `&mut self`.  Readers in the same process
//! during mutation are fine.

pub mod bucket;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::{debug, trace};

use crate::id::ChunkId;
use crate::FILE_VERSION;

use self::bucket::Bucket;

/// Superblock file name, directly under the store root.
pub const SUPERBLOCK_FILE: &str = ".superblock";

/// Bucket directory name, directly under the store root.
pub const BLOCKS_DIR: &str = "blocks";

/// On-disk magic of the superblock.
pub const SUPERBLOCK_MAGIC: &[u8; 4] = b"ARWS";

const SUPERBLOCK_SIZE: usize = 15;

/// Load factor above which an insert triggers a split.
pub const MAX_LOAD_FACTOR: f64 = 0.70;

/// Open bucket maps kept cached.
const CACHE_SIZE: usize = 128;

/// Upper bound on splits forced by a full bucket before giving up.
const MAX_FORCED_SPLITS: u32 = 1024;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Magic/version mismatch or violated slot invariants.  Fatal for
    /// the affected bucket; operations refuse to proceed.
    #[error("corrupt store: {0}")]
    Corrupt(String),
    #[error("chunk not found")]
    NotFound,
    #[error("bucket {0} is full")]
    BucketFull(u64),
}

/// Soft result of [`BlockStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    /// The chunk was already stored; its refcount was incremented.
    AlreadyPresent,
}

struct CachedBucket {
    bucket: Bucket,
    stamp: u64,
}

pub struct BlockStore {
    root: PathBuf,
    blocks_dir: PathBuf,
    sb: MmapMut,
    #[allow(dead_code)]
    sb_file: File,
    cache: HashMap<u64, CachedBucket>,
    clock: u64,
}

impl BlockStore {
    /// Open the store at `root`, creating superblock and bucket 0 on
    /// first use.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_owned();
        fs::create_dir_all(&root)?;
        let blocks_dir = root.join(BLOCKS_DIR);

        let sb_path = root.join(SUPERBLOCK_FILE);
        let create = !sb_path.exists();
        let sb_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&sb_path)?;
        if create {
            sb_file.set_len(SUPERBLOCK_SIZE as u64)?;
        }
        // Safety: the superblock is never truncated while mapped; the
        // store is single-writer by contract.
        let mut sb = unsafe { MmapMut::map_mut(&sb_file)? };
        if sb.len() < SUPERBLOCK_SIZE {
            return Err(StoreError::Corrupt("superblock too short".into()));
        }

        if create {
            sb[..4].copy_from_slice(SUPERBLOCK_MAGIC);
            sb[4] = FILE_VERSION;
            sb[5..7].fill(0);
            sb[7..15].fill(0);
            sb.flush()?;
            fs::create_dir_all(&blocks_dir)?;
            Bucket::create(&blocks_dir, 0)?;
            debug!(root = %root.display(), "initialized empty store");
        } else {
            if &sb[..4] != SUPERBLOCK_MAGIC {
                return Err(StoreError::Corrupt("superblock: bad magic".into()));
            }
            if sb[4] != FILE_VERSION {
                return Err(StoreError::Corrupt(format!(
                    "superblock: unsupported version {}",
                    sb[4]
                )));
            }
        }

        let store = BlockStore {
            root,
            blocks_dir,
            sb,
            sb_file,
            cache: HashMap::new(),
            clock: 0,
        };
        trace!(i = store.level(), n = store.split_pointer(), "opened store");
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ── Superblock fields ───────────────────────────────────────────────────

    #[inline]
    pub fn level(&self) -> u16 {
        u16::from_be_bytes(self.sb[5..7].try_into().unwrap())
    }

    #[inline]
    pub fn split_pointer(&self) -> u64 {
        u64::from_be_bytes(self.sb[7..15].try_into().unwrap())
    }

    fn set_state(&mut self, i: u16, n: u64) {
        self.sb[5..7].copy_from_slice(&i.to_be_bytes());
        self.sb[7..15].copy_from_slice(&n.to_be_bytes());
    }

    /// Buckets currently in existence: `2^i + n`.
    pub fn bucket_count(&self) -> u64 {
        (1u64 << self.level()) + self.split_pointer()
    }

    // ── Bucket selection ────────────────────────────────────────────────────

    fn map_key_with(&self, id: &ChunkId, n: u64) -> u64 {
        let x = id.hash_value();
        let i = self.level() as u32;
        let mut key = x & ((1u64 << i) - 1);
        if key < n {
            key = x & ((1u64 << (i + 1)) - 1);
        }
        key
    }

    /// The bucket ordinal `id` currently lives in.
    pub fn bucket_for(&self, id: &ChunkId) -> u64 {
        self.map_key_with(id, self.split_pointer())
    }

    // ── Bucket cache ────────────────────────────────────────────────────────

    fn bucket_mut(&mut self, ordinal: u64) -> Result<&mut Bucket, StoreError> {
        self.clock += 1;
        let stamp = self.clock;
        if !self.cache.contains_key(&ordinal) {
            let bucket = Bucket::open(&self.blocks_dir, ordinal)?;
            self.evict_to_fit()?;
            self.cache.insert(ordinal, CachedBucket { bucket, stamp });
        }
        let entry = self.cache.get_mut(&ordinal).unwrap();
        entry.stamp = stamp;
        Ok(&mut entry.bucket)
    }

    /// Detach a bucket from the cache for use alongside another mutable
    /// bucket borrow (the split path).
    fn take_bucket(&mut self, ordinal: u64) -> Result<Bucket, StoreError> {
        match self.cache.remove(&ordinal) {
            Some(entry) => Ok(entry.bucket),
            None => Bucket::open(&self.blocks_dir, ordinal),
        }
    }

    fn put_back(&mut self, bucket: Bucket) -> Result<(), StoreError> {
        self.clock += 1;
        let stamp = self.clock;
        self.evict_to_fit()?;
        self.cache
            .insert(bucket.ordinal, CachedBucket { bucket, stamp });
        Ok(())
    }

    fn evict_to_fit(&mut self) -> Result<(), StoreError> {
        while self.cache.len() >= CACHE_SIZE {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|(_, e)| e.stamp)
                .map(|(&k, _)| k)
                .expect("cache nonempty");
            let entry = self.cache.remove(&oldest).unwrap();
            entry.bucket.flush()?;
            trace!(ordinal = oldest, "evicted bucket map");
        }
        Ok(())
    }

    // ── Public operations ───────────────────────────────────────────────────

    /// Insert a chunk, or bump its refcount if already present.  May
    /// trigger a split; a full bucket forces splits until the insert
    /// fits.
    pub fn put(&mut self, id: &ChunkId, data: &[u8]) -> Result<PutOutcome, StoreError> {
        let mut forced = 0u32;
        loop {
            let ordinal = self.bucket_for(id);
            let (result, load) = {
                let bucket = self.bucket_mut(ordinal)?;
                let result = bucket.put(id, data);
                let load = bucket.load_factor();
                (result, load)
            };
            match result {
                Ok(outcome) => {
                    trace!(ordinal, load, "put complete");
                    if load > MAX_LOAD_FACTOR {
                        self.split_next()?;
                    }
                    return Ok(outcome);
                }
                Err(StoreError::BucketFull(_)) => {
                    forced += 1;
                    if forced > MAX_FORCED_SPLITS {
                        return Err(StoreError::BucketFull(ordinal));
                    }
                    debug!(ordinal, forced, "bucket full, forcing split");
                    self.split_next()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn addref(&mut self, id: &ChunkId) -> Result<(), StoreError> {
        let ordinal = self.bucket_for(id);
        self.bucket_mut(ordinal)?.addref(id)
    }

    /// Decrement a chunk's refcount.  The chunk is never removed at
    /// zero; reclamation is a future compaction pass.
    #[cfg(feature = "dec-ref")]
    pub fn decref(&mut self, id: &ChunkId) -> Result<u16, StoreError> {
        let ordinal = self.bucket_for(id);
        self.bucket_mut(ordinal)?.decref(id)
    }

    /// Copy the chunk into `out` (up to its capacity); returns the full
    /// chunk length.
    pub fn get(&mut self, id: &ChunkId, out: &mut [u8]) -> Result<usize, StoreError> {
        let ordinal = self.bucket_for(id);
        self.bucket_mut(ordinal)?.get(id, out)
    }

    pub fn get_len(&mut self, id: &ChunkId) -> Result<usize, StoreError> {
        let ordinal = self.bucket_for(id);
        self.bucket_mut(ordinal)?.get_len(id)
    }

    pub fn contains(&mut self, id: &ChunkId) -> Result<bool, StoreError> {
        let ordinal = self.bucket_for(id);
        Ok(self.bucket_mut(ordinal)?.contains(id))
    }

    /// Current refcount of a chunk.
    pub fn references(&mut self, id: &ChunkId) -> Result<u16, StoreError> {
        let ordinal = self.bucket_for(id);
        self.bucket_mut(ordinal)?
            .references(id)
            .ok_or(StoreError::NotFound)
    }

    /// Recompute both sums for every chunk in one bucket; returns the
    /// slot indices that fail.
    pub fn verify(&mut self, ordinal: u64) -> Result<Vec<usize>, StoreError> {
        Ok(self.bucket_mut(ordinal)?.verify())
    }

    /// Verify every bucket; returns the total number of bad slots.
    pub fn verify_all(&mut self) -> Result<usize, StoreError> {
        let mut failures = 0;
        for ordinal in 0..self.bucket_count() {
            failures += self.verify(ordinal)?.len();
        }
        Ok(failures)
    }

    /// Attempt to repair slots that failed verification.  The parity
    /// reservation is not populated yet, so nothing is fixable.
    pub fn repair(&mut self, _ordinal: u64) -> Result<usize, StoreError> {
        Ok(0)
    }

    /// `(used_logical_bytes, total_on_disk_bytes)` across all buckets.
    pub fn size(&mut self) -> Result<(u64, u64), StoreError> {
        let mut used = 0u64;
        let mut total = 0u64;
        for ordinal in 0..self.bucket_count() {
            let path = Bucket::path_of(&self.blocks_dir, ordinal);
            total += fs::metadata(&path)?.len();

            let bucket = self.bucket_mut(ordinal)?;
            let (slots, bytes) = bucket.usage();
            let mut u = bucket::BUCKET_HEADER_SIZE as u64
                + slots as u64 * bucket::SLOT_SIZE as u64
                + bytes;
            u += u.div_ceil(bucket::RS_CODEWORD_SIZE) * bucket::RS_PARITY_SIZE;
            used += u;
        }
        Ok((used, total))
    }

    pub fn dump(&self, out: &mut impl Write) -> io::Result<()> {
        writeln!(out, "Store root: {}", self.root.display())?;
        writeln!(
            out,
            "Superblock: magic {:?}, version {}",
            std::str::from_utf8(SUPERBLOCK_MAGIC).unwrap(),
            self.sb[4]
        )?;
        writeln!(
            out,
            "i: {}; n: {}; buckets: {}",
            self.level(),
            self.split_pointer(),
            self.bucket_count()
        )
    }

    // ── Split ───────────────────────────────────────────────────────────────

    /// Split the bucket at the split pointer into `2^i + n` and advance
    /// the pointer.
    pub fn split_next(&mut self) -> Result<(), StoreError> {
        let i = self.level();
        let n = self.split_pointer();
        let target = (1u64 << i) + n;
        debug!(from = n, to = target, i, "splitting bucket");

        Bucket::create(&self.blocks_dir, target)?;

        let mut source = self.take_bucket(n)?;
        let mut moved = 0usize;
        let mut kept = 0usize;
        for idx in 0..source.chunk_count() as usize {
            let slot = source.slot(idx);
            if slot.is_null() {
                continue;
            }
            // Re-map at the extended level: does this slot stay put?
            let key = self.map_key_with(&slot.id, n + 1);
            if key == n {
                kept += 1;
                continue;
            }
            debug_assert_eq!(key, target);
            let data = source.chunk_bytes(idx).to_vec();
            let destination = self.bucket_mut(target)?;
            destination.put_preserving(&slot.id, &data, slot.references)?;
            source.clear_slot(idx);
            moved += 1;
        }

        // Both buckets reach disk before the superblock moves on; an
        // interrupted split is re-run from the old (i, n).
        self.bucket_mut(target)?.flush()?;
        source.compact();
        source.flush()?;
        self.put_back(source)?;

        let limit = (1u64 << i) - 1;
        if n == limit {
            self.set_state(i + 1, 0);
        } else {
            self.set_state(i, n + 1);
        }
        self.sb.flush()?;

        debug!(
            moved,
            kept,
            i = self.level(),
            n = self.split_pointer(),
            "split complete"
        );
        Ok(())
    }
}
