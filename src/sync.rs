//! Delta synchronizer — turns an input stream into a chunk stream.
//!
//! Two entry points produce an ordered stream of chunk entries through
//! a small callback bundle:
//!
//! - [`generate`] has no basis: the input is cut into `chunk_size`
//!   blocks, each inlined (≤ 23 bytes) or stored and referenced.
//! - [`diff`] aligns the input against a prior version: a rolling weak
//!   checksum slides a `chunk_size` window over the input, probing a
//!   table of the basis's full-size chunks; weak hits are confirmed by
//!   MD5.  Confirmed matches become references to already-stored
//!   chunks (refcount bumped); the bytes between matches are chopped
//!   into literal runs and inlined or stored like fresh chunks.
//!
//! Rules the chunk stream depends on:
//! - input is scanned strictly left to right; a confirmed match
//!   advances by exactly `chunk_size` (no partial overlap),
//! - only basis chunks whose length equals the basis `chunk_size` are
//!   match candidates,
//! - a chunk is stored (or ref-bumped) before the entry referencing it
//!   is emitted, so every reference resolves by the time the `End`
//!   entry lands,
//! - the recorded whole-file hash is the MD5 of the input bytes in
//!   file order, independent of chunking.
//!
//! Callbacks are invoked synchronously from the scan loop; there is one
//! input consumer and one callback producer per call.

use std::io::{self, Read, Seek, SeekFrom};

use md5::{Digest, Md5};
use thiserror::Error;
use tracing::{debug, trace};

use crate::cbuf::RingBuffer;
use crate::chunk::{ChunkEntry, EntryError, MAX_DIRECT_CHUNK_SIZE};
use crate::filer::{FilerError, VersionFile};
use crate::id::{ChunkId, MD5_LEN};
use crate::rollsum::Rollsum;
use crate::rpc::RpcError;
use crate::store::{BlockStore, StoreError};

/// Smallest chunk size `generate` will choose.
pub const MIN_CHUNK_SIZE: u32 = 700;

/// Largest chunk size `generate` will choose.
pub const MAX_CHUNK_SIZE: u32 = 16000;

/// Initial probe table capacity; the table rehashes at double size
/// when it passes three-quarters full.
const PROBE_TABLE_INITIAL: usize = 1 << 14;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Filer(#[from] FilerError),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("basis chunk size {0} outside {MIN_CHUNK_SIZE}..={MAX_CHUNK_SIZE}")]
    InvalidChunkSize(u32),
}

/// The synchronizer's view of wherever chunks go: the local store and
/// record in local mode, the RPC peer in remote mode.
pub trait Callbacks {
    fn add_ref(&mut self, id: &ChunkId) -> Result<(), SyncError>;
    fn put_block(&mut self, id: &ChunkId, data: &[u8]) -> Result<(), SyncError>;
    fn contains(&mut self, id: &ChunkId) -> Result<bool, SyncError>;
    fn emit_chunk(&mut self, entry: &ChunkEntry) -> Result<(), SyncError>;
}

/// Local-mode callbacks: chunks into the block store, entries into the
/// open version record.
pub struct StoreCallbacks<'a> {
    pub store: &'a mut BlockStore,
    pub out: &'a mut VersionFile,
}

impl Callbacks for StoreCallbacks<'_> {
    fn add_ref(&mut self, id: &ChunkId) -> Result<(), SyncError> {
        self.store.addref(id)?;
        Ok(())
    }

    fn put_block(&mut self, id: &ChunkId, data: &[u8]) -> Result<(), SyncError> {
        self.store.put(id, data)?;
        Ok(())
    }

    fn contains(&mut self, id: &ChunkId) -> Result<bool, SyncError> {
        Ok(self.store.contains(id)?)
    }

    fn emit_chunk(&mut self, entry: &ChunkEntry) -> Result<(), SyncError> {
        self.out.append_entry(entry)?;
        Ok(())
    }
}

/// Result of [`generate`]; the caller records both fields in the new
/// version's header.
#[derive(Debug, Clone, Copy)]
pub struct GenerateOutcome {
    pub chunk_size: u32,
    pub hash: [u8; MD5_LEN],
}

/// Result of [`diff`].
#[derive(Debug, Clone, Copy)]
pub enum DiffOutcome {
    /// The input's whole-file MD5 equals the basis hash; nothing was
    /// emitted.
    Unchanged,
    /// A chunk stream was emitted; `hash` is the input's whole-file MD5.
    Synced { hash: [u8; MD5_LEN] },
}

/// Nominal chunk length for an input of `size` bytes: the square root,
/// clamped to the configured bounds.
pub fn chunk_size_for(size: u64) -> u32 {
    ((size as f64).sqrt() as u32).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// MD5 of everything remaining in `input`.
pub fn file_md5<R: Read>(input: &mut R) -> io::Result<[u8; MD5_LEN]> {
    let mut md5 = Md5::new();
    let mut buf = [0u8; 1024];
    loop {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => md5.update(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(md5.finalize().into())
}

/// Read until `buf` is full or the input ends; returns bytes read.
fn read_full<R: Read>(input: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn read_byte<R: Read>(input: &mut R) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Inline or store-and-reference one block of input.
///
/// An already-present chunk gets a refcount bump; a fresh insert
/// carries refcount one from the store itself, with no extra add_ref.
/// Either way the chunk is accounted for before the entry referencing
/// it is emitted.
fn emit_block<C: Callbacks>(data: &[u8], cb: &mut C) -> Result<(), SyncError> {
    if data.len() <= MAX_DIRECT_CHUNK_SIZE {
        trace!(len = data.len(), "direct chunk");
        cb.emit_chunk(&ChunkEntry::direct(data))?;
        return Ok(());
    }
    let id = ChunkId::compute(data);
    trace!(len = data.len(), %id, "reference chunk");
    if cb.contains(&id)? {
        cb.add_ref(&id)?;
    } else {
        cb.put_block(&id, data)?;
    }
    cb.emit_chunk(&ChunkEntry::Reference { length: data.len() as u32, id })?;
    Ok(())
}

/// Emit the byte range `[from, to)` of `input` as literal runs of at
/// most `chunk_size` bytes each, re-reading them through `scratch`.
fn emit_literals<R, C>(
    input: &mut R,
    scratch: &mut [u8],
    from: u64,
    to: u64,
    chunk_size: usize,
    cb: &mut C,
) -> Result<(), SyncError>
where
    R: Read + Seek,
    C: Callbacks,
{
    if from >= to {
        return Ok(());
    }
    input.seek(SeekFrom::Start(from))?;
    let mut at = from;
    while at < to {
        let n = ((to - at) as usize).min(chunk_size);
        input.read_exact(&mut scratch[..n])?;
        emit_block(&scratch[..n], cb)?;
        at += n as u64;
    }
    Ok(())
}

// ── generate ─────────────────────────────────────────────────────────────────

/// Produce the chunk stream for an input with no basis.
pub fn generate<R, C>(input: &mut R, cb: &mut C) -> Result<GenerateOutcome, SyncError>
where
    R: Read + Seek,
    C: Callbacks,
{
    let size = input.seek(SeekFrom::End(0))?;
    input.rewind()?;
    let chunk_size = chunk_size_for(size);
    debug!(size, chunk_size, "generate");

    let mut md5 = Md5::new();
    let mut buf = vec![0u8; chunk_size as usize];
    loop {
        let n = read_full(input, &mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        emit_block(&buf[..n], cb)?;
        if n < buf.len() {
            break;
        }
    }
    cb.emit_chunk(&ChunkEntry::End)?;
    Ok(GenerateOutcome { chunk_size, hash: md5.finalize().into() })
}

// ── diff ─────────────────────────────────────────────────────────────────────

/// Produce the chunk stream for an input against a basis version.
///
/// With `check_hash`, the input is hashed first and `Unchanged` is
/// returned — with nothing emitted — when it equals the basis hash.
pub fn diff<R, C>(
    basis: &VersionFile,
    input: &mut R,
    cb: &mut C,
    check_hash: bool,
) -> Result<DiffOutcome, SyncError>
where
    R: Read + Seek,
    C: Callbacks,
{
    let chunk_size = basis.chunk_size();
    if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&chunk_size) {
        return Err(SyncError::InvalidChunkSize(chunk_size));
    }
    let cs = chunk_size as usize;
    debug!(basis = %basis.uuid, chunk_size, check_hash, "diff");

    if check_hash {
        if file_md5(input)? == basis.hash() {
            debug!("whole-file hash matches basis; skipping");
            return Ok(DiffOutcome::Unchanged);
        }
        input.rewind()?;
    }

    // Match candidates: every full-size reference chunk of the basis.
    let mut table = ProbeTable::new();
    for entry in basis.entries() {
        if let ChunkEntry::Reference { length, id } = entry? {
            if length == chunk_size {
                table.insert(id);
            }
        }
    }

    let mut md5 = Md5::new();
    let mut ring = RingBuffer::new(cs);

    let n = read_full(input, ring.storage_mut())?;
    md5.update(&ring.storage()[..n]);
    if n < cs {
        // Input shorter than one chunk: a single literal and done.
        trace!(len = n, "input shorter than chunk size");
        emit_block(&ring.storage()[..n], cb)?;
        cb.emit_chunk(&ChunkEntry::End)?;
        return Ok(DiffOutcome::Synced { hash: md5.finalize().into() });
    }

    let mut rollsum = Rollsum::new();
    rollsum.update(ring.storage());

    let mut last_match: u64 = 0;
    let mut matches = 0usize;
    loop {
        if table.probe_weak(rollsum.digest()) {
            let candidate = ChunkId { weak: rollsum.digest(), strong: ring.md5() };
            if table.contains(&candidate) {
                // The window covers [cur - cs, cur); everything since
                // the last match up to the window start is literal.
                let cur = input.stream_position()?;
                matches += 1;
                trace!(cur, last_match, "match confirmed");

                emit_literals(input, ring.storage_mut(), last_match, cur - cs as u64, cs, cb)?;
                ring.reset();

                cb.add_ref(&candidate)?;
                cb.emit_chunk(&ChunkEntry::Reference { length: chunk_size, id: candidate })?;

                // Advance past the matched block and restart the window.
                input.seek(SeekFrom::Start(cur))?;
                last_match = cur;
                let n = read_full(input, ring.storage_mut())?;
                md5.update(&ring.storage()[..n]);
                if n < cs {
                    break;
                }
                rollsum = Rollsum::new();
                rollsum.update(ring.storage());
                continue;
            }
        }

        match read_byte(input)? {
            None => break,
            Some(b) => {
                md5.update([b]);
                rollsum.rotate(ring.oldest(), b);
                ring.push(b);
            }
        }
    }

    // Whatever is left past the final match is literal tail.
    let cur = input.stream_position()?;
    if last_match < cur {
        trace!(tail = cur - last_match, "trailing literals");
        emit_literals(input, ring.storage_mut(), last_match, cur, cs, cb)?;
    }

    cb.emit_chunk(&ChunkEntry::End)?;
    debug!(matches, "diff complete");
    Ok(DiffOutcome::Synced { hash: md5.finalize().into() })
}

// ── Probe table ──────────────────────────────────────────────────────────────

/// Open-addressed table of basis chunk ids, probed first by weak sum
/// alone (cheap, false positives allowed) and then by full id.
struct ProbeTable {
    slots: Vec<ChunkId>,
    used: usize,
}

impl ProbeTable {
    fn new() -> Self {
        ProbeTable { slots: vec![ChunkId::NULL; PROBE_TABLE_INITIAL], used: 0 }
    }

    fn insert(&mut self, id: ChunkId) {
        if id.is_null() || self.contains(&id) {
            return;
        }
        if (self.used + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        Self::place(&mut self.slots, id);
        self.used += 1;
    }

    fn grow(&mut self) {
        let doubled = self.slots.len() * 2;
        let old = std::mem::replace(&mut self.slots, vec![ChunkId::NULL; doubled]);
        for id in old.into_iter().filter(|id| !id.is_null()) {
            Self::place(&mut self.slots, id);
        }
    }

    fn place(slots: &mut [ChunkId], id: ChunkId) {
        let len = slots.len();
        let mut idx = id.weak as usize % len;
        loop {
            if slots[idx].is_null() {
                slots[idx] = id;
                return;
            }
            if slots[idx] == id {
                return;
            }
            idx = (idx + 1) % len;
        }
    }

    /// Cheap first-stage probe: is any id with this weak sum present?
    fn probe_weak(&self, weak: u32) -> bool {
        let len = self.slots.len();
        let start = weak as usize % len;
        let mut idx = start;
        loop {
            if self.slots[idx].is_null() {
                return false;
            }
            if self.slots[idx].weak == weak {
                return true;
            }
            idx = (idx + 1) % len;
            if idx == start {
                return false;
            }
        }
    }

    fn contains(&self, id: &ChunkId) -> bool {
        let len = self.slots.len();
        let start = id.weak as usize % len;
        let mut idx = start;
        loop {
            if self.slots[idx].is_null() {
                return false;
            }
            if self.slots[idx] == *id {
                return true;
            }
            idx = (idx + 1) % len;
            if idx == start {
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    /// In-memory callback sink for exercising the scan loops alone.
    #[derive(Default)]
    struct MemCallbacks {
        blocks: HashMap<ChunkId, (Vec<u8>, u32)>,
        entries: Vec<ChunkEntry>,
    }

    impl Callbacks for MemCallbacks {
        fn add_ref(&mut self, id: &ChunkId) -> Result<(), SyncError> {
            self.blocks.get_mut(id).expect("addref on absent block").1 += 1;
            Ok(())
        }

        fn put_block(&mut self, id: &ChunkId, data: &[u8]) -> Result<(), SyncError> {
            self.blocks.insert(*id, (data.to_vec(), 1));
            Ok(())
        }

        fn contains(&mut self, id: &ChunkId) -> Result<bool, SyncError> {
            Ok(self.blocks.contains_key(id))
        }

        fn emit_chunk(&mut self, entry: &ChunkEntry) -> Result<(), SyncError> {
            self.entries.push(*entry);
            Ok(())
        }
    }

    fn reconstruct(cb: &MemCallbacks) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &cb.entries {
            match entry {
                ChunkEntry::End => break,
                ChunkEntry::Direct { len, data } => {
                    out.extend_from_slice(&data[..*len as usize]);
                }
                ChunkEntry::Reference { length, id } => {
                    let (bytes, _) = &cb.blocks[id];
                    assert_eq!(bytes.len(), *length as usize);
                    out.extend_from_slice(bytes);
                }
            }
        }
        out
    }

    #[test]
    fn chunk_size_clamps() {
        assert_eq!(chunk_size_for(0), MIN_CHUNK_SIZE);
        assert_eq!(chunk_size_for(1000), MIN_CHUNK_SIZE);
        assert_eq!(chunk_size_for(1_000_000), 1000);
        assert_eq!(chunk_size_for(u64::MAX / 2), MAX_CHUNK_SIZE);
    }

    #[test]
    fn generate_empty_input() {
        let mut cb = MemCallbacks::default();
        let out = generate(&mut Cursor::new(Vec::new()), &mut cb).unwrap();
        assert_eq!(cb.entries, vec![ChunkEntry::End]);
        assert_eq!(out.hash, <[u8; 16]>::from(md5::Md5::digest(b"")));
    }

    #[test]
    fn generate_inline_only() {
        let mut cb = MemCallbacks::default();
        let out = generate(&mut Cursor::new(b"hello\n".to_vec()), &mut cb).unwrap();
        assert_eq!(
            cb.entries,
            vec![ChunkEntry::direct(b"hello\n"), ChunkEntry::End]
        );
        assert!(cb.blocks.is_empty());
        assert_eq!(hex::encode(out.hash), "b1946ac92492d2347c6235b4d2611184");
    }

    #[test]
    fn generate_boundary_23_vs_24() {
        let mut cb = MemCallbacks::default();
        generate(&mut Cursor::new(vec![7u8; 23]), &mut cb).unwrap();
        assert!(matches!(cb.entries[0], ChunkEntry::Direct { len: 23, .. }));
        assert!(cb.blocks.is_empty());

        let mut cb = MemCallbacks::default();
        generate(&mut Cursor::new(vec![7u8; 24]), &mut cb).unwrap();
        assert!(matches!(cb.entries[0], ChunkEntry::Reference { length: 24, .. }));
        assert_eq!(cb.blocks.len(), 1);
    }

    #[test]
    fn generate_splits_at_chunk_size() {
        // 1000 zero bytes: chunk size clamps to 700, so 700 + 300.
        let mut cb = MemCallbacks::default();
        let out = generate(&mut Cursor::new(vec![0u8; 1000]), &mut cb).unwrap();
        assert_eq!(out.chunk_size, 700);
        assert!(
            matches!(cb.entries[0], ChunkEntry::Reference { length: 700, .. })
        );
        assert!(
            matches!(cb.entries[1], ChunkEntry::Reference { length: 300, .. })
        );
        assert_eq!(cb.entries[2], ChunkEntry::End);
        assert_eq!(cb.blocks.len(), 2);
        assert_eq!(reconstruct(&cb), vec![0u8; 1000]);
    }

    #[test]
    fn generate_dedups_repeated_blocks() {
        // Two identical 700-byte halves of a 1400-byte input.
        let data = [vec![9u8; 700], vec![9u8; 700]].concat();
        let mut cb = MemCallbacks::default();
        generate(&mut Cursor::new(data), &mut cb).unwrap();
        assert_eq!(cb.blocks.len(), 1);
        // One insert plus one refcount bump: the refcount covers both
        // references to the block.
        assert_eq!(cb.blocks.values().next().unwrap().1, 2);
    }

    #[test]
    fn probe_table_weak_then_confirm() {
        let mut table = ProbeTable::new();
        let a = ChunkId::compute(b"block a, comfortably past the direct cutoff");
        let b = ChunkId::compute(b"block b, comfortably past the direct cutoff");
        table.insert(a);

        assert!(table.probe_weak(a.weak));
        assert!(table.contains(&a));
        assert!(!table.contains(&b));

        // A weak twin with a different strong sum must probe positive
        // but fail confirmation.
        let twin = ChunkId { weak: a.weak, strong: b.strong };
        assert!(table.probe_weak(twin.weak));
        assert!(!table.contains(&twin));
    }

    #[test]
    fn probe_table_grows_past_initial_capacity() {
        let mut table = ProbeTable::new();
        let count = PROBE_TABLE_INITIAL; // would overfill the fixed table
        for i in 0..count as u32 {
            table.insert(ChunkId { weak: i, strong: [(i % 251 + 1) as u8; 16] });
        }
        assert!(table.slots.len() > PROBE_TABLE_INITIAL);
        assert!(table.contains(&ChunkId { weak: 17, strong: [18; 16] }));
    }
}
