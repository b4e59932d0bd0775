//! # arw — deduplicating, versioned file backup engine
//!
//! Format guarantees (frozen in v1):
//! - All multi-byte integers on disk and on the wire are big-endian
//! - The superblock magic is `"ARWS"`, the bucket magic `"ARWB"`; a
//!   mismatch in magic or format version refuses the store
//! - Chunks are content-addressed by (rolling weak checksum, MD5); the
//!   MD5 is authoritative, the weak sum is the probe key
//! - The rolling checksum's per-byte offset is 31 and observable on
//!   disk; changing it orphans every recorded weak sum
//! - A chunk of 23 bytes or fewer is always inlined in the version
//!   record; the block store holds no chunk below 24 bytes
//! - Bucket selection is linear hashing over the low eight strong-hash
//!   bytes; splits flush both buckets before the superblock advances
//!   and are idempotent under re-run
//! - Filenames of buckets and version records use this format's own
//!   filename-safe base-64 alphabet, byte-for-byte
//! - Every bucket reserves a zero-filled Reed–Solomon parity tail for a
//!   later format version; v1 never populates it

pub mod b64;
pub mod backup;
pub mod cbuf;
pub mod chunk;
pub mod filer;
pub mod id;
pub mod rollsum;
pub mod rpc;
pub mod store;
pub mod sync;
pub mod tree;

/// On-disk format version of the superblock, buckets, and version
/// records.
pub const FILE_VERSION: u8 = 1;

/// Version of the remote transport's message set.
pub const PROTOCOL_VERSION: u16 = 1;

// Flat re-exports for the most common types.
pub use backup::{BackupError, BackupStats, LocalBackup, RemoteBackup};
pub use chunk::{ChunkEntry, ENTRY_SIZE, MAX_DIRECT_CHUNK_SIZE};
pub use filer::{Filer, FilerError, VersionFile, VERSION_HEADER_SIZE};
pub use id::{ChunkId, MD5_LEN};
pub use rollsum::Rollsum;
pub use rpc::{RpcClient, RpcError, RpcServer};
pub use store::{BlockStore, PutOutcome, StoreError, MAX_LOAD_FACTOR};
pub use sync::{diff, generate, Callbacks, DiffOutcome, GenerateOutcome, SyncError,
               MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use tree::{LinkState, LinkTree};
