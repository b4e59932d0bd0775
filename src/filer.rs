//! Version-record filer — one mmapped file per version UUID.
//!
//! Records live under `files/<xx>/<b64hi>.<b64lo>`, sharded into 256
//! directories by the first UUID byte.  A record is the fixed header
//! below followed by a flat array of 26-byte chunk entries terminated
//! by the `End` entry (see [`crate::chunk`]).
//!
//! # Header layout (328 bytes, all fields big-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0    256   name         source file name, NUL-padded
//!  256     16   hash         MD5 of the whole source file
//!  272     16   previous     UUID of the prior version, or all zeros
//!  288      8   size         source file size in bytes
//!  296      4   mode         Unix mode bits
//!  300      4   chunk_size   nominal chunk length of this version
//!  304      8   mtime_sec    312   4   mtime_nsec
//!  316      8   ctime_sec    324   4   ctime_nsec
//! ```
//!
//! The header is written through the map; chunk entries are appended
//! with positioned writes past the mapped region and become visible
//! through [`VersionFile::remap`].  Each record has exactly one writer
//! at a time; the backup driver holds the handle until close or abort.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use thiserror::Error;
use tracing::trace;
use uuid::Uuid;

use crate::chunk::{ChunkEntry, EntryError, ENTRY_SIZE};
use crate::id::{uuid_rel_path, MD5_LEN};

/// Record directory name, directly under the repository root.
pub const FILES_DIR: &str = "files";

/// Maximum stored file name length.
pub const MAX_FILE_NAME_LEN: usize = 256;

/// Fixed header size; chunk entries begin here.
pub const VERSION_HEADER_SIZE: usize = 328;

const OFF_NAME: usize = 0;
const OFF_HASH: usize = 256;
const OFF_PREVIOUS: usize = 272;
const OFF_SIZE: usize = 288;
const OFF_MODE: usize = 296;
const OFF_CHUNK_SIZE: usize = 300;
const OFF_MTIME_SEC: usize = 304;
const OFF_MTIME_NSEC: usize = 312;
const OFF_CTIME_SEC: usize = 316;
const OFF_CTIME_NSEC: usize = 324;

#[derive(Error, Debug)]
pub enum FilerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("version record {0} already exists")]
    Exists(Uuid),
    #[error("not a regular file: {0}")]
    NotRegular(PathBuf),
    #[error("file name longer than {MAX_FILE_NAME_LEN} bytes")]
    NameTooLong,
    #[error("malformed chunk entry in record: {0}")]
    Entry(#[from] EntryError),
}

/// Version-record storage rooted at `<repo>/files`.
pub struct Filer {
    root: PathBuf,
}

impl Filer {
    pub fn open(repo_root: impl AsRef<Path>) -> Result<Self, FilerError> {
        let root = repo_root.as_ref().join(FILES_DIR);
        fs::create_dir_all(&root)?;
        Ok(Filer { root })
    }

    pub fn path_of(&self, uuid: &Uuid) -> PathBuf {
        self.root.join(uuid_rel_path(uuid))
    }

    /// Open a record read-write.  With `create`, the record must not
    /// already exist and is sized to an empty header.
    pub fn open_version(&self, uuid: &Uuid, create: bool) -> Result<VersionFile, FilerError> {
        let path = self.path_of(uuid);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = if create {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(FilerError::Exists(*uuid));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            OpenOptions::new().read(true).write(true).open(&path)?
        };

        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(FilerError::NotRegular(path));
        }
        if meta.len() < VERSION_HEADER_SIZE as u64 {
            file.set_len(VERSION_HEADER_SIZE as u64)?;
        }

        // Safety: records have exactly one writer and are not truncated
        // while mapped.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let append_at = map.len() as u64;
        trace!(%uuid, create, len = append_at, "opened version record");
        Ok(VersionFile { uuid: *uuid, file, map, append_at })
    }

    pub fn delete(&self, uuid: &Uuid) -> Result<(), FilerError> {
        let path = self.path_of(uuid);
        trace!(%uuid, "deleting version record");
        fs::remove_file(path)?;
        Ok(())
    }
}

/// An open, mmapped version record.
pub struct VersionFile {
    pub uuid: Uuid,
    file: File,
    map: MmapMut,
    append_at: u64,
}

impl VersionFile {
    // ── Header fields ───────────────────────────────────────────────────────

    pub fn name(&self) -> String {
        let raw = &self.map[OFF_NAME..OFF_NAME + MAX_FILE_NAME_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).into_owned()
    }

    pub fn set_name(&mut self, name: &str) -> Result<(), FilerError> {
        let bytes = name.as_bytes();
        if bytes.len() > MAX_FILE_NAME_LEN {
            return Err(FilerError::NameTooLong);
        }
        let field = &mut self.map[OFF_NAME..OFF_NAME + MAX_FILE_NAME_LEN];
        field.fill(0);
        field[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    pub fn hash(&self) -> [u8; MD5_LEN] {
        self.map[OFF_HASH..OFF_HASH + MD5_LEN].try_into().unwrap()
    }

    pub fn set_hash(&mut self, hash: &[u8; MD5_LEN]) {
        self.map[OFF_HASH..OFF_HASH + MD5_LEN].copy_from_slice(hash);
    }

    pub fn previous(&self) -> Uuid {
        Uuid::from_bytes(self.map[OFF_PREVIOUS..OFF_PREVIOUS + 16].try_into().unwrap())
    }

    pub fn set_previous(&mut self, previous: &Uuid) {
        self.map[OFF_PREVIOUS..OFF_PREVIOUS + 16].copy_from_slice(previous.as_bytes());
    }

    pub fn size(&self) -> u64 {
        u64::from_be_bytes(self.map[OFF_SIZE..OFF_SIZE + 8].try_into().unwrap())
    }

    pub fn set_size(&mut self, size: u64) {
        self.map[OFF_SIZE..OFF_SIZE + 8].copy_from_slice(&size.to_be_bytes());
    }

    pub fn mode(&self) -> u32 {
        u32::from_be_bytes(self.map[OFF_MODE..OFF_MODE + 4].try_into().unwrap())
    }

    pub fn set_mode(&mut self, mode: u32) {
        self.map[OFF_MODE..OFF_MODE + 4].copy_from_slice(&mode.to_be_bytes());
    }

    pub fn chunk_size(&self) -> u32 {
        u32::from_be_bytes(self.map[OFF_CHUNK_SIZE..OFF_CHUNK_SIZE + 4].try_into().unwrap())
    }

    pub fn set_chunk_size(&mut self, chunk_size: u32) {
        self.map[OFF_CHUNK_SIZE..OFF_CHUNK_SIZE + 4]
            .copy_from_slice(&chunk_size.to_be_bytes());
    }

    pub fn mtime(&self) -> (u64, u32) {
        (
            u64::from_be_bytes(self.map[OFF_MTIME_SEC..OFF_MTIME_SEC + 8].try_into().unwrap()),
            u32::from_be_bytes(self.map[OFF_MTIME_NSEC..OFF_MTIME_NSEC + 4].try_into().unwrap()),
        )
    }

    pub fn set_mtime(&mut self, sec: u64, nsec: u32) {
        self.map[OFF_MTIME_SEC..OFF_MTIME_SEC + 8].copy_from_slice(&sec.to_be_bytes());
        self.map[OFF_MTIME_NSEC..OFF_MTIME_NSEC + 4].copy_from_slice(&nsec.to_be_bytes());
    }

    pub fn ctime(&self) -> (u64, u32) {
        (
            u64::from_be_bytes(self.map[OFF_CTIME_SEC..OFF_CTIME_SEC + 8].try_into().unwrap()),
            u32::from_be_bytes(self.map[OFF_CTIME_NSEC..OFF_CTIME_NSEC + 4].try_into().unwrap()),
        )
    }

    pub fn set_ctime(&mut self, sec: u64, nsec: u32) {
        self.map[OFF_CTIME_SEC..OFF_CTIME_SEC + 8].copy_from_slice(&sec.to_be_bytes());
        self.map[OFF_CTIME_NSEC..OFF_CTIME_NSEC + 4].copy_from_slice(&nsec.to_be_bytes());
    }

    /// Fill the header from source-file metadata: name, size, mode, and
    /// timestamps.  `chunk_size` and `previous` are the caller's to set.
    pub fn init_from_metadata(
        &mut self,
        source_name: &str,
        meta: &fs::Metadata,
    ) -> Result<(), FilerError> {
        self.set_name(source_name)?;
        self.set_size(meta.len());
        self.set_mode(meta.mode());
        self.set_mtime(meta.mtime() as u64, meta.mtime_nsec() as u32);
        self.set_ctime(meta.ctime() as u64, meta.ctime_nsec() as u32);
        Ok(())
    }

    // ── Chunk entries ───────────────────────────────────────────────────────

    /// Append one entry past everything written so far.  The entry is
    /// not visible through the map until [`remap`](Self::remap).
    pub fn append_entry(&mut self, entry: &ChunkEntry) -> Result<(), FilerError> {
        self.file.write_all_at(&entry.encode(), self.append_at)?;
        self.append_at += ENTRY_SIZE as u64;
        Ok(())
    }

    /// Re-map after the underlying file has grown.
    pub fn remap(&mut self) -> Result<(), FilerError> {
        let len = self.file.metadata()?.len();
        if len != self.map.len() as u64 {
            // Safety: same single-writer contract as at open.
            self.map = unsafe { MmapMut::map_mut(&self.file)? };
        }
        Ok(())
    }

    /// Iterate the record's chunk entries, ending at the `End` entry.
    /// Call [`remap`](Self::remap) first if entries were just appended.
    pub fn entries(&self) -> Entries<'_> {
        Entries { map: &self.map[..], at: VERSION_HEADER_SIZE, done: false }
    }

    pub fn flush(&self) -> Result<(), FilerError> {
        self.map.flush()?;
        self.file.sync_data()?;
        Ok(())
    }
}

/// Iterator over a record's chunk entries.  Yields the terminating
/// `End` entry and then stops; a record missing its terminator yields a
/// truncation error as its last item.
pub struct Entries<'a> {
    map: &'a [u8],
    at: usize,
    done: bool,
}

impl Iterator for Entries<'_> {
    type Item = Result<ChunkEntry, EntryError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = ChunkEntry::decode(&self.map[self.at.min(self.map.len())..]);
        match &item {
            Ok(ChunkEntry::End) | Err(_) => self.done = true,
            Ok(_) => self.at += ENTRY_SIZE,
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ChunkId;
    use tempfile::TempDir;

    fn filer() -> (TempDir, Filer) {
        let dir = TempDir::new().unwrap();
        let filer = Filer::open(dir.path()).unwrap();
        (dir, filer)
    }

    #[test]
    fn create_open_delete_cycle() {
        let (_dir, filer) = filer();
        let uuid = Uuid::new_v4();

        let mut vf = filer.open_version(&uuid, true).unwrap();
        vf.set_name("report.txt").unwrap();
        vf.set_size(1234);
        vf.set_chunk_size(700);
        vf.flush().unwrap();
        drop(vf);

        // Creating again must fail; plain open sees the fields.
        assert!(matches!(
            filer.open_version(&uuid, true),
            Err(FilerError::Exists(_))
        ));
        let vf = filer.open_version(&uuid, false).unwrap();
        assert_eq!(vf.name(), "report.txt");
        assert_eq!(vf.size(), 1234);
        assert_eq!(vf.chunk_size(), 700);
        assert_eq!(vf.previous(), Uuid::nil());
        drop(vf);

        filer.delete(&uuid).unwrap();
        assert!(filer.open_version(&uuid, false).is_err());
    }

    #[test]
    fn record_path_is_sharded() {
        let (_dir, filer) = filer();
        let uuid = Uuid::from_bytes([0xAB; 16]);
        let path = filer.path_of(&uuid);
        assert!(path.to_str().unwrap().contains("/ab/"));
    }

    #[test]
    fn entries_round_trip_through_remap() {
        let (_dir, filer) = filer();
        let uuid = Uuid::new_v4();
        let mut vf = filer.open_version(&uuid, true).unwrap();

        let reference = ChunkEntry::Reference {
            length: 700,
            id: ChunkId::compute(b"a chunk that lives in the store"),
        };
        let direct = ChunkEntry::direct(b"tail");
        vf.append_entry(&reference).unwrap();
        vf.append_entry(&direct).unwrap();
        vf.append_entry(&ChunkEntry::End).unwrap();
        vf.remap().unwrap();

        let entries: Vec<_> = vf.entries().collect::<Result<_, _>>().unwrap();
        assert_eq!(entries, vec![reference, direct, ChunkEntry::End]);
    }

    #[test]
    fn missing_terminator_surfaces_as_error() {
        let (_dir, filer) = filer();
        let uuid = Uuid::new_v4();
        let mut vf = filer.open_version(&uuid, true).unwrap();
        vf.append_entry(&ChunkEntry::direct(b"x")).unwrap();
        vf.remap().unwrap();

        let items: Vec<_> = vf.entries().collect();
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(items[1].is_err());
    }

    #[test]
    fn overlong_name_is_rejected() {
        let (_dir, filer) = filer();
        let uuid = Uuid::new_v4();
        let mut vf = filer.open_version(&uuid, true).unwrap();
        let long = "n".repeat(MAX_FILE_NAME_LEN + 1);
        assert!(matches!(vf.set_name(&long), Err(FilerError::NameTooLong)));
    }
}
