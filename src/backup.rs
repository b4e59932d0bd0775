//! Backup driver — walks a source tree and versions every file.
//!
//! For each regular file the driver consults the link tree:
//!
//! - no link: a fresh UUID and record, [`sync::generate`], then the
//!   link is made,
//! - a link: the basis record opens, [`sync::diff`] runs with the
//!   whole-file hash short-circuit, and an unchanged file costs only
//!   the hash (the new record is discarded, the link untouched),
//! - anything else at the link path: invalid input for this file.
//!
//! On any per-file error the partially written record is deleted and
//! the link is not updated; the walk logs the failure and continues.  A
//! corrupt store or a transport failure aborts the run.
//!
//! Remote mode drives the same synchronizer through the RPC client:
//! the basis record is fetched into a scratch filer, chunks flow to the
//! peer's store, and the peer finalizes the record on close.

use std::fs::{self, File};
use std::io::{self, BufReader, Seek, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::{ChunkEntry, EntryError};
use crate::filer::{Filer, FilerError, VersionFile};
use crate::rpc::client::{CreateVersion, RpcClient};
use crate::rpc::{RpcError, WireStats};
use crate::store::{BlockStore, StoreError};
use crate::sync::{self, chunk_size_for, DiffOutcome, StoreCallbacks, SyncError};
use crate::tree::{LinkError, LinkState, LinkTree};

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Filer(#[from] FilerError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error(transparent)]
    Entry(#[from] EntryError),
    #[error(transparent)]
    Walk(#[from] walkdir::Error),
    #[error("not a regular file: {0}")]
    NotRegular(PathBuf),
    #[error("path {0} is outside the source root")]
    OutsideRoot(PathBuf),
}

/// Errors that end the run instead of skipping the file.
fn is_fatal(err: &BackupError) -> bool {
    matches!(
        err,
        BackupError::Store(StoreError::Corrupt(_))
            | BackupError::Rpc(_)
            | BackupError::Sync(SyncError::Rpc(_))
            | BackupError::Sync(SyncError::Store(StoreError::Corrupt(_)))
    )
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BackupStats {
    /// Files for which a new version was recorded.
    pub files: u64,
}

fn source_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Depth-first, name-sorted walk over the source; per-file errors are
/// logged and skipped unless fatal.
fn walk_source<F>(source_root: &Path, mut per_file: F) -> Result<(), BackupError>
where
    F: FnMut(&Path) -> Result<(), BackupError>,
{
    for entry in WalkDir::new(source_root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Err(e) = per_file(entry.path()) {
            if is_fatal(&e) {
                return Err(e);
            }
            warn!(path = %entry.path().display(), error = %e, "skipping file");
        }
    }
    Ok(())
}

// ── Local mode ───────────────────────────────────────────────────────────────

/// Driver with store, filer, and link tree all on this filesystem.
pub struct LocalBackup {
    store: BlockStore,
    filer: Filer,
    tree: LinkTree,
    source_root: PathBuf,
    pub stats: BackupStats,
}

impl LocalBackup {
    pub fn open(
        repo_root: impl AsRef<Path>,
        source_root: impl AsRef<Path>,
    ) -> Result<Self, BackupError> {
        let repo_root = repo_root.as_ref();
        Ok(LocalBackup {
            store: BlockStore::open(repo_root)?,
            filer: Filer::open(repo_root)?,
            tree: LinkTree::open(repo_root)?,
            source_root: source_root.as_ref().to_owned(),
            stats: BackupStats::default(),
        })
    }

    /// Back up the whole source tree.
    pub fn run(&mut self) -> Result<(), BackupError> {
        let root = self.source_root.clone();
        walk_source(&root, |path| self.backup_file(path))?;
        info!(files = self.stats.files, "backup complete");
        Ok(())
    }

    /// Back up a single source file.
    pub fn backup_file(&mut self, path: &Path) -> Result<(), BackupError> {
        let rel = path
            .strip_prefix(&self.source_root)
            .map_err(|_| BackupError::OutsideRoot(path.to_owned()))?
            .to_owned();
        debug!(path = %path.display(), rel = %rel.display(), "backing up");

        match self.tree.read_link(&rel)? {
            LinkState::Missing => self.first_version(path, &rel),
            LinkState::Current(basis) => self.next_version(path, &rel, basis),
        }
    }

    fn first_version(&mut self, path: &Path, rel: &Path) -> Result<(), BackupError> {
        let uuid = Uuid::new_v4();
        let mut record = self.filer.open_version(&uuid, true)?;
        debug!(%uuid, "first version");

        match self.generate_into(path, &mut record) {
            Ok(()) => {
                record.flush()?;
                drop(record);
                self.tree.make_link(rel, &uuid)?;
                self.stats.files += 1;
                Ok(())
            }
            Err(e) => {
                drop(record);
                let _ = self.filer.delete(&uuid);
                Err(e)
            }
        }
    }

    fn generate_into(
        &mut self,
        path: &Path,
        record: &mut VersionFile,
    ) -> Result<(), BackupError> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(BackupError::NotRegular(path.to_owned()));
        }
        record.init_from_metadata(&source_name(path), &meta)?;

        let mut input = BufReader::new(file);
        let outcome = {
            let mut cb = StoreCallbacks { store: &mut self.store, out: record };
            sync::generate(&mut input, &mut cb)?
        };
        record.set_chunk_size(outcome.chunk_size);
        record.set_hash(&outcome.hash);
        Ok(())
    }

    fn next_version(
        &mut self,
        path: &Path,
        rel: &Path,
        basis_uuid: Uuid,
    ) -> Result<(), BackupError> {
        let basis = self.filer.open_version(&basis_uuid, false)?;
        let uuid = Uuid::new_v4();
        let mut record = self.filer.open_version(&uuid, true)?;
        debug!(%uuid, basis = %basis_uuid, "next version");

        match self.diff_into(path, &basis, &mut record) {
            Ok(DiffOutcome::Unchanged) => {
                debug!(path = %path.display(), "unchanged; discarding record");
                drop(record);
                self.filer.delete(&uuid)?;
                Ok(())
            }
            Ok(DiffOutcome::Synced { hash }) => {
                record.set_hash(&hash);
                record.flush()?;
                drop(record);
                self.tree.make_link(rel, &uuid)?;
                self.stats.files += 1;
                Ok(())
            }
            Err(e) => {
                drop(record);
                let _ = self.filer.delete(&uuid);
                Err(e)
            }
        }
    }

    fn diff_into(
        &mut self,
        path: &Path,
        basis: &VersionFile,
        record: &mut VersionFile,
    ) -> Result<DiffOutcome, BackupError> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(BackupError::NotRegular(path.to_owned()));
        }
        record.init_from_metadata(&source_name(path), &meta)?;
        record.set_previous(&basis.uuid);
        record.set_chunk_size(basis.chunk_size());

        let mut input = BufReader::new(file);
        let mut cb = StoreCallbacks { store: &mut self.store, out: record };
        Ok(sync::diff(basis, &mut input, &mut cb, true)?)
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    /// The current version UUID for a source-relative path, if any.
    pub fn lookup(&self, rel: &Path) -> Result<Option<Uuid>, BackupError> {
        match self.tree.read_link(rel)? {
            LinkState::Missing => Ok(None),
            LinkState::Current(uuid) => Ok(Some(uuid)),
        }
    }

    /// Reconstruct a version record's byte stream into `out`; returns
    /// the byte count.
    pub fn restore(&mut self, uuid: &Uuid, out: &mut impl Write) -> Result<u64, BackupError> {
        let record = self.filer.open_version(uuid, false)?;
        let mut written = 0u64;
        let mut buf = vec![0u8; sync::MAX_CHUNK_SIZE as usize];
        for entry in record.entries() {
            match entry? {
                ChunkEntry::End => break,
                ChunkEntry::Direct { len, data } => {
                    out.write_all(&data[..len as usize])?;
                    written += len as u64;
                }
                ChunkEntry::Reference { length, id } => {
                    let full = self.store.get(&id, &mut buf)?;
                    if full != length as usize {
                        return Err(StoreError::Corrupt(format!(
                            "chunk {id} is {full} bytes, record expects {length}"
                        ))
                        .into());
                    }
                    out.write_all(&buf[..full])?;
                    written += full as u64;
                }
            }
        }
        Ok(written)
    }

    /// Restore the current version of a source-relative path.
    pub fn restore_path(
        &mut self,
        rel: &Path,
        out: &mut impl Write,
    ) -> Result<u64, BackupError> {
        let uuid = self
            .lookup(rel)?
            .ok_or_else(|| BackupError::Link(LinkError::NotALink(rel.to_owned())))?;
        self.restore(&uuid, out)
    }

    pub fn store(&mut self) -> &mut BlockStore {
        &mut self.store
    }

    pub fn filer(&self) -> &Filer {
        &self.filer
    }
}

// ── Remote mode ──────────────────────────────────────────────────────────────

/// Driver speaking to a remote peer; only the basis scratch copy
/// touches the local disk.
pub struct RemoteBackup<R: io::Read, W: Write> {
    client: RpcClient<R, W>,
    scratch: Filer,
    source_root: PathBuf,
    pub stats: BackupStats,
}

impl<R: io::Read, W: Write> RemoteBackup<R, W> {
    pub fn new(
        client: RpcClient<R, W>,
        source_root: impl AsRef<Path>,
    ) -> Result<Self, BackupError> {
        let scratch_root = std::env::temp_dir().join(format!("arw-{}", std::process::id()));
        fs::create_dir_all(&scratch_root)?;
        Ok(RemoteBackup {
            client,
            scratch: Filer::open(&scratch_root)?,
            source_root: source_root.as_ref().to_owned(),
            stats: BackupStats::default(),
        })
    }

    pub fn run(&mut self) -> Result<(), BackupError> {
        let root = self.source_root.clone();
        walk_source(&root, |path| self.backup_file(path))?;
        let stats = self.client.stats();
        info!(
            files = self.stats.files,
            bytes_out = stats.bytes_out,
            bytes_in = stats.bytes_in,
            "remote backup complete"
        );
        Ok(())
    }

    pub fn backup_file(&mut self, path: &Path) -> Result<(), BackupError> {
        let rel = path
            .strip_prefix(&self.source_root)
            .map_err(|_| BackupError::OutsideRoot(path.to_owned()))?
            .to_owned();
        let rel_str = rel.to_string_lossy().into_owned();
        debug!(path = %path.display(), rel = %rel_str, "backing up (remote)");

        match self.client.read_link(&rel_str)? {
            None => self.first_version(path, &rel_str),
            Some(basis) => self.next_version(path, &rel_str, basis),
        }
    }

    fn open_regular(path: &Path) -> Result<(File, fs::Metadata), BackupError> {
        let file = File::open(path)?;
        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(BackupError::NotRegular(path.to_owned()));
        }
        Ok((file, meta))
    }

    fn create_request<'a>(
        name: &'a str,
        meta: &fs::Metadata,
        previous: Uuid,
        chunk_size: u32,
    ) -> CreateVersion<'a> {
        CreateVersion {
            name,
            hash: [0; 16],
            previous,
            size: meta.len(),
            mode: meta.mode(),
            chunk_size,
            mtime: (meta.mtime() as u32, meta.mtime_nsec() as u32),
            ctime: (meta.ctime() as u32, meta.ctime_nsec() as u32),
        }
    }

    fn first_version(&mut self, path: &Path, rel: &str) -> Result<(), BackupError> {
        let (file, meta) = Self::open_regular(path)?;
        let name = source_name(path);
        let request =
            Self::create_request(&name, &meta, Uuid::nil(), chunk_size_for(meta.len()));
        let uuid = self.client.create_version(&request)?;

        let mut input = BufReader::new(file);
        match sync::generate(&mut input, &mut self.client) {
            Ok(outcome) => {
                self.client.close_version(&uuid, &outcome.hash, false)?;
                self.client.make_link(rel, &uuid)?;
                self.stats.files += 1;
                Ok(())
            }
            Err(e) => {
                let _ = self.client.close_version(&uuid, &[0; 16], true);
                Err(e.into())
            }
        }
    }

    fn next_version(
        &mut self,
        path: &Path,
        rel: &str,
        basis_uuid: Uuid,
    ) -> Result<(), BackupError> {
        let (file, meta) = Self::open_regular(path)?;

        // The hash short-circuit costs one request, not a transfer.
        let remote_hash = self.client.read_file_hash(&basis_uuid)?;
        let mut input = BufReader::new(file);
        let local_hash = sync::file_md5(&mut input)?;
        if local_hash == remote_hash {
            debug!(path = %path.display(), "unchanged; nothing to send");
            return Ok(());
        }
        input.rewind()?;

        // Materialize the basis in the scratch filer for the probe table.
        let fetched = self.client.fetch_version(&basis_uuid)?;
        let _ = self.scratch.delete(&basis_uuid);
        let mut basis = self.scratch.open_version(&basis_uuid, true)?;
        basis.set_hash(&fetched.hash);
        basis.set_chunk_size(fetched.chunk_size);
        for entry in &fetched.entries {
            basis.append_entry(entry)?;
        }
        basis.remap()?;

        let name = source_name(path);
        let request = Self::create_request(&name, &meta, basis_uuid, fetched.chunk_size);
        let uuid = self.client.create_version(&request)?;

        let result = sync::diff(&basis, &mut input, &mut self.client, false);
        drop(basis);
        let _ = self.scratch.delete(&basis_uuid);

        match result {
            Ok(DiffOutcome::Synced { hash }) => {
                self.client.close_version(&uuid, &hash, false)?;
                self.client.make_link(rel, &uuid)?;
                self.stats.files += 1;
                Ok(())
            }
            // Without the hash check diff always emits; treat a stray
            // short-circuit as an abort.
            Ok(DiffOutcome::Unchanged) => {
                self.client.close_version(&uuid, &[0; 16], true)?;
                Ok(())
            }
            Err(e) => {
                let _ = self.client.close_version(&uuid, &[0; 16], true);
                Err(e.into())
            }
        }
    }

    /// Say goodbye and return the session byte counters.
    pub fn finish(mut self) -> Result<WireStats, BackupError> {
        self.client.goodbye()?;
        Ok(self.client.stats())
    }
}
