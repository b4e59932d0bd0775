//! RPC server — owns a local repository and serves one session.
//!
//! The server reads one request at a time and answers in order.  Local
//! failures become non-OK statuses and the session continues; wire
//! failures and malformed traffic end the session.  `CreateVersion`
//! opens the session's one writable record; `EmitChunk` streams into
//! it; `CloseVersion` finalizes or aborts it.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::filer::{Filer, FilerError, VersionFile};
use crate::id::MD5_LEN;
use crate::store::{BlockStore, StoreError};
use crate::sync::MAX_CHUNK_SIZE;
use crate::tree::{LinkError, LinkState, LinkTree};

use super::{Opcode, RpcError, Wire, WireStats, STATUS_ERROR, STATUS_MISSING, STATUS_OK};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Filer(#[from] FilerError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub struct RpcServer<R: Read, W: Write> {
    wire: Wire<R, W>,
    store: BlockStore,
    filer: Filer,
    tree: LinkTree,
    /// The record opened by `CreateVersion`, if a transfer is underway.
    open: Option<VersionFile>,
}

impl<R: Read, W: Write> RpcServer<R, W> {
    pub fn new(
        repo_root: impl AsRef<Path>,
        input: R,
        output: W,
    ) -> Result<Self, ServerError> {
        let repo_root = repo_root.as_ref();
        Ok(RpcServer {
            wire: Wire::new(input, output),
            store: BlockStore::open(repo_root)?,
            filer: Filer::open(repo_root)?,
            tree: LinkTree::open(repo_root)?,
            open: None,
        })
    }

    pub fn stats(&self) -> WireStats {
        self.wire.stats
    }

    /// Serve requests until `Goodbye` or the peer hangs up.
    pub fn serve(&mut self) -> Result<(), ServerError> {
        loop {
            let raw = match self.wire.read_u16() {
                Ok(raw) => raw,
                // A peer that just closes the pipe has ended the session.
                Err(RpcError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("peer closed the session without goodbye");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };
            let op = Opcode::from_u16(raw).ok_or_else(|| {
                RpcError::Protocol(format!("unknown opcode {raw}"))
            })?;
            trace!(?op, "request");

            match op {
                Opcode::ReadLink => self.handle_read_link()?,
                Opcode::FetchVersion => self.handle_fetch_version()?,
                Opcode::ReadFileHash => self.handle_read_file_hash()?,
                Opcode::CreateVersion => self.handle_create_version()?,
                Opcode::MakeLink => self.handle_make_link()?,
                Opcode::StoreAddRef => self.handle_add_ref()?,
                Opcode::StorePutChunk => self.handle_put_chunk()?,
                Opcode::StoreBlockExists => self.handle_block_exists()?,
                Opcode::EmitChunk => self.handle_emit_chunk()?,
                Opcode::CloseVersion => self.handle_close_version()?,
                Opcode::Goodbye => {
                    self.wire.write_u16(Opcode::Goodbye as u16)?;
                    self.wire.flush()?;
                    debug!(
                        bytes_in = self.wire.stats.bytes_in,
                        bytes_out = self.wire.stats.bytes_out,
                        "session complete"
                    );
                    return Ok(());
                }
            }
        }
    }

    fn respond_status(&mut self, status: u16) -> Result<(), RpcError> {
        self.wire.write_u16(status)?;
        self.wire.flush()
    }

    // ── Handlers ────────────────────────────────────────────────────────────

    fn handle_read_link(&mut self) -> Result<(), RpcError> {
        let path = self.wire.read_string()?;
        let Some(rel) = safe_rel_path(&path) else {
            warn!(%path, "rejected link path");
            return self.respond_status(STATUS_ERROR);
        };
        match self.tree.read_link(&rel) {
            Ok(LinkState::Current(uuid)) => {
                self.wire.write_u16(STATUS_OK)?;
                self.wire.write_bytes(uuid.as_bytes())?;
                self.wire.flush()
            }
            Ok(LinkState::Missing) => self.respond_status(STATUS_MISSING),
            Err(e) => {
                warn!(%path, error = %e, "read_link failed");
                self.respond_status(STATUS_ERROR)
            }
        }
    }

    fn handle_fetch_version(&mut self) -> Result<(), RpcError> {
        let mut uuid = [0u8; 16];
        self.wire.read_bytes(&mut uuid)?;
        let uuid = Uuid::from_bytes(uuid);

        // The response has no status word: the hash comes first.  A
        // record that cannot be opened leaves nothing valid to send, so
        // the session ends.
        let record = self
            .filer
            .open_version(&uuid, false)
            .map_err(|e| RpcError::Protocol(format!("fetch of unknown version {uuid}: {e}")))?;

        self.wire.write_bytes(&record.hash())?;
        self.wire.write_u32(record.chunk_size())?;
        for entry in record.entries() {
            let entry = entry
                .map_err(|e| RpcError::Protocol(format!("corrupt record {uuid}: {e}")))?;
            self.wire.write_entry(&entry)?;
        }
        self.wire.flush()
    }

    fn handle_read_file_hash(&mut self) -> Result<(), RpcError> {
        let mut uuid = [0u8; 16];
        self.wire.read_bytes(&mut uuid)?;
        let uuid = Uuid::from_bytes(uuid);

        match self.filer.open_version(&uuid, false) {
            Ok(record) => {
                self.wire.write_u16(STATUS_OK)?;
                self.wire.write_bytes(&record.hash())?;
                self.wire.flush()
            }
            Err(FilerError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                self.respond_status(STATUS_MISSING)
            }
            Err(e) => {
                warn!(%uuid, error = %e, "read_file_hash failed");
                self.respond_status(STATUS_ERROR)
            }
        }
    }

    fn handle_create_version(&mut self) -> Result<(), RpcError> {
        let name = self.wire.read_string()?;
        let mut hash = [0u8; MD5_LEN];
        self.wire.read_bytes(&mut hash)?;
        let mut previous = [0u8; 16];
        self.wire.read_bytes(&mut previous)?;
        let size = self.wire.read_u64()?;
        let mode = self.wire.read_u32()?;
        let chunk_size = self.wire.read_u32()?;
        let mtime = (self.wire.read_u32()?, self.wire.read_u32()?);
        let ctime = (self.wire.read_u32()?, self.wire.read_u32()?);

        let uuid = Uuid::new_v4();
        let mut record = match self.filer.open_version(&uuid, true) {
            Ok(r) => r,
            Err(e) => {
                warn!(%name, error = %e, "create_version failed");
                return self.respond_status(STATUS_ERROR);
            }
        };
        let initialized = record.set_name(&name).map(|_| {
            record.set_hash(&hash);
            record.set_previous(&Uuid::from_bytes(previous));
            record.set_size(size);
            record.set_mode(mode);
            record.set_chunk_size(chunk_size);
            record.set_mtime(mtime.0 as u64, mtime.1);
            record.set_ctime(ctime.0 as u64, ctime.1);
        });
        if let Err(e) = initialized {
            warn!(%name, error = %e, "create_version failed");
            let _ = self.filer.delete(&uuid);
            return self.respond_status(STATUS_ERROR);
        }

        debug!(%uuid, %name, "created version record");
        self.open = Some(record);
        self.wire.write_u16(STATUS_OK)?;
        self.wire.write_bytes(uuid.as_bytes())?;
        self.wire.flush()
    }

    fn handle_make_link(&mut self) -> Result<(), RpcError> {
        let path = self.wire.read_string()?;
        let mut uuid = [0u8; 16];
        self.wire.read_bytes(&mut uuid)?;
        let uuid = Uuid::from_bytes(uuid);

        let Some(rel) = safe_rel_path(&path) else {
            warn!(%path, "rejected link path");
            return self.respond_status(STATUS_ERROR);
        };
        match self.tree.make_link(&rel, &uuid) {
            Ok(()) => self.respond_status(STATUS_OK),
            Err(e) => {
                warn!(%path, error = %e, "make_link failed");
                self.respond_status(STATUS_ERROR)
            }
        }
    }

    fn handle_add_ref(&mut self) -> Result<(), RpcError> {
        let id = self.wire.read_chunk_id()?;
        match self.store.addref(&id) {
            Ok(()) => self.respond_status(STATUS_OK),
            Err(StoreError::NotFound) => self.respond_status(STATUS_MISSING),
            Err(e) => {
                warn!(%id, error = %e, "addref failed");
                self.respond_status(STATUS_ERROR)
            }
        }
    }

    fn handle_put_chunk(&mut self) -> Result<(), RpcError> {
        let id = self.wire.read_chunk_id()?;
        let len = self.wire.read_u32()?;
        if len == 0 || len > MAX_CHUNK_SIZE {
            return Err(RpcError::Protocol(format!("chunk length {len} out of range")));
        }
        let mut data = vec![0u8; len as usize];
        self.wire.read_bytes(&mut data)?;

        match self.store.put(&id, &data) {
            Ok(_) => self.respond_status(STATUS_OK),
            Err(e) => {
                warn!(%id, error = %e, "put failed");
                self.respond_status(STATUS_ERROR)
            }
        }
    }

    fn handle_block_exists(&mut self) -> Result<(), RpcError> {
        let id = self.wire.read_chunk_id()?;
        let present = match self.store.contains(&id) {
            Ok(p) => p,
            Err(e) => {
                warn!(%id, error = %e, "contains failed");
                return self.respond_status(STATUS_ERROR);
            }
        };
        self.respond_status(present as u16)
    }

    fn handle_emit_chunk(&mut self) -> Result<(), RpcError> {
        let entry = self.wire.read_entry()?;
        match self.open.as_mut() {
            Some(record) => match record.append_entry(&entry) {
                Ok(()) => self.respond_status(STATUS_OK),
                Err(e) => {
                    warn!(error = %e, "emit_chunk failed");
                    self.respond_status(STATUS_ERROR)
                }
            },
            None => {
                warn!("emit_chunk with no open version record");
                self.respond_status(STATUS_ERROR)
            }
        }
    }

    fn handle_close_version(&mut self) -> Result<(), RpcError> {
        let mut uuid = [0u8; 16];
        self.wire.read_bytes(&mut uuid)?;
        let uuid = Uuid::from_bytes(uuid);
        let mut hash = [0u8; MD5_LEN];
        self.wire.read_bytes(&mut hash)?;
        let abort = self.wire.read_u16()? != 0;

        let Some(mut record) = self.open.take() else {
            warn!(%uuid, "close_version with no open record");
            return self.respond_status(STATUS_ERROR);
        };
        if record.uuid != uuid {
            warn!(open = %record.uuid, closed = %uuid, "close_version uuid mismatch");
            self.open = Some(record);
            return self.respond_status(STATUS_ERROR);
        }

        if abort {
            debug!(%uuid, "aborting version record");
            drop(record);
            if let Err(e) = self.filer.delete(&uuid) {
                warn!(%uuid, error = %e, "delete failed");
                return self.respond_status(STATUS_ERROR);
            }
            return self.respond_status(STATUS_OK);
        }

        record.set_hash(&hash);
        match record.flush() {
            Ok(()) => {
                debug!(%uuid, "finalized version record");
                self.respond_status(STATUS_OK)
            }
            Err(e) => {
                warn!(%uuid, error = %e, "flush failed");
                self.respond_status(STATUS_ERROR)
            }
        }
    }
}

/// Accept only relative paths made of plain components: no absolute
/// paths, no `..`, no current-dir hops.
fn safe_rel_path(path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }
    let p = Path::new(path);
    if p.components().all(|c| matches!(c, Component::Normal(_))) {
        Some(p.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation() {
        assert!(safe_rel_path("a/b/c.txt").is_some());
        assert!(safe_rel_path("").is_none());
        assert!(safe_rel_path("/etc/passwd").is_none());
        assert!(safe_rel_path("a/../b").is_none());
        assert!(safe_rel_path("./a").is_none());
    }
}
