//! RPC client — the driver's remote half.
//!
//! One method per request opcode, mirroring the server's dispatch.  The
//! client is also the synchronizer's remote callback bundle: `add_ref`,
//! `put_block`, `contains`, and `emit_chunk` become `StoreAddRef`,
//! `StorePutChunk`, `StoreBlockExists`, and `EmitChunk` requests, so
//! local and remote backups share one synchronizer.

use std::io::{Read, Write};

use tracing::trace;
use uuid::Uuid;

use crate::chunk::ChunkEntry;
use crate::id::{ChunkId, MD5_LEN};
use crate::sync::{Callbacks, SyncError};

use super::{Opcode, RpcError, Wire, WireStats, STATUS_MISSING, STATUS_OK};

/// Header fields sent with `CreateVersion`.  Timestamps travel as
/// 32-bit seconds on the wire.
#[derive(Debug, Clone)]
pub struct CreateVersion<'a> {
    pub name: &'a str,
    pub hash: [u8; MD5_LEN],
    pub previous: Uuid,
    pub size: u64,
    pub mode: u32,
    pub chunk_size: u32,
    pub mtime: (u32, u32),
    pub ctime: (u32, u32),
}

/// Everything `FetchVersion` returns; the caller materializes it into a
/// local record.
#[derive(Debug)]
pub struct FetchedVersion {
    pub hash: [u8; MD5_LEN],
    pub chunk_size: u32,
    /// The full entry stream, terminator included.
    pub entries: Vec<ChunkEntry>,
}

pub struct RpcClient<R: Read, W: Write> {
    wire: Wire<R, W>,
}

impl<R: Read, W: Write> RpcClient<R, W> {
    pub fn new(input: R, output: W) -> Self {
        RpcClient { wire: Wire::new(input, output) }
    }

    pub fn stats(&self) -> WireStats {
        self.wire.stats
    }

    fn expect_ok(&mut self) -> Result<(), RpcError> {
        match self.wire.read_u16()? {
            STATUS_OK => Ok(()),
            status => Err(RpcError::Remote(status)),
        }
    }

    /// Look up the version UUID linked to a source-relative path.
    pub fn read_link(&mut self, path: &str) -> Result<Option<Uuid>, RpcError> {
        trace!(path, "ReadLink");
        self.wire.write_u16(Opcode::ReadLink as u16)?;
        self.wire.write_string(path)?;
        self.wire.flush()?;

        match self.wire.read_u16()? {
            STATUS_OK => {
                let mut uuid = [0u8; 16];
                self.wire.read_bytes(&mut uuid)?;
                Ok(Some(Uuid::from_bytes(uuid)))
            }
            STATUS_MISSING => Ok(None),
            status => Err(RpcError::Remote(status)),
        }
    }

    /// Fetch the whole-file hash recorded in a version.
    pub fn read_file_hash(&mut self, uuid: &Uuid) -> Result<[u8; MD5_LEN], RpcError> {
        trace!(%uuid, "ReadFileHash");
        self.wire.write_u16(Opcode::ReadFileHash as u16)?;
        self.wire.write_bytes(uuid.as_bytes())?;
        self.wire.flush()?;

        self.expect_ok()?;
        let mut hash = [0u8; MD5_LEN];
        self.wire.read_bytes(&mut hash)?;
        Ok(hash)
    }

    /// Fetch a version record: hash, chunk size, and the entry stream.
    pub fn fetch_version(&mut self, uuid: &Uuid) -> Result<FetchedVersion, RpcError> {
        trace!(%uuid, "FetchVersion");
        self.wire.write_u16(Opcode::FetchVersion as u16)?;
        self.wire.write_bytes(uuid.as_bytes())?;
        self.wire.flush()?;

        let mut hash = [0u8; MD5_LEN];
        self.wire.read_bytes(&mut hash)?;
        let chunk_size = self.wire.read_u32()?;

        let mut entries = Vec::new();
        loop {
            let entry = self.wire.read_entry()?;
            let end = entry == ChunkEntry::End;
            entries.push(entry);
            if end {
                break;
            }
        }
        trace!(%uuid, entries = entries.len(), "fetched version");
        Ok(FetchedVersion { hash, chunk_size, entries })
    }

    /// Create a version record on the peer; returns the assigned UUID.
    pub fn create_version(&mut self, create: &CreateVersion<'_>) -> Result<Uuid, RpcError> {
        trace!(name = create.name, "CreateVersion");
        self.wire.write_u16(Opcode::CreateVersion as u16)?;
        self.wire.write_string(create.name)?;
        self.wire.write_bytes(&create.hash)?;
        self.wire.write_bytes(create.previous.as_bytes())?;
        self.wire.write_u64(create.size)?;
        self.wire.write_u32(create.mode)?;
        self.wire.write_u32(create.chunk_size)?;
        self.wire.write_u32(create.mtime.0)?;
        self.wire.write_u32(create.mtime.1)?;
        self.wire.write_u32(create.ctime.0)?;
        self.wire.write_u32(create.ctime.1)?;
        self.wire.flush()?;

        self.expect_ok()?;
        let mut uuid = [0u8; 16];
        self.wire.read_bytes(&mut uuid)?;
        Ok(Uuid::from_bytes(uuid))
    }

    /// Point a source-relative path at a version record.
    pub fn make_link(&mut self, path: &str, uuid: &Uuid) -> Result<(), RpcError> {
        trace!(path, %uuid, "MakeLink");
        self.wire.write_u16(Opcode::MakeLink as u16)?;
        self.wire.write_string(path)?;
        self.wire.write_bytes(uuid.as_bytes())?;
        self.wire.flush()?;
        self.expect_ok()
    }

    /// Close the open version record, either finalizing it with its
    /// whole-file hash or aborting and deleting it.
    pub fn close_version(
        &mut self,
        uuid: &Uuid,
        hash: &[u8; MD5_LEN],
        abort: bool,
    ) -> Result<(), RpcError> {
        trace!(%uuid, abort, "CloseVersion");
        self.wire.write_u16(Opcode::CloseVersion as u16)?;
        self.wire.write_bytes(uuid.as_bytes())?;
        self.wire.write_bytes(hash)?;
        self.wire.write_u16(abort as u16)?;
        self.wire.flush()?;
        self.expect_ok()
    }

    /// End the session.  The peer echoes the opcode back.
    pub fn goodbye(&mut self) -> Result<(), RpcError> {
        self.wire.write_u16(Opcode::Goodbye as u16)?;
        self.wire.flush()?;
        match self.wire.read_u16()? {
            code if code == Opcode::Goodbye as u16 => Ok(()),
            other => Err(RpcError::Protocol(format!(
                "goodbye answered with {other}"
            ))),
        }
    }
}

// The remote callback bundle: same synchronizer, chunks over the wire.
impl<R: Read, W: Write> Callbacks for RpcClient<R, W> {
    fn add_ref(&mut self, id: &ChunkId) -> Result<(), SyncError> {
        self.wire.write_u16(Opcode::StoreAddRef as u16)?;
        self.wire.write_chunk_id(id)?;
        self.wire.flush()?;
        self.expect_ok()?;
        Ok(())
    }

    fn put_block(&mut self, id: &ChunkId, data: &[u8]) -> Result<(), SyncError> {
        self.wire.write_u16(Opcode::StorePutChunk as u16)?;
        self.wire.write_chunk_id(id)?;
        self.wire.write_u32(data.len() as u32)?;
        self.wire.write_bytes(data)?;
        self.wire.flush()?;
        self.expect_ok()?;
        Ok(())
    }

    fn contains(&mut self, id: &ChunkId) -> Result<bool, SyncError> {
        self.wire.write_u16(Opcode::StoreBlockExists as u16)?;
        self.wire.write_chunk_id(id)?;
        self.wire.flush()?;
        Ok(self.wire.read_u16()? == 1)
    }

    fn emit_chunk(&mut self, entry: &ChunkEntry) -> Result<(), SyncError> {
        self.wire.write_u16(Opcode::EmitChunk as u16)?;
        self.wire.write_entry(entry)?;
        self.wire.flush()?;
        self.expect_ok()?;
        Ok(())
    }
}
