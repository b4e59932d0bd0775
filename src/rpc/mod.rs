//! Remote transport — a length-delimited binary RPC over a pair of
//! byte streams.
//!
//! A symmetric pair of endpoints exchanges big-endian frames: each
//! request starts with a `u16` opcode and produces exactly one response
//! beginning with a `u16` status (`0` = OK).  Reads and writes block;
//! the client flushes after every request; servers respond in request
//! order.  There is no authentication and no timeout — the transport
//! is a pipe to a peer you already trust.
//!
//! | Op               | Code | Request payload                       |
//! |------------------|------|---------------------------------------|
//! | ReadLink         |   2  | path string                           |
//! | FetchVersion     |   3  | UUID                                  |
//! | ReadFileHash     |   4  | UUID                                  |
//! | CreateVersion    |   5  | header fields (see client)            |
//! | MakeLink         |   6  | path string, UUID                     |
//! | StoreAddRef      |   7  | chunk id                              |
//! | StorePutChunk    |   8  | chunk id, length, bytes               |
//! | StoreBlockExists |   9  | chunk id                              |
//! | EmitChunk        |  10  | wire chunk entry                      |
//! | CloseVersion     |  11  | UUID, hash, abort flag                |
//! | Goodbye          |  12  | — (response echoes 12)                |
//!
//! A chunk entry on the wire is `u16` tag, then a tag-specific body:
//! references carry `length u32, weak u32, strong[16]`; directs carry
//! `len u8, bytes[len]`; the end sentinel has no body.

pub mod client;
pub mod server;

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::chunk::{ChunkEntry, MAX_DIRECT_CHUNK_SIZE, TAG_DIRECT, TAG_END, TAG_REFERENCE};
use crate::id::{ChunkId, MD5_LEN};

pub use self::client::RpcClient;
pub use self::server::RpcServer;

/// Response status: request succeeded.
pub const STATUS_OK: u16 = 0;

/// Response status: the named thing does not exist.  Not always an
/// error — a missing link is the normal first-backup signal.
pub const STATUS_MISSING: u16 = 1;

/// Response status: the request failed on the peer.
pub const STATUS_ERROR: u16 = 2;

/// Request opcodes.  Frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    ReadLink = 2,
    FetchVersion = 3,
    ReadFileHash = 4,
    CreateVersion = 5,
    MakeLink = 6,
    StoreAddRef = 7,
    StorePutChunk = 8,
    StoreBlockExists = 9,
    EmitChunk = 10,
    CloseVersion = 11,
    Goodbye = 12,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            2 => Some(Opcode::ReadLink),
            3 => Some(Opcode::FetchVersion),
            4 => Some(Opcode::ReadFileHash),
            5 => Some(Opcode::CreateVersion),
            6 => Some(Opcode::MakeLink),
            7 => Some(Opcode::StoreAddRef),
            8 => Some(Opcode::StorePutChunk),
            9 => Some(Opcode::StoreBlockExists),
            10 => Some(Opcode::EmitChunk),
            11 => Some(Opcode::CloseVersion),
            12 => Some(Opcode::Goodbye),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum RpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Malformed or out-of-order traffic; the session is over.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// The peer answered with a non-OK status.
    #[error("remote returned status {0}")]
    Remote(u16),
}

/// Per-session byte counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct WireStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Framing over one inbound and one outbound byte stream.
pub struct Wire<R: Read, W: Write> {
    input: R,
    output: W,
    pub stats: WireStats,
}

impl<R: Read, W: Write> Wire<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Wire { input, output, stats: WireStats::default() }
    }

    // ── Writes ──────────────────────────────────────────────────────────────

    pub fn write_u16(&mut self, value: u16) -> Result<(), RpcError> {
        self.output.write_u16::<BigEndian>(value)?;
        self.stats.bytes_out += 2;
        Ok(())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<(), RpcError> {
        self.output.write_u32::<BigEndian>(value)?;
        self.stats.bytes_out += 4;
        Ok(())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<(), RpcError> {
        self.output.write_u64::<BigEndian>(value)?;
        self.stats.bytes_out += 8;
        Ok(())
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.output.write_all(bytes)?;
        self.stats.bytes_out += bytes.len() as u64;
        Ok(())
    }

    /// A `u16` length prefix followed by the raw bytes.
    pub fn write_string(&mut self, value: &str) -> Result<(), RpcError> {
        let bytes = value.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(RpcError::Protocol(format!(
                "string of {} bytes does not fit a u16 length",
                bytes.len()
            )));
        }
        self.write_u16(bytes.len() as u16)?;
        self.write_bytes(bytes)
    }

    pub fn write_chunk_id(&mut self, id: &ChunkId) -> Result<(), RpcError> {
        self.write_u32(id.weak)?;
        self.write_bytes(&id.strong)
    }

    pub fn write_entry(&mut self, entry: &ChunkEntry) -> Result<(), RpcError> {
        match entry {
            ChunkEntry::End => self.write_u16(TAG_END),
            ChunkEntry::Reference { length, id } => {
                self.write_u16(TAG_REFERENCE)?;
                self.write_u32(*length)?;
                self.write_chunk_id(id)
            }
            ChunkEntry::Direct { len, data } => {
                self.write_u16(TAG_DIRECT)?;
                self.write_bytes(&[*len])?;
                self.write_bytes(&data[..*len as usize])
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), RpcError> {
        self.output.flush()?;
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────────

    pub fn read_u16(&mut self) -> Result<u16, RpcError> {
        let value = self.input.read_u16::<BigEndian>()?;
        self.stats.bytes_in += 2;
        Ok(value)
    }

    pub fn read_u32(&mut self) -> Result<u32, RpcError> {
        let value = self.input.read_u32::<BigEndian>()?;
        self.stats.bytes_in += 4;
        Ok(value)
    }

    pub fn read_u64(&mut self) -> Result<u64, RpcError> {
        let value = self.input.read_u64::<BigEndian>()?;
        self.stats.bytes_in += 8;
        Ok(value)
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<(), RpcError> {
        self.input.read_exact(buf)?;
        self.stats.bytes_in += buf.len() as u64;
        Ok(())
    }

    pub fn read_string(&mut self) -> Result<String, RpcError> {
        let len = self.read_u16()? as usize;
        let mut buf = vec![0u8; len];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|_| RpcError::Protocol("string payload is not UTF-8".into()))
    }

    pub fn read_chunk_id(&mut self) -> Result<ChunkId, RpcError> {
        let weak = self.read_u32()?;
        let mut strong = [0u8; MD5_LEN];
        self.read_bytes(&mut strong)?;
        Ok(ChunkId { weak, strong })
    }

    pub fn read_entry(&mut self) -> Result<ChunkEntry, RpcError> {
        let tag = self.read_u16()?;
        match tag {
            TAG_END => Ok(ChunkEntry::End),
            TAG_REFERENCE => {
                let length = self.read_u32()?;
                let id = self.read_chunk_id()?;
                Ok(ChunkEntry::Reference { length, id })
            }
            TAG_DIRECT => {
                let mut len = [0u8; 1];
                self.read_bytes(&mut len)?;
                let len = len[0];
                if len as usize > MAX_DIRECT_CHUNK_SIZE {
                    return Err(RpcError::Protocol(format!(
                        "direct chunk of {len} bytes exceeds {MAX_DIRECT_CHUNK_SIZE}"
                    )));
                }
                let mut data = [0u8; MAX_DIRECT_CHUNK_SIZE];
                self.read_bytes(&mut data[..len as usize])?;
                Ok(ChunkEntry::Direct { len, data })
            }
            other => Err(RpcError::Protocol(format!("unknown chunk entry tag {other}"))),
        }
    }
}
