//! Circular buffer backing the synchronizer's sliding window.
//!
//! The window holds exactly `chunk_size` bytes.  During the match loop
//! the oldest byte is rotated out as a new byte is pushed in; when a
//! match resets the window the storage is refilled linearly from the
//! front.  `md5` digests the bytes in logical order, following the
//! wrap-around, which must equal the MD5 of the same bytes read
//! straight from the input.

use md5::{Digest, Md5};

use crate::id::MD5_LEN;

#[derive(Debug)]
pub struct RingBuffer {
    buf: Vec<u8>,
    idx: usize,
}

impl RingBuffer {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "ring buffer size must be nonzero");
        RingBuffer { buf: vec![0; size], idx: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The byte about to be rotated out (logical front of the window).
    #[inline]
    pub fn oldest(&self) -> u8 {
        self.buf[self.idx]
    }

    /// Overwrite the oldest byte with `value` and advance the window.
    #[inline]
    pub fn push(&mut self, value: u8) {
        self.buf[self.idx] = value;
        self.idx = (self.idx + 1) % self.buf.len();
    }

    /// Rewind the logical origin to the storage front.  Call before a
    /// linear refill via [`storage_mut`](Self::storage_mut).
    #[inline]
    pub fn reset(&mut self) {
        self.idx = 0;
    }

    /// Linear view of the underlying storage, for bulk refills.  Only
    /// meaningful while the origin is at the front (after `reset`).
    #[inline]
    pub fn storage(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable linear view of the underlying storage.
    #[inline]
    pub fn storage_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// MD5 of the window contents in logical order (oldest byte first,
    /// following the wrap-around).
    pub fn md5(&self) -> [u8; MD5_LEN] {
        let mut md5 = Md5::new();
        md5.update(&self.buf[self.idx..]);
        if self.idx != 0 {
            md5.update(&self.buf[..self.idx]);
        }
        md5.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rotates_oldest() {
        let mut ring = RingBuffer::new(4);
        ring.storage_mut().copy_from_slice(b"abcd");
        assert_eq!(ring.oldest(), b'a');
        ring.push(b'e');
        assert_eq!(ring.oldest(), b'b');
        ring.push(b'f');
        assert_eq!(ring.oldest(), b'c');
    }

    #[test]
    fn md5_follows_wraparound() {
        let mut ring = RingBuffer::new(8);
        ring.storage_mut().copy_from_slice(b"abcdefgh");
        // Slide the window three bytes forward: contents are "defghijk".
        for b in *b"ijk" {
            ring.push(b);
        }
        assert_eq!(ring.md5(), <[u8; 16]>::from(Md5::digest(b"defghijk")));
    }

    #[test]
    fn md5_after_reset_is_linear() {
        let mut ring = RingBuffer::new(5);
        ring.push(b'x');
        ring.reset();
        ring.storage_mut().copy_from_slice(b"hello");
        assert_eq!(ring.md5(), <[u8; 16]>::from(Md5::digest(b"hello")));
    }
}
