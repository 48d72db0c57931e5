//! Growable byte buffer used for inbound accumulation.
//!
//! The buffer keeps two cursors over one contiguous allocation:
//!
//! ```text
//! +-----------+------------------+------------------+
//! | consumed  |  readable bytes  |  writable bytes  |
//! +-----------+------------------+------------------+
//! 0       read_pos           write_pos          capacity
//! ```
//!
//! Writes that do not fit in the trailing space first compact the readable
//! region to offset zero, and only grow the allocation when compaction alone
//! cannot make room. Draining the buffer resets both cursors to zero, which
//! keeps most compactions free.

use crate::error::BufferError;

/// Initial capacity of a session's inbound buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 4 * 1024;

/// A compacting read/write byte container.
///
/// Invariant: `read_pos <= write_pos <= capacity`.
#[derive(Debug)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    /// Create a buffer with [`DEFAULT_BUFFER_SIZE`] bytes of capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a buffer with the given initial capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Append `data` to the readable region.
    ///
    /// Never fails: the buffer grows without bound, so callers must limit
    /// untrusted input before it gets here.
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_writable(data.len());
        let end = self.write_pos + data.len();
        self.data[self.write_pos..end].copy_from_slice(data);
        self.write_pos = end;
    }

    /// Copy up to `out.len()` readable bytes into `out` and consume them.
    ///
    /// Returns the number of bytes copied.
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let n = out.len().min(self.readable_bytes());
        if n == 0 {
            return 0;
        }
        out[..n].copy_from_slice(&self.data[self.read_pos..self.read_pos + n]);
        self.advance(n);
        n
    }

    /// View the readable region without consuming it.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Discard `len` bytes from the front of the readable region.
    ///
    /// Fails without touching the buffer if `len` exceeds the readable bytes.
    pub fn retrieve(&mut self, len: usize) -> Result<(), BufferError> {
        let readable = self.readable_bytes();
        if len > readable {
            return Err(BufferError::OutOfRange {
                requested: len,
                readable,
            });
        }
        self.advance(len);
        Ok(())
    }

    /// Discard everything readable.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Number of unread bytes.
    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Contiguous space after the write cursor.
    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    /// Total size of the allocation.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Check if there is nothing to read.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    fn advance(&mut self, len: usize) {
        self.read_pos += len;
        if self.read_pos == self.write_pos {
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Make at least `len` contiguous bytes available after the write cursor.
    fn ensure_writable(&mut self, len: usize) {
        if len <= self.writable_bytes() {
            return;
        }

        let readable = self.readable_bytes();
        if len <= self.capacity() - readable {
            // Enough room once the consumed prefix is reclaimed
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            let new_capacity = std::cmp::max(self.capacity() * 2, self.write_pos + len);
            self.data.resize(new_capacity, 0);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"hello");

        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.writable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello");

        let mut out = [0u8; 3];
        assert_eq!(buf.read(&mut out), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(buf.peek(), b"lo");
    }

    #[test]
    fn test_drain_resets_cursors() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"abcdef");

        let mut out = [0u8; 32];
        assert_eq!(buf.read(&mut out), 6);
        assert!(buf.is_empty());
        // Both cursors back at zero, so the full capacity is writable again
        assert_eq!(buf.writable_bytes(), 16);
        assert_eq!(buf.read(&mut out), 0);
    }

    #[test]
    fn test_compacts_before_growing() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(&[1u8; 12]);
        buf.retrieve(8).unwrap();

        // 4 readable, 4 trailing, 8 reclaimable at the front
        buf.write(&[2u8; 10]);

        assert_eq!(buf.capacity(), 16);
        assert_eq!(buf.readable_bytes(), 14);
        assert_eq!(&buf.peek()[..4], &[1u8; 4]);
        assert_eq!(&buf.peek()[4..], &[2u8; 10]);
    }

    #[test]
    fn test_growth_doubles_capacity() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(&[7u8; 10]);
        buf.write(&[8u8; 10]);

        assert_eq!(buf.capacity(), 32);
        assert_eq!(buf.readable_bytes(), 20);
        assert_eq!(&buf.peek()[..10], &[7u8; 10]);
        assert_eq!(&buf.peek()[10..], &[8u8; 10]);
    }

    #[test]
    fn test_growth_fits_large_write() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(&[1u8; 10]);
        buf.write(&[2u8; 40]);

        assert_eq!(buf.capacity(), 50);
        assert_eq!(buf.readable_bytes(), 50);
        assert_eq!(buf.writable_bytes(), 0);
    }

    #[test]
    fn test_growth_from_zero_capacity() {
        let mut buf = Buffer::with_capacity(0);
        buf.write(b"xyz");
        assert_eq!(buf.peek(), b"xyz");
        assert!(buf.capacity() >= 3);
    }

    #[test]
    fn test_retrieve_out_of_range_leaves_state() {
        let mut buf = Buffer::with_capacity(16);
        buf.write(b"ping");

        let err = buf.retrieve(5).unwrap_err();
        assert_eq!(
            err,
            BufferError::OutOfRange {
                requested: 5,
                readable: 4
            }
        );
        assert_eq!(buf.peek(), b"ping");
        assert_eq!(buf.writable_bytes(), 12);
    }

    #[test]
    fn test_partial_retrieve_keeps_suffix() {
        let mut buf = Buffer::new();
        buf.write(b"GET /a\r\nGET /b");
        buf.retrieve(8).unwrap();
        assert_eq!(buf.peek(), b"GET /b");

        buf.write(b"\r\n");
        assert_eq!(buf.peek(), b"GET /b\r\n");

        buf.retrieve_all();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_write_is_noop() {
        let mut buf = Buffer::with_capacity(0);
        buf.write(&[]);
        assert_eq!(buf.capacity(), 0);
        assert!(buf.is_empty());
    }
}
