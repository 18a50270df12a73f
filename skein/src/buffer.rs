//! Bounded byte buffer shared by channels and the native resolver.
//!
//! Fullness is the back-pressure signal for the whole stack: engines stop
//! producing frames while the write buffer is full, and a full read buffer
//! drops read interest until the parser catches up.

use std::io;

/// Error returned when an append does not fit.
#[derive(Debug, PartialEq, Eq)]
pub struct BufferFull;

/// A byte buffer with a hard capacity.
pub struct Buffer {
    data: Vec<u8>,
    cap: usize,
}

impl Buffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(4096)),
            cap,
        }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.data.len() >= self.cap
    }

    /// Space left before the buffer reports full.
    pub fn remaining(&self) -> usize {
        self.cap - self.data.len()
    }

    /// Borrow the buffered bytes.
    pub fn view(&self) -> &[u8] {
        &self.data
    }

    /// Append all of `bytes`, or none of them.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufferFull> {
        if bytes.len() > self.remaining() {
            return Err(BufferFull);
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Append as much of `bytes` as fits; returns how many were taken.
    pub fn append_partial(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.remaining());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Drop the first `n` bytes.
    pub fn consume(&mut self, n: usize) {
        self.data.drain(..n.min(self.data.len()));
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Fill the buffer from a reader-shaped closure operating on the spare
    /// space. Returns the closure's byte count.
    pub fn read_from<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let len = self.data.len();
        self.data.resize(self.cap, 0);
        match read(&mut self.data[len..]) {
            Ok(n) => {
                self.data.truncate(len + n);
                Ok(n)
            }
            Err(e) => {
                self.data.truncate(len);
                Err(e)
            }
        }
    }

    /// Drain the buffer into a writer-shaped closure. Consumes exactly what
    /// the closure reports written.
    pub fn write_to<F>(&mut self, write: F) -> io::Result<usize>
    where
        F: FnOnce(&[u8]) -> io::Result<usize>,
    {
        let n = write(&self.data)?;
        self.consume(n);
        Ok(n)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.data.len())
            .field("cap", &self.cap)
            .finish()
    }
}
