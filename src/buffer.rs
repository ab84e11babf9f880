//! Bounded byte buffers.
//!
//! Every buffer in a connection has a fixed capacity chosen from [`Config`](crate::Config)
//! when the connection is opened. Writes that would exceed it fail with
//! [`Error::BufferFull`] and leave the contents untouched.

use std::fmt;
use std::ops::Deref;

use crate::Error;

/// Byte buffer with a hard capacity.
#[derive(Default)]
pub(crate) struct Buf {
    data: Vec<u8>,
    capacity: usize,
}

impl Buf {
    /// Create an empty buffer that holds at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Buf {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes that can still be written.
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Push a single byte.
    pub fn push(&mut self, byte: u8) -> Result<(), Error> {
        if self.free() == 0 {
            return Err(Error::BufferFull);
        }
        self.data.push(byte);
        Ok(())
    }

    /// Append a slice. Nothing is written if it does not fit entirely.
    pub fn extend_from_slice(&mut self, other: &[u8]) -> Result<(), Error> {
        if other.len() > self.free() {
            return Err(Error::BufferFull);
        }
        self.data.extend_from_slice(other);
        Ok(())
    }

    /// Remove `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.data.len());
        self.data.drain(..n);
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Deref for Buf {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounded_push() {
        let mut b = Buf::with_capacity(2);
        b.push(1).unwrap();
        b.push(2).unwrap();
        assert!(matches!(b.push(3), Err(Error::BufferFull)));
        assert_eq!(&*b, &[1, 2]);
    }

    #[test]
    fn extend_is_all_or_nothing() {
        let mut b = Buf::with_capacity(4);
        b.extend_from_slice(&[1, 2, 3]).unwrap();
        assert!(b.extend_from_slice(&[4, 5]).is_err());
        assert_eq!(b.len(), 3);
        b.consume(2);
        assert_eq!(&*b, &[3]);
        assert_eq!(b.free(), 3);
    }
}
