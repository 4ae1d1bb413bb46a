//! Memory-backed files.
//!
//! A growable byte vector behind the [`Vnode`] interface. Serves as the
//! file object of the RAM volume and, created with a fixed size, as the
//! raw block device backing the swap partition.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pion_core::sync::SleepLock;
use pion_core::thread::Thread;
use pion_core::Result;

use crate::vnode::Vnode;

/// A memory-backed file.
pub struct MemFile {
    data: SleepLock<Vec<u8>>,
}

impl MemFile {
    /// Creates an empty file.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: SleepLock::new(Vec::new()),
        })
    }

    /// Creates a zero-filled file of `size` bytes (a raw device image).
    pub fn with_size(size: usize) -> Arc<Self> {
        Arc::new(Self {
            data: SleepLock::new(vec![0u8; size]),
        })
    }

    /// Truncates the file to zero length.
    pub fn truncate(&self, td: &Thread) {
        self.data.acquire(td).clear();
    }
}

impl Vnode for MemFile {
    fn read_at(&self, td: &Thread, buf: &mut [u8], offset: u64) -> Result<usize> {
        let data = self.data.acquire(td);
        let len = data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let n = buf.len().min((len - offset) as usize);
        buf[..n].copy_from_slice(&data[offset as usize..offset as usize + n]);
        Ok(n)
    }

    fn write_at(&self, td: &Thread, buf: &[u8], offset: u64) -> Result<usize> {
        let mut data = self.data.acquire(td);
        let end = offset as usize + buf.len();
        if end > data.len() {
            // Writing past the end zero-fills the gap.
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self, td: &Thread) -> Result<u64> {
        Ok(self.data.acquire(td).len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_end_is_eof() {
        let td = Thread::new("t");
        let f = MemFile::new();
        let mut buf = [0u8; 4];
        assert_eq!(f.read_at(&td, &mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn write_then_read_back() {
        let td = Thread::new("t");
        let f = MemFile::new();
        assert_eq!(f.write_at(&td, b"hello", 0).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(f.read_at(&td, &mut buf, 0).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(f.size(&td).unwrap(), 5);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let td = Thread::new("t");
        let f = MemFile::new();
        f.write_at(&td, b"x", 8).unwrap();
        assert_eq!(f.size(&td).unwrap(), 9);
        let mut buf = [0xFFu8; 9];
        f.read_at(&td, &mut buf, 0).unwrap();
        assert_eq!(&buf[..8], &[0u8; 8]);
        assert_eq!(buf[8], b'x');
    }

    #[test]
    fn fixed_size_image() {
        let td = Thread::new("t");
        let f = MemFile::with_size(4096);
        assert_eq!(f.size(&td).unwrap(), 4096);
        let mut buf = [1u8; 16];
        assert_eq!(f.read_at(&td, &mut buf, 4080).unwrap(), 16);
        assert_eq!(buf, [0u8; 16]);
    }
}
