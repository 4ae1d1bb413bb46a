//! The vnode object interface.
//!
//! Everything a file syscall or the swap subsystem needs from an open
//! object: positioned reads and writes, a size for `SEEK_END`, and a
//! seekability predicate. Transfers are synchronous and may sleep; callers
//! must not hold spinlocks across them.

use pion_core::thread::Thread;
use pion_core::Result;

/// A file-like kernel object.
pub trait Vnode: Send + Sync {
    /// Reads up to `buf.len()` bytes at `offset`. Returns the byte count
    /// actually moved; 0 means end-of-file. Partial reads are permitted.
    fn read_at(&self, td: &Thread, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes up to `buf.len()` bytes at `offset`. Returns the byte count
    /// actually moved. Partial writes are permitted.
    fn write_at(&self, td: &Thread, buf: &[u8], offset: u64) -> Result<usize>;

    /// Current size in bytes. Fails with
    /// [`KernelError::NotSeekable`](pion_core::KernelError::NotSeekable)
    /// for stream devices.
    fn size(&self, td: &Thread) -> Result<u64>;

    /// Whether byte offsets are meaningful for this object. `lseek` on a
    /// non-seekable vnode fails with `NotSeekable`.
    fn is_seekable(&self) -> bool {
        true
    }
}
