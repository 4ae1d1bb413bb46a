//! Open-file handles and per-process descriptor tables.
//!
//! A [`FileHandle`] is the shared open-file object: one per successful
//! `open`, shared across processes by `fork` and across descriptors by
//! `dup2`. Sharing is `Arc`-managed; the handle's vnode reference drops
//! exactly once, when the last descriptor slot releases its clone. The
//! handle's sleep lock serializes offset updates for read/write/seek.
//!
//! A [`FdTable`] is the per-process fixed-size array of descriptor slots,
//! protected by its own sleep lock.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use pion_core::id::Fd;
use pion_core::limits::OPEN_MAX;
use pion_core::sync::SleepLock;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};

use crate::vfs::Vfs;
use crate::vnode::Vnode;

/// How a file was opened for access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    /// Reads only.
    ReadOnly,
    /// Writes only.
    WriteOnly,
    /// Both directions.
    ReadWrite,
}

impl AccessMode {
    /// True when reads are permitted.
    pub fn readable(self) -> bool {
        self != AccessMode::WriteOnly
    }

    /// True when writes are permitted.
    pub fn writable(self) -> bool {
        self != AccessMode::ReadOnly
    }
}

bitflags! {
    /// Open flags beyond the access mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Create the file if it does not exist.
        const CREATE = 0x4;
        /// With `CREATE`, fail if the file already exists.
        const EXCL = 0x8;
        /// Truncate to zero length on open.
        const TRUNC = 0x10;
    }
}

/// Decodes the raw `open(2)` flags word: the low two bits carry the access
/// mode, the rest are [`OpenFlags`].
pub fn decode_open_flags(raw: u32) -> Result<(AccessMode, OpenFlags)> {
    let mode = match raw & 0x3 {
        0 => AccessMode::ReadOnly,
        1 => AccessMode::WriteOnly,
        2 => AccessMode::ReadWrite,
        _ => return Err(KernelError::Invalid),
    };
    let flags = OpenFlags::from_bits(raw & !0x3).ok_or(KernelError::Invalid)?;
    Ok((mode, flags))
}

/// `lseek` origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    /// Absolute position.
    Set,
    /// Relative to the current offset.
    Cur,
    /// Relative to end-of-file.
    End,
}

impl Whence {
    /// Decodes the raw `whence` argument.
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(Whence::Set),
            1 => Ok(Whence::Cur),
            2 => Ok(Whence::End),
            _ => Err(KernelError::Invalid),
        }
    }
}

/// A shared open-file object.
pub struct FileHandle {
    vnode: Arc<dyn Vnode>,
    mode: AccessMode,
    offset: SleepLock<u64>,
}

impl FileHandle {
    /// Wraps an opened vnode. The byte offset starts at zero.
    pub fn new(vnode: Arc<dyn Vnode>, mode: AccessMode) -> Arc<Self> {
        Arc::new(Self {
            vnode,
            mode,
            offset: SleepLock::new(0),
        })
    }

    /// The underlying vnode.
    pub fn vnode(&self) -> &Arc<dyn Vnode> {
        &self.vnode
    }

    /// The access mode the handle was opened with.
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current byte offset.
    pub fn offset(&self, td: &Thread) -> u64 {
        *self.offset.acquire(td)
    }

    /// Reads from the current offset, advancing it by the bytes moved.
    ///
    /// The offset is sampled under the handle lock, the transfer runs with
    /// the lock released (it may sleep), and the new offset is committed
    /// afterwards. Partial transfers are permitted.
    pub fn read(&self, td: &Thread, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.readable() {
            return Err(KernelError::BadFd);
        }
        let off = *self.offset.acquire(td);
        let n = self.vnode.read_at(td, buf, off)?;
        *self.offset.acquire(td) = off + n as u64;
        Ok(n)
    }

    /// Writes at the current offset, advancing it by the bytes moved.
    pub fn write(&self, td: &Thread, buf: &[u8]) -> Result<usize> {
        if !self.mode.writable() {
            return Err(KernelError::BadFd);
        }
        let off = *self.offset.acquire(td);
        let n = self.vnode.write_at(td, buf, off)?;
        *self.offset.acquire(td) = off + n as u64;
        Ok(n)
    }

    /// Repositions the offset. Returns the new absolute position.
    ///
    /// `End` consults the vnode's size; a negative result is rejected with
    /// `Invalid`; non-seekable vnodes fail with `NotSeekable`.
    pub fn lseek(&self, td: &Thread, offset: i64, whence: Whence) -> Result<u64> {
        if !self.vnode.is_seekable() {
            return Err(KernelError::NotSeekable);
        }
        let mut cur = self.offset.acquire(td);
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => *cur as i64,
            Whence::End => self.vnode.size(td)? as i64,
        };
        let newpos = base.checked_add(offset).ok_or(KernelError::Invalid)?;
        if newpos < 0 {
            return Err(KernelError::Invalid);
        }
        *cur = newpos as u64;
        Ok(newpos as u64)
    }
}

/// One descriptor slot: the shared handle plus per-descriptor flags.
#[derive(Clone)]
pub struct FdEntry {
    /// The shared open-file handle.
    pub handle: Arc<FileHandle>,
    /// Per-descriptor flags (close-on-exec and friends). Preserved by
    /// `dup2`.
    pub flags: u32,
}

/// Per-process file descriptor table.
pub struct FdTable {
    slots: SleepLock<Vec<Option<FdEntry>>>,
}

impl FdTable {
    /// Creates an empty table of `OPEN_MAX` slots.
    pub fn new() -> Self {
        let mut slots = Vec::new();
        slots.resize_with(OPEN_MAX, || None);
        Self {
            slots: SleepLock::new(slots),
        }
    }

    fn check(fd: Fd) -> Result<usize> {
        let idx = fd.as_usize();
        if idx >= OPEN_MAX {
            return Err(KernelError::BadFd);
        }
        Ok(idx)
    }

    /// Installs `handle` in the lowest free slot.
    pub fn alloc(&self, td: &Thread, handle: Arc<FileHandle>) -> Result<Fd> {
        let mut slots = self.slots.acquire(td);
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(FdEntry { handle, flags: 0 });
                return Ok(Fd::new(i as u32));
            }
        }
        Err(KernelError::TooManyFiles)
    }

    /// Installs `handle` at a specific descriptor, evicting any previous
    /// occupant. Used to bind the console to descriptors 0/1/2.
    pub fn install(&self, td: &Thread, fd: Fd, handle: Arc<FileHandle>, flags: u32) -> Result<()> {
        let idx = Self::check(fd)?;
        let evicted = {
            let mut slots = self.slots.acquire(td);
            slots[idx].replace(FdEntry { handle, flags })
        };
        drop(evicted);
        Ok(())
    }

    /// Empties a slot. The handle reference is released outside the table
    /// lock.
    pub fn free(&self, td: &Thread, fd: Fd) -> Result<()> {
        let idx = Self::check(fd)?;
        let entry = {
            let mut slots = self.slots.acquire(td);
            slots[idx].take().ok_or(KernelError::BadFd)?
        };
        drop(entry);
        Ok(())
    }

    /// Returns the handle in `fd`, cloned so the caller can operate
    /// without holding the table lock.
    pub fn get(&self, td: &Thread, fd: Fd) -> Result<Arc<FileHandle>> {
        let idx = Self::check(fd)?;
        let slots = self.slots.acquire(td);
        slots[idx]
            .as_ref()
            .map(|e| Arc::clone(&e.handle))
            .ok_or(KernelError::BadFd)
    }

    /// `dup2` semantics: `oldfd == newfd` is a validity check only;
    /// otherwise the handle in `oldfd` (with its per-descriptor flags)
    /// replaces whatever `newfd` held. The evicted handle is released
    /// outside the table lock.
    pub fn dup(&self, td: &Thread, oldfd: Fd, newfd: Fd) -> Result<Fd> {
        let old_idx = Self::check(oldfd)?;
        let new_idx = Self::check(newfd)?;

        if old_idx == new_idx {
            let slots = self.slots.acquire(td);
            return match slots[old_idx] {
                Some(_) => Ok(newfd),
                None => Err(KernelError::BadFd),
            };
        }

        let evicted = {
            let mut slots = self.slots.acquire(td);
            let entry = slots[old_idx].clone().ok_or(KernelError::BadFd)?;
            slots[new_idx].replace(entry)
        };
        drop(evicted);
        Ok(newfd)
    }

    /// Sets the per-descriptor flags of an open slot.
    pub fn set_flags(&self, td: &Thread, fd: Fd, flags: u32) -> Result<()> {
        let idx = Self::check(fd)?;
        let mut slots = self.slots.acquire(td);
        match slots[idx].as_mut() {
            Some(entry) => {
                entry.flags = flags;
                Ok(())
            }
            None => Err(KernelError::BadFd),
        }
    }

    /// Atomically extracts every handle, then releases them outside the
    /// table lock.
    pub fn close_all(&self, td: &Thread) {
        let taken: Vec<FdEntry> = {
            let mut slots = self.slots.acquire(td);
            slots.iter_mut().filter_map(Option::take).collect()
        };
        drop(taken);
    }

    /// Clones every open slot from `parent`, sharing the handles. Each
    /// clone bumps the handle's reference count; this is the fork path.
    pub fn inherit(&self, td: &Thread, parent: &FdTable) {
        let copied: Vec<Option<FdEntry>> = parent.slots.acquire(td).clone();
        let mut slots = self.slots.acquire(td);
        *slots = copied;
    }

    /// Binds the console device to descriptors 0 (read-only), 1 and 2
    /// (write-only), each through its own handle.
    pub fn bind_console(&self, td: &Thread, vfs: &Vfs) -> Result<()> {
        let modes = [
            AccessMode::ReadOnly,
            AccessMode::WriteOnly,
            AccessMode::WriteOnly,
        ];
        for (i, mode) in modes.into_iter().enumerate() {
            let vnode = vfs.resolve(td, "con:", "")?;
            let handle = FileHandle::new(vnode, mode);
            self.install(td, Fd::new(i as u32), handle, 0)?;
        }
        Ok(())
    }
}

impl Default for FdTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memfile::MemFile;

    fn handle(mode: AccessMode) -> Arc<FileHandle> {
        FileHandle::new(MemFile::new(), mode)
    }

    #[test]
    fn decode_flags() {
        let (mode, flags) = decode_open_flags(1 | 0x4 | 0x10).unwrap();
        assert_eq!(mode, AccessMode::WriteOnly);
        assert_eq!(flags, OpenFlags::CREATE | OpenFlags::TRUNC);
        assert!(decode_open_flags(3).is_err());
        assert!(decode_open_flags(0x8000).is_err());
    }

    #[test]
    fn read_on_writeonly_handle_fails() {
        let td = Thread::new("t");
        let h = handle(AccessMode::WriteOnly);
        let mut buf = [0u8; 4];
        assert_eq!(h.read(&td, &mut buf), Err(KernelError::BadFd));
    }

    #[test]
    fn write_advances_offset() {
        let td = Thread::new("t");
        let h = handle(AccessMode::ReadWrite);
        h.write(&td, b"0123456789").unwrap();
        assert_eq!(h.offset(&td), 10);
        assert_eq!(h.lseek(&td, -5, Whence::Cur).unwrap(), 5);
        let mut buf = [0u8; 5];
        assert_eq!(h.read(&td, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"56789");
        assert_eq!(h.lseek(&td, 0, Whence::End).unwrap(), 10);
    }

    #[test]
    fn lseek_cur_zero_is_a_pure_query() {
        let td = Thread::new("t");
        let h = handle(AccessMode::ReadWrite);
        h.write(&td, b"abc").unwrap();
        assert_eq!(h.lseek(&td, 0, Whence::Cur).unwrap(), 3);
        assert_eq!(h.offset(&td), 3);
    }

    #[test]
    fn lseek_negative_result_rejected() {
        let td = Thread::new("t");
        let h = handle(AccessMode::ReadOnly);
        assert_eq!(h.lseek(&td, -1, Whence::Set), Err(KernelError::Invalid));
    }

    #[test]
    fn fd_alloc_free_get() {
        let td = Thread::new("t");
        let table = FdTable::new();
        let fd = table.alloc(&td, handle(AccessMode::ReadOnly)).unwrap();
        assert_eq!(fd.as_u32(), 0);
        assert!(table.get(&td, fd).is_ok());
        table.free(&td, fd).unwrap();
        assert!(matches!(table.get(&td, fd), Err(KernelError::BadFd)));
        assert_eq!(table.free(&td, fd), Err(KernelError::BadFd));
    }

    #[test]
    fn fd_table_fills_to_open_max() {
        let td = Thread::new("t");
        let table = FdTable::new();
        for _ in 0..OPEN_MAX {
            table.alloc(&td, handle(AccessMode::ReadOnly)).unwrap();
        }
        assert_eq!(
            table.alloc(&td, handle(AccessMode::ReadOnly)),
            Err(KernelError::TooManyFiles)
        );
    }

    #[test]
    fn dup_same_fd_checks_validity() {
        let td = Thread::new("t");
        let table = FdTable::new();
        let fd = table.alloc(&td, handle(AccessMode::ReadOnly)).unwrap();
        assert_eq!(table.dup(&td, fd, fd).unwrap(), fd);
        assert_eq!(
            table.dup(&td, Fd::new(9), Fd::new(9)),
            Err(KernelError::BadFd)
        );
    }

    #[test]
    fn dup_shares_the_handle() {
        let td = Thread::new("t");
        let table = FdTable::new();
        let h = handle(AccessMode::ReadWrite);
        let fd = table.alloc(&td, Arc::clone(&h)).unwrap();
        // One clone in the table, one local.
        assert_eq!(Arc::strong_count(&h), 2);
        table.dup(&td, fd, Fd::new(5)).unwrap();
        assert_eq!(Arc::strong_count(&h), 3);
        let via_dup = table.get(&td, Fd::new(5)).unwrap();
        assert!(Arc::ptr_eq(&h, &via_dup));
    }

    #[test]
    fn close_all_empties_every_slot() {
        let td = Thread::new("t");
        let table = FdTable::new();
        let h = handle(AccessMode::ReadOnly);
        for _ in 0..4 {
            table.alloc(&td, Arc::clone(&h)).unwrap();
        }
        assert_eq!(Arc::strong_count(&h), 5);
        table.close_all(&td);
        assert_eq!(Arc::strong_count(&h), 1);
        assert!(matches!(table.get(&td, Fd::new(0)), Err(KernelError::BadFd)));
    }

    #[test]
    fn inherit_bumps_refcounts() {
        let td = Thread::new("t");
        let parent = FdTable::new();
        let h = handle(AccessMode::ReadWrite);
        let fd = parent.alloc(&td, Arc::clone(&h)).unwrap();

        let child = FdTable::new();
        child.inherit(&td, &parent);
        assert_eq!(Arc::strong_count(&h), 3);
        // Same shared handle, so the offset is shared too.
        let ch = child.get(&td, fd).unwrap();
        ch.write(&td, b"xy").unwrap();
        assert_eq!(h.offset(&td), 2);
    }
}
