//! The swap map: fixed page-sized slots on a raw block device.
//!
//! A bitmap tracks slot allocation under its own spinlock; transfers are
//! synchronous whole-page reads and writes against the device vnode at
//! `slot * PAGE_SIZE`. A slot is either free in the bitmap or referenced
//! by exactly one `Swap`-state PTE.

use alloc::sync::Arc;

use pion_core::bitmap::Bitmap;
use pion_core::sync::SpinLock;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_fs::vnode::Vnode;
use pion_machine::addr::PAGE_SIZE;
use pion_machine::ram::Ram;

/// The swap subsystem.
pub struct SwapMap {
    slots: SpinLock<Bitmap>,
    device: Arc<dyn Vnode>,
    nslots: usize,
}

impl SwapMap {
    /// Opens the swap space over `device`, deriving the slot count from
    /// the device size.
    pub fn new(td: &Thread, device: Arc<dyn Vnode>) -> Result<Self> {
        let bytes = device.size(td)?;
        let nslots = (bytes as usize) / PAGE_SIZE;
        log::info!("swap: {} pages ({} KB)", nslots, bytes / 1024);
        Ok(Self {
            slots: SpinLock::new(Bitmap::new(nslots)),
            device,
            nslots,
        })
    }

    /// Total slot count.
    pub fn slots(&self) -> usize {
        self.nslots
    }

    /// Currently allocated slot count.
    pub fn used_slots(&self, td: &Thread) -> usize {
        self.slots.lock(td).set_count()
    }

    /// Allocates a slot.
    pub fn alloc_slot(&self, td: &Thread) -> Result<u32> {
        self.slots
            .lock(td)
            .alloc()
            .map(|s| s as u32)
            .ok_or(KernelError::OutOfSwap)
    }

    /// Returns a slot to the free pool.
    pub fn free_slot(&self, td: &Thread, slot: u32) {
        self.slots.lock(td).unmark(slot as usize);
    }

    /// Writes frame `pfn` out to `slot`. The caller holds the PTE lock of
    /// the page being evicted, which keeps the frame contents stable.
    pub fn swap_out(&self, ram: &Ram, td: &Thread, pfn: u32, slot: u32) -> Result<()> {
        assert!((slot as usize) < self.nslots, "swap_out: bad slot {slot}");
        let mut page = [0u8; PAGE_SIZE];
        ram.read(pfn, 0, &mut page);
        let n = self
            .device
            .write_at(td, &page, slot as u64 * PAGE_SIZE as u64)?;
        if n != PAGE_SIZE {
            log::warn!("swap_out: short write to slot {slot} ({n} bytes)");
            return Err(KernelError::Io);
        }
        log::trace!("swap_out: pfn {pfn} -> slot {slot}");
        Ok(())
    }

    /// Reads `slot` into frame `pfn`. The caller holds the PTE lock of
    /// the page being brought in.
    pub fn swap_in(&self, ram: &Ram, td: &Thread, pfn: u32, slot: u32) -> Result<()> {
        assert!((slot as usize) < self.nslots, "swap_in: bad slot {slot}");
        let mut page = [0u8; PAGE_SIZE];
        let n = self
            .device
            .read_at(td, &mut page, slot as u64 * PAGE_SIZE as u64)?;
        if n != PAGE_SIZE {
            log::warn!("swap_in: short read from slot {slot} ({n} bytes)");
            return Err(KernelError::Io);
        }
        ram.write(pfn, 0, &page);
        log::trace!("swap_in: slot {slot} -> pfn {pfn}");
        Ok(())
    }
}
