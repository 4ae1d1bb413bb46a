//! Two-level page tables.
//!
//! A 20-bit virtual page number splits into two 10-bit indices: the L1
//! array holds 1024 slots, each lazily filled with an L2 page of 1024
//! entries. Once installed, an L2 pointer is never rewritten; only its
//! entries mutate. Every entry sits behind its own sleep lock, which is
//! what makes the fault handler's state transitions atomic.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use pion_core::sync::{SleepLock, SleepLockGuard};
use pion_core::thread::Thread;
use pion_machine::addr::VirtAddr;

/// Entries in the first-level table.
pub const PT_L1_SIZE: usize = 1024;

/// Entries in one second-level page.
pub const PT_L2_SIZE: usize = 1024;

/// Index of `va` in the first-level table.
pub fn l1_index(va: VirtAddr) -> usize {
    (va.vpn() >> 10) as usize
}

/// Index of `va` within its second-level page.
pub fn l2_index(va: VirtAddr) -> usize {
    (va.vpn() & 0x3FF) as usize
}

/// Where a page's contents live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteState {
    /// Never touched; first use allocates and zero-fills.
    Unalloc,
    /// Allocated but never materialized; satisfied by zero-fill.
    Zero,
    /// Resident; `pfn` is valid.
    Ram,
    /// Paged out; `swap_slot` is valid.
    Swap,
}

/// One page-table entry. `pfn` is meaningful only in `Ram` state,
/// `swap_slot` only in `Swap` state.
#[derive(Debug, Clone, Copy)]
pub struct Pte {
    /// Residency state.
    pub state: PteState,
    /// Physical frame number while `Ram`.
    pub pfn: u32,
    /// Swap slot index while `Swap`.
    pub swap_slot: u32,
    /// The page has been written.
    pub dirty: bool,
    /// Writes are not permitted.
    pub readonly: bool,
    /// Referenced bit for the eviction clock.
    pub referenced: bool,
}

impl Pte {
    /// The untouched entry.
    pub const UNALLOC: Pte = Pte {
        state: PteState::Unalloc,
        pfn: 0,
        swap_slot: 0,
        dirty: false,
        readonly: false,
        referenced: false,
    };
}

/// A second-level page: 1024 individually locked entries.
pub struct L2Page {
    entries: Box<[SleepLock<Pte>]>,
}

impl L2Page {
    pub(crate) fn new() -> Arc<Self> {
        let entries: Vec<SleepLock<Pte>> =
            (0..PT_L2_SIZE).map(|_| SleepLock::new(Pte::UNALLOC)).collect();
        Arc::new(Self {
            entries: entries.into_boxed_slice(),
        })
    }

    /// The lock wrapping entry `idx`.
    pub fn entry(&self, idx: usize) -> &SleepLock<Pte> {
        &self.entries[idx]
    }
}

/// The first-level table: lazily allocated, slots filled at most once.
pub(crate) type L1Table = Box<[Option<Arc<L2Page>>]>;

pub(crate) fn new_l1() -> L1Table {
    let slots: Vec<Option<Arc<L2Page>>> = (0..PT_L1_SIZE).map(|_| None).collect();
    slots.into_boxed_slice()
}

/// A handle on one PTE: the shared L2 page plus the entry index. Keeping
/// the `Arc` alive pins the entry, so the handle stays valid even if the
/// address space is concurrently torn down.
#[derive(Clone)]
pub struct PteRef {
    page: Arc<L2Page>,
    index: usize,
}

impl PteRef {
    pub(crate) fn new(page: Arc<L2Page>, index: usize) -> Self {
        Self { page, index }
    }

    /// Locks the entry for inspection or mutation.
    pub fn lock<'a>(&'a self, td: &'a Thread) -> SleepLockGuard<'a, Pte> {
        self.page.entry(self.index).acquire(td)
    }

    /// Lock attempt that never blocks; the eviction scan uses this to
    /// stay deadlock-free.
    pub fn try_lock<'a>(&'a self, td: &'a Thread) -> Option<SleepLockGuard<'a, Pte>> {
        self.page.entry(self.index).try_acquire(td)
    }
}
