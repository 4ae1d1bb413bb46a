//! The coremap: per-frame state for all of physical memory.
//!
//! One entry per RAM page, all under a single spinlock. Kernel
//! allocations are contiguous first-fit runs marked `Fixed`; user pages
//! are single frames carrying their owning address space and virtual page
//! number so the evictor can find the mapping PTE. The spinlock is never
//! held across anything that can sleep.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use pion_core::sync::SpinLock;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::PAGE_SIZE;

use crate::address_space::AddressSpace;

/// Allocation state of one physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Available for allocation.
    Free,
    /// Wired kernel memory; never evicted.
    Fixed,
    /// Owned by a user address space.
    User,
    /// A swap-out is in flight; only the evictor may touch the frame.
    Evicting,
}

struct Frame {
    state: FrameState,
    /// Run length if this is the head of a kernel allocation, else 0.
    chunk_len: u16,
    owner: Weak<AddressSpace>,
    owner_vpn: u32,
}

impl Frame {
    fn clear(&mut self) {
        self.state = FrameState::Free;
        self.chunk_len = 0;
        self.owner = Weak::new();
        self.owner_vpn = 0;
    }
}

struct CoreMapInner {
    frames: Vec<Frame>,
    /// Clock hand for eviction victim selection.
    victim_cursor: usize,
}

impl CoreMapInner {
    /// First index of a run of `npages` free frames, if any.
    fn find_run(&self, npages: usize) -> Option<usize> {
        let total = self.frames.len();
        let mut i = 0;
        while i + npages <= total {
            if self.frames[i].state != FrameState::Free {
                i += 1;
                continue;
            }
            match (1..npages).find(|&j| self.frames[i + j].state != FrameState::Free) {
                None => return Some(i),
                Some(j) => i += j,
            }
        }
        None
    }
}

/// Frame-state counts, for the debug dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreMapStats {
    /// Frames available for allocation.
    pub free: usize,
    /// Wired kernel frames.
    pub fixed: usize,
    /// User-owned frames.
    pub user: usize,
    /// Frames mid-eviction.
    pub evicting: usize,
}

/// The physical frame allocator.
pub struct CoreMap {
    inner: SpinLock<CoreMapInner>,
    total: usize,
}

impl CoreMap {
    /// Creates a coremap over `total` frames, with the first
    /// `kernel_frames` (kernel image + the coremap itself) wired.
    pub fn new(total: usize, kernel_frames: usize) -> Self {
        let mut frames = Vec::with_capacity(total);
        for i in 0..total {
            frames.push(Frame {
                state: if i < kernel_frames {
                    FrameState::Fixed
                } else {
                    FrameState::Free
                },
                chunk_len: if i == 0 { kernel_frames as u16 } else { 0 },
                owner: Weak::new(),
                owner_vpn: 0,
            });
        }
        Self {
            inner: SpinLock::new(CoreMapInner {
                frames,
                victim_cursor: 0,
            }),
            total,
        }
    }

    /// Total frames tracked.
    pub fn total_frames(&self) -> usize {
        self.total
    }

    /// First-fit allocation of `npages` contiguous kernel frames.
    pub fn try_alloc_kernel_run(&self, td: &Thread, npages: usize) -> Option<u32> {
        let mut inner = self.inner.lock(td);
        let head = inner.find_run(npages)?;
        inner.frames[head].state = FrameState::Fixed;
        inner.frames[head].chunk_len = npages as u16;
        for j in 1..npages {
            inner.frames[head + j].state = FrameState::Fixed;
            inner.frames[head + j].chunk_len = 0;
        }
        Some(head as u32)
    }

    /// Claims one specific frame for the kernel if it is still free.
    /// Used after an eviction freed it.
    pub fn claim_kernel_frame(&self, td: &Thread, pfn: u32) -> bool {
        let mut inner = self.inner.lock(td);
        let frame = &mut inner.frames[pfn as usize];
        if frame.state != FrameState::Free {
            return false;
        }
        frame.state = FrameState::Fixed;
        frame.chunk_len = 1;
        true
    }

    /// Returns a whole kernel run to `Free`, given its head frame.
    ///
    /// # Panics
    ///
    /// Panics if `pfn` is not the head of a `Fixed` run; that is a
    /// kernel bug, not a caller error.
    pub fn free_kernel_run(&self, td: &Thread, pfn: u32) {
        let mut inner = self.inner.lock(td);
        let head = pfn as usize;
        assert!(head < inner.frames.len(), "free_kpages: pfn out of range");
        let run = inner.frames[head].chunk_len as usize;
        assert!(
            inner.frames[head].state == FrameState::Fixed && run > 0,
            "free_kpages: bad or non-head frame {head}"
        );
        for j in 0..run {
            assert_eq!(
                inner.frames[head + j].state,
                FrameState::Fixed,
                "free_kpages: run member {j} not fixed"
            );
            inner.frames[head + j].clear();
        }
    }

    /// Allocates one free frame as a user page owned by `(space, vpn)`.
    pub fn try_alloc_user_frame(
        &self,
        td: &Thread,
        space: &Arc<AddressSpace>,
        vpn: u32,
    ) -> Option<u32> {
        let mut inner = self.inner.lock(td);
        let head = inner.find_run(1)?;
        let frame = &mut inner.frames[head];
        frame.state = FrameState::User;
        frame.chunk_len = 1;
        frame.owner = Arc::downgrade(space);
        frame.owner_vpn = vpn;
        Some(head as u32)
    }

    /// Claims one specific frame as a user page if it is still free.
    pub fn claim_user_frame(
        &self,
        td: &Thread,
        pfn: u32,
        space: &Arc<AddressSpace>,
        vpn: u32,
    ) -> bool {
        let mut inner = self.inner.lock(td);
        let frame = &mut inner.frames[pfn as usize];
        if frame.state != FrameState::Free {
            return false;
        }
        frame.state = FrameState::User;
        frame.chunk_len = 1;
        frame.owner = Arc::downgrade(space);
        frame.owner_vpn = vpn;
        true
    }

    /// Frees a user frame.
    ///
    /// If the frame is mid-eviction this is a no-op: the evictor owns it
    /// and completes the transition.
    ///
    /// # Panics
    ///
    /// Panics if the frame is `Free` or `Fixed` (double free / wrong
    /// allocator).
    pub fn free_user_frame(&self, td: &Thread, pfn: u32) {
        let mut inner = self.inner.lock(td);
        let frame = &mut inner.frames[pfn as usize];
        if frame.state == FrameState::Evicting {
            return;
        }
        assert_eq!(
            frame.state,
            FrameState::User,
            "free_upage: frame {pfn} is not a user page"
        );
        assert_eq!(frame.chunk_len, 1, "free_upage: user frames are single pages");
        frame.clear();
    }

    /// Marks a user frame as being evicted.
    ///
    /// A frame already mid-eviction reports [`KernelError::Busy`]; a
    /// non-user frame reports [`KernelError::Invalid`].
    pub fn mark_evicting(&self, td: &Thread, pfn: u32) -> Result<()> {
        let mut inner = self.inner.lock(td);
        let frame = &mut inner.frames[pfn as usize];
        if frame.state == FrameState::Evicting {
            return Err(KernelError::Busy);
        }
        if frame.state != FrameState::User {
            return Err(KernelError::Invalid);
        }
        frame.state = FrameState::Evicting;
        Ok(())
    }

    /// Rolls an aborted eviction back to `User`. Ownership information is
    /// still in place.
    pub fn unmark_evicting(&self, td: &Thread, pfn: u32) {
        let mut inner = self.inner.lock(td);
        let frame = &mut inner.frames[pfn as usize];
        assert_eq!(
            frame.state,
            FrameState::Evicting,
            "unmark_evicting: frame {pfn} not mid-eviction"
        );
        frame.state = FrameState::User;
    }

    /// Completes an eviction: `Evicting` becomes `Free`.
    pub fn eviction_finished(&self, td: &Thread, pfn: u32) {
        let mut inner = self.inner.lock(td);
        let frame = &mut inner.frames[pfn as usize];
        assert_eq!(
            frame.state,
            FrameState::Evicting,
            "eviction_finished: frame {pfn} not mid-eviction"
        );
        assert_eq!(frame.chunk_len, 1, "user frames are single pages");
        frame.clear();
    }

    /// The owning `(address space, vpn)` of a user or evicting frame.
    pub fn frame_owner(&self, td: &Thread, pfn: u32) -> Option<(Weak<AddressSpace>, u32)> {
        let inner = self.inner.lock(td);
        let frame = &inner.frames[pfn as usize];
        match frame.state {
            FrameState::User | FrameState::Evicting => {
                Some((frame.owner.clone(), frame.owner_vpn))
            }
            _ => None,
        }
    }

    /// Current state of one frame.
    pub fn state_of(&self, td: &Thread, pfn: u32) -> FrameState {
        self.inner.lock(td).frames[pfn as usize].state
    }

    /// Bytes in frames that are not `Free`.
    pub fn used_bytes(&self, td: &Thread) -> usize {
        let inner = self.inner.lock(td);
        inner
            .frames
            .iter()
            .filter(|f| f.state != FrameState::Free)
            .count()
            * PAGE_SIZE
    }

    /// Frame-state counts.
    pub fn stats(&self, td: &Thread) -> CoreMapStats {
        let inner = self.inner.lock(td);
        let mut stats = CoreMapStats {
            free: 0,
            fixed: 0,
            user: 0,
            evicting: 0,
        };
        for f in &inner.frames {
            match f.state {
                FrameState::Free => stats.free += 1,
                FrameState::Fixed => stats.fixed += 1,
                FrameState::User => stats.user += 1,
                FrameState::Evicting => stats.evicting += 1,
            }
        }
        stats
    }

    /// Logs the frame-state summary.
    pub fn log_stats(&self, td: &Thread) {
        let s = self.stats(td);
        log::debug!(
            "coremap: {} total | {} free {} kernel {} user {} evicting",
            self.total,
            s.free,
            s.fixed,
            s.user,
            s.evicting
        );
    }

    /// Where the eviction clock hand points.
    pub fn victim_cursor(&self, td: &Thread) -> usize {
        self.inner.lock(td).victim_cursor
    }

    /// Advances the eviction clock hand.
    pub fn set_victim_cursor(&self, td: &Thread, v: usize) {
        self.inner.lock(td).victim_cursor = v % self.total;
    }
}
