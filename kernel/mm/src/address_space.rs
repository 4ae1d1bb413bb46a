//! Per-process address spaces.
//!
//! An address space owns the two-level page table, the region list, and
//! the heap bounds, all guarded by one spinlock. The page-table levels
//! are allocated lazily, outside the spinlock, with a double-checked
//! install so a racing thread's allocation is simply discarded.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use pion_core::id::AsId;
use pion_core::sync::SpinLock;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::{PAGE_SIZE, USERSTACK, VirtAddr};
use pion_machine::tlb::Tlb;

use crate::page_table::{self, L1Table, L2Page, PT_L2_SIZE, Pte, PteRef, PteState};
use crate::Vm;

/// Pages in the user stack region. Sized to fit a full `ARG_MAX` argument
/// block with room to run.
pub const STACK_PAGES: usize = 18;

bitflags! {
    /// Permission flags of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionPerms: u8 {
        /// Readable.
        const READ = 0b001;
        /// Writable.
        const WRITE = 0b010;
        /// Executable.
        const EXEC = 0b100;
    }
}

/// A contiguous virtual range with uniform permissions.
#[derive(Debug, Clone)]
pub struct Region {
    /// Page-aligned base address.
    pub base: VirtAddr,
    /// Length in pages.
    pub npages: usize,
    /// Permission flags.
    pub perms: RegionPerms,
}

impl Region {
    /// One past the last byte, as a u64 to survive a region ending at the
    /// top of user space.
    fn end(&self) -> u64 {
        self.base.as_u32() as u64 + (self.npages * PAGE_SIZE) as u64
    }

    /// Whether `va` falls inside the region.
    pub fn contains(&self, va: VirtAddr) -> bool {
        va >= self.base && (va.as_u32() as u64) < self.end()
    }

    fn overlaps(&self, other: &Region) -> bool {
        (self.base.as_u32() as u64) < other.end() && (other.base.as_u32() as u64) < self.end()
    }
}

struct AsInner {
    l1: Option<L1Table>,
    regions: Vec<Region>,
    heap_start: VirtAddr,
    heap_end: VirtAddr,
}

/// A user address space.
pub struct AddressSpace {
    id: AsId,
    inner: SpinLock<AsInner>,
}

impl AddressSpace {
    /// Creates an empty address space: no regions, no page table, heap
    /// unset until the first region is defined.
    pub fn create() -> Arc<Self> {
        Arc::new(Self {
            id: AsId::alloc(),
            inner: SpinLock::new(AsInner {
                l1: None,
                regions: Vec::new(),
                heap_start: VirtAddr::zero(),
                heap_end: VirtAddr::zero(),
            }),
        })
    }

    /// This space's id, for diagnostics.
    pub fn id(&self) -> AsId {
        self.id
    }

    // ------------------------------------------------------------------
    // Page-table access
    // ------------------------------------------------------------------

    /// Returns the PTE for `va` if both table levels exist.
    pub fn lookup_pte(&self, td: &Thread, va: VirtAddr) -> Option<PteRef> {
        let inner = self.inner.lock(td);
        let l1 = inner.l1.as_ref()?;
        let l2 = l1[page_table::l1_index(va)].as_ref()?;
        Some(PteRef::new(Arc::clone(l2), page_table::l2_index(va)))
    }

    /// Returns the PTE for `va`, lazily allocating either table level.
    ///
    /// Allocation happens without the address-space spinlock held (it may
    /// sleep); after allocating, the lock is retaken and the slot is
    /// rechecked so at most one installation wins. The loser's allocation
    /// is dropped.
    pub fn ensure_pte(&self, td: &Thread, va: VirtAddr) -> PteRef {
        let l1i = page_table::l1_index(va);
        loop {
            {
                let inner = self.inner.lock(td);
                if let Some(l1) = &inner.l1 {
                    if let Some(l2) = &l1[l1i] {
                        return PteRef::new(Arc::clone(l2), page_table::l2_index(va));
                    }
                }
            }

            let need_l1 = self.inner.lock(td).l1.is_none();
            if need_l1 {
                let fresh = page_table::new_l1();
                let mut inner = self.inner.lock(td);
                if inner.l1.is_none() {
                    inner.l1 = Some(fresh);
                }
            }

            let fresh = L2Page::new();
            let mut inner = self.inner.lock(td);
            if let Some(l1) = inner.l1.as_mut() {
                if l1[l1i].is_none() {
                    l1[l1i] = Some(fresh);
                }
            }
            // Retry the fast path to pick up whichever page won.
        }
    }

    /// Every installed L2 page with its L1 index, snapshotted under the
    /// spinlock. The `Arc`s keep the pages valid after release.
    pub(crate) fn l1_snapshot(&self, td: &Thread) -> Vec<(usize, Arc<L2Page>)> {
        let inner = self.inner.lock(td);
        match &inner.l1 {
            None => Vec::new(),
            Some(l1) => l1
                .iter()
                .enumerate()
                .filter_map(|(i, slot)| slot.as_ref().map(|p| (i, Arc::clone(p))))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Regions and heap
    // ------------------------------------------------------------------

    /// Defines a region of `size` bytes at `vaddr` (both are rounded out
    /// to page boundaries). Regions may not overlap. The heap is placed
    /// just past the highest region defined so far.
    pub fn define_region(
        &self,
        td: &Thread,
        vaddr: VirtAddr,
        size: usize,
        perms: RegionPerms,
    ) -> Result<()> {
        let base = vaddr.page_align_down();
        let size = size + vaddr.page_offset();
        let npages = size.div_ceil(PAGE_SIZE);
        let region = Region {
            base,
            npages,
            perms,
        };
        if region.end() > USERSTACK as u64 {
            return Err(KernelError::Invalid);
        }

        let mut inner = self.inner.lock(td);
        if inner.regions.iter().any(|r| r.overlaps(&region)) {
            return Err(KernelError::Invalid);
        }

        let region_end = region.end() as u32;
        inner.regions.push(region);
        if inner.heap_start == VirtAddr::zero() || region_end > inner.heap_start.as_u32() {
            inner.heap_start = VirtAddr::new(region_end);
            inner.heap_end = inner.heap_start;
        }
        Ok(())
    }

    /// Defines the fixed-size stack region ending at the user-stack top
    /// and returns the initial stack pointer. Heap bounds are preserved:
    /// the stack sits above the heap limit and must not move the break.
    pub fn define_stack(&self, td: &Thread) -> Result<VirtAddr> {
        let (old_start, old_end) = self.heap_bounds(td);

        self.define_region(
            td,
            VirtAddr::new(USERSTACK - (STACK_PAGES * PAGE_SIZE) as u32),
            STACK_PAGES * PAGE_SIZE,
            RegionPerms::READ | RegionPerms::WRITE,
        )?;

        let mut inner = self.inner.lock(td);
        inner.heap_start = old_start;
        inner.heap_end = old_end;
        Ok(VirtAddr::new(USERSTACK))
    }

    /// The region containing `va`, if any.
    pub fn region_for(&self, td: &Thread, va: VirtAddr) -> Option<Region> {
        let inner = self.inner.lock(td);
        inner.regions.iter().find(|r| r.contains(va)).cloned()
    }

    /// Current `(heap_start, heap_end)`.
    pub fn heap_bounds(&self, td: &Thread) -> (VirtAddr, VirtAddr) {
        let inner = self.inner.lock(td);
        (inner.heap_start, inner.heap_end)
    }

    /// Makes this space current: with no per-space TLB tags, that means
    /// flushing the whole TLB.
    pub fn activate(&self, td: &Thread, tlb: &Tlb) {
        tlb.flush_all(td);
    }

    /// Marks every region page `Zero` and temporarily writable so the
    /// loader can fill it; [`complete_load`](Self::complete_load) restores
    /// the real permissions afterwards.
    pub fn prepare_load(&self, td: &Thread) -> Result<()> {
        for region in self.regions_snapshot(td) {
            let mut va = region.base;
            for _ in 0..region.npages {
                let pref = self.ensure_pte(td, va);
                let mut pte = pref.lock(td);
                assert!(
                    matches!(pte.state, PteState::Unalloc | PteState::Zero),
                    "prepare_load on a materialized page"
                );
                pte.state = PteState::Zero;
                pte.readonly = false;
                drop(pte);
                va = va + PAGE_SIZE as u32;
            }
        }
        Ok(())
    }

    /// Restores per-region write permissions after the loader ran.
    pub fn complete_load(&self, td: &Thread) -> Result<()> {
        for region in self.regions_snapshot(td) {
            let readonly = !region.perms.contains(RegionPerms::WRITE);
            let mut va = region.base;
            for _ in 0..region.npages {
                if let Some(pref) = self.lookup_pte(td, va) {
                    let mut pte = pref.lock(td);
                    pte.readonly = readonly;
                }
                va = va + PAGE_SIZE as u32;
            }
        }
        Ok(())
    }

    fn regions_snapshot(&self, td: &Thread) -> Vec<Region> {
        self.inner.lock(td).regions.clone()
    }

    // ------------------------------------------------------------------
    // sbrk
    // ------------------------------------------------------------------

    /// Moves the program break by `amount` bytes and returns the old
    /// break.
    ///
    /// Growth is capped below the stack region. Shrinking returns the
    /// whole pages in `[round_up(new_break), round_down(old_break))` to
    /// the coremap -- a partially used last page survives -- releasing
    /// swap slots of paged-out pages and invalidating TLB entries.
    pub fn sbrk(&self, td: &Thread, vm: &Vm, amount: i32) -> Result<VirtAddr> {
        let mut inner = self.inner.lock(td);
        let old_break = inner.heap_end;

        if amount == 0 {
            return Ok(old_break);
        }

        if amount > 0 {
            let new_break = old_break
                .as_u32()
                .checked_add(amount as u32)
                .ok_or(KernelError::OutOfMemory)?;
            let heap_limit = USERSTACK - (STACK_PAGES * PAGE_SIZE) as u32;
            if new_break > heap_limit {
                return Err(KernelError::OutOfMemory);
            }
            inner.heap_end = VirtAddr::new(new_break);
            return Ok(old_break);
        }

        let dec = amount.unsigned_abs();
        if old_break.as_u32() < dec {
            return Err(KernelError::Invalid);
        }
        let new_break = VirtAddr::new(old_break.as_u32() - dec);
        if new_break < inner.heap_start {
            return Err(KernelError::Invalid);
        }
        inner.heap_end = new_break;
        // PTE locks sleep; the spinlock cannot be held across them.
        drop(inner);

        let free_start = new_break.page_align_up();
        let free_end = old_break.page_align_down();
        let mut va = free_start;
        while va < free_end {
            if let Some(pref) = self.lookup_pte(td, va) {
                let mut pte = pref.lock(td);
                match pte.state {
                    PteState::Ram => {
                        vm.free_upage(td, pte.pfn);
                        vm.tlb().invalidate(td, va.vpn());
                    }
                    PteState::Swap => {
                        vm.swap().free_slot(td, pte.swap_slot);
                    }
                    PteState::Unalloc | PteState::Zero => {}
                }
                *pte = Pte::UNALLOC;
            }
            va = va + PAGE_SIZE as u32;
        }
        Ok(old_break)
    }

    // ------------------------------------------------------------------
    // Copy and teardown
    // ------------------------------------------------------------------

    /// Deep copy for `fork`: regions and heap bounds are duplicated, and
    /// every materialized page is reproduced in the child -- resident
    /// pages through a frame-to-frame copy, swapped pages through a fresh
    /// slot via a borrowed frame. Any failure tears the partial child
    /// down and reports the underlying error.
    pub fn copy(self: &Arc<Self>, td: &Thread, vm: &Vm) -> Result<Arc<AddressSpace>> {
        let child = AddressSpace::create();
        {
            let src = self.inner.lock(td);
            let regions = src.regions.clone();
            let (hs, he) = (src.heap_start, src.heap_end);
            drop(src);
            let mut dst = child.inner.lock(td);
            dst.regions = regions;
            dst.heap_start = hs;
            dst.heap_end = he;
        }

        for (l1i, l2) in self.l1_snapshot(td) {
            for l2i in 0..PT_L2_SIZE {
                let va = VirtAddr::from_vpn(((l1i << 10) | l2i) as u32);
                let src_ref = PteRef::new(Arc::clone(&l2), l2i);
                if let Err(e) = Self::copy_one(vm, td, &child, &src_ref, va) {
                    child.destroy(td, vm);
                    return Err(e);
                }
            }
        }
        log::debug!("as {:?}: copied into {:?}", self.id, child.id);
        Ok(child)
    }

    fn copy_one(
        vm: &Vm,
        td: &Thread,
        child: &Arc<AddressSpace>,
        src_ref: &PteRef,
        va: VirtAddr,
    ) -> Result<()> {
        let src = src_ref.lock(td);
        match src.state {
            PteState::Unalloc => Ok(()),
            PteState::Zero => {
                let dst_ref = child.ensure_pte(td, va);
                let mut dst = dst_ref.lock(td);
                dst.state = PteState::Zero;
                dst.readonly = src.readonly;
                Ok(())
            }
            PteState::Ram => {
                let pfn = vm.alloc_upage(td, child, va)?;
                vm.ram().copy_frame(pfn, src.pfn);
                let dst_ref = child.ensure_pte(td, va);
                let mut dst = dst_ref.lock(td);
                dst.state = PteState::Ram;
                dst.pfn = pfn;
                dst.readonly = src.readonly;
                dst.dirty = src.dirty;
                dst.referenced = src.referenced;
                Ok(())
            }
            PteState::Swap => {
                let new_slot = vm.swap().alloc_slot(td)?;
                let temp = match vm.alloc_upage(td, child, va) {
                    Ok(p) => p,
                    Err(e) => {
                        vm.swap().free_slot(td, new_slot);
                        return Err(e);
                    }
                };
                let moved = vm
                    .swap()
                    .swap_in(vm.ram(), td, temp, src.swap_slot)
                    .and_then(|()| vm.swap().swap_out(vm.ram(), td, temp, new_slot));
                vm.free_upage(td, temp);
                if let Err(e) = moved {
                    vm.swap().free_slot(td, new_slot);
                    return Err(e);
                }
                let dst_ref = child.ensure_pte(td, va);
                let mut dst = dst_ref.lock(td);
                dst.state = PteState::Swap;
                dst.swap_slot = new_slot;
                dst.readonly = src.readonly;
                dst.dirty = src.dirty;
                Ok(())
            }
        }
    }

    /// Releases every frame and swap slot this space holds and resets it
    /// to empty. Called at `_exit` and on `exec` teardown.
    pub fn destroy(&self, td: &Thread, vm: &Vm) {
        for (_, l2) in self.l1_snapshot(td) {
            for l2i in 0..PT_L2_SIZE {
                let mut pte = l2.entry(l2i).acquire(td);
                match pte.state {
                    PteState::Ram => vm.free_upage(td, pte.pfn),
                    PteState::Swap => vm.swap().free_slot(td, pte.swap_slot),
                    PteState::Unalloc | PteState::Zero => {}
                }
                *pte = Pte::UNALLOC;
            }
        }
        let mut inner = self.inner.lock(td);
        inner.l1 = None;
        inner.regions.clear();
        inner.heap_start = VirtAddr::zero();
        inner.heap_end = VirtAddr::zero();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn define_region_sets_heap() {
        let td = Thread::new("t");
        let space = AddressSpace::create();
        space
            .define_region(
                &td,
                VirtAddr::new(0x40_0000),
                2 * PAGE_SIZE,
                RegionPerms::READ | RegionPerms::EXEC,
            )
            .unwrap();
        let (hs, he) = space.heap_bounds(&td);
        assert_eq!(hs, VirtAddr::new(0x40_2000));
        assert_eq!(hs, he);
    }

    #[test]
    fn regions_must_not_overlap() {
        let td = Thread::new("t");
        let space = AddressSpace::create();
        space
            .define_region(&td, VirtAddr::new(0x1000), PAGE_SIZE * 4, RegionPerms::READ)
            .unwrap();
        assert_eq!(
            space.define_region(&td, VirtAddr::new(0x3000), PAGE_SIZE, RegionPerms::READ),
            Err(KernelError::Invalid)
        );
        // Adjacent is fine.
        space
            .define_region(&td, VirtAddr::new(0x5000), PAGE_SIZE, RegionPerms::READ)
            .unwrap();
    }

    #[test]
    fn unaligned_region_is_rounded_out() {
        let td = Thread::new("t");
        let space = AddressSpace::create();
        space
            .define_region(&td, VirtAddr::new(0x1080), 0x20, RegionPerms::READ)
            .unwrap();
        let r = space.region_for(&td, VirtAddr::new(0x1000)).unwrap();
        assert_eq!(r.base, VirtAddr::new(0x1000));
        assert_eq!(r.npages, 1);
    }

    #[test]
    fn define_stack_preserves_heap() {
        let td = Thread::new("t");
        let space = AddressSpace::create();
        space
            .define_region(&td, VirtAddr::new(0x40_0000), PAGE_SIZE, RegionPerms::READ)
            .unwrap();
        let (hs, he) = space.heap_bounds(&td);
        let sp = space.define_stack(&td).unwrap();
        assert_eq!(sp, VirtAddr::new(USERSTACK));
        assert_eq!(space.heap_bounds(&td), (hs, he));
        // The stack region itself is in place.
        let in_stack = VirtAddr::new(USERSTACK - PAGE_SIZE as u32);
        assert!(space.region_for(&td, in_stack).is_some());
    }

    #[test]
    fn ensure_pte_installs_levels_once() {
        let td = Thread::new("t");
        let space = AddressSpace::create();
        let va = VirtAddr::new(0x40_0000);
        assert!(space.lookup_pte(&td, va).is_none());
        let a = space.ensure_pte(&td, va);
        let b = space.ensure_pte(&td, va);
        {
            let mut pte = a.lock(&td);
            pte.state = PteState::Zero;
        }
        // Same entry through both handles.
        assert_eq!(b.lock(&td).state, PteState::Zero);
        assert!(space.lookup_pte(&td, va).is_some());
    }

    #[test]
    fn prepare_then_complete_load_toggles_readonly() {
        let td = Thread::new("t");
        let space = AddressSpace::create();
        let base = VirtAddr::new(0x40_0000);
        space
            .define_region(&td, base, PAGE_SIZE, RegionPerms::READ | RegionPerms::EXEC)
            .unwrap();
        space.prepare_load(&td).unwrap();
        {
            let pref = space.lookup_pte(&td, base).unwrap();
            let pte = pref.lock(&td);
            assert_eq!(pte.state, PteState::Zero);
            assert!(!pte.readonly, "pages are writable during load");
        }
        space.complete_load(&td).unwrap();
        {
            let pref = space.lookup_pte(&td, base).unwrap();
            assert!(pref.lock(&td).readonly, "read-only restored after load");
        }
    }
}
