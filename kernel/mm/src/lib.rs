//! Virtual memory: the coremap frame allocator, the swap map, two-level
//! page tables, address spaces, and the demand-paging fault handler.
//!
//! [`Vm`] bundles the machine's RAM and TLB with the coremap and swap map;
//! it is created once at boot and passed by reference. Address spaces are
//! per-process and reference the shared `Vm` explicitly.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod address_space;
pub mod coremap;
pub mod fault;
pub mod page_table;
pub mod swap;
pub mod uaccess;

use alloc::sync::Arc;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_fs::vnode::Vnode;
use pion_machine::addr::VirtAddr;
use pion_machine::ram::Ram;
use pion_machine::tlb::Tlb;

use address_space::AddressSpace;
use coremap::CoreMap;
use swap::SwapMap;

pub use address_space::{Region, RegionPerms, STACK_PAGES};
pub use coremap::FrameState;
pub use fault::FaultType;
pub use page_table::{Pte, PteState};

/// The virtual-memory context: RAM, TLB, coremap, and swap.
pub struct Vm {
    ram: Ram,
    tlb: Tlb,
    coremap: CoreMap,
    swap: SwapMap,
}

impl Vm {
    /// Boot-time construction. The first `kernel_frames` frames model the
    /// kernel image plus the coremap itself and start out `Fixed`;
    /// everything above them is `Free`. The swap map sizes itself from
    /// the raw device.
    pub fn bootstrap(
        td: &Thread,
        ram_pages: usize,
        kernel_frames: usize,
        swap_device: Arc<dyn Vnode>,
    ) -> Result<Self> {
        assert!(kernel_frames < ram_pages, "no free frames after the kernel");
        let vm = Self {
            ram: Ram::new(ram_pages),
            tlb: Tlb::new(),
            coremap: CoreMap::new(ram_pages, kernel_frames),
            swap: SwapMap::new(td, swap_device)?,
        };
        log::info!(
            "vm: {} of {} pages free, {} swap slots",
            ram_pages - kernel_frames,
            ram_pages,
            vm.swap.slots()
        );
        Ok(vm)
    }

    /// The machine's physical memory.
    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    /// The machine's TLB.
    pub fn tlb(&self) -> &Tlb {
        &self.tlb
    }

    /// The frame allocator.
    pub fn coremap(&self) -> &CoreMap {
        &self.coremap
    }

    /// The swap map.
    pub fn swap(&self) -> &SwapMap {
        &self.swap
    }

    /// Allocates `npages` contiguous kernel frames and returns the
    /// kseg0 address of the run.
    ///
    /// Single-page requests fall back to eviction under memory pressure;
    /// multi-page requests never evict (eviction frees one frame at a
    /// time, which cannot make a contiguous run).
    pub fn alloc_kpages(&self, td: &Thread, npages: usize) -> Result<VirtAddr> {
        assert!(npages > 0, "alloc_kpages of zero pages");
        td.assert_can_sleep();

        if let Some(pfn) = self.coremap.try_alloc_kernel_run(td, npages) {
            return Ok(pion_machine::addr::PhysAddr::from_pfn(pfn).to_kvaddr());
        }
        if npages > 1 {
            return Err(KernelError::OutOfMemory);
        }

        loop {
            let freed = fault::evict_page(self, td)?;
            if self.coremap.claim_kernel_frame(td, freed) {
                return Ok(pion_machine::addr::PhysAddr::from_pfn(freed).to_kvaddr());
            }
            // Someone else grabbed the freed frame; take any other.
            if let Some(pfn) = self.coremap.try_alloc_kernel_run(td, 1) {
                return Ok(pion_machine::addr::PhysAddr::from_pfn(pfn).to_kvaddr());
            }
        }
    }

    /// Returns a kernel run to the coremap. `kvaddr` must be the base
    /// address returned by [`alloc_kpages`](Self::alloc_kpages).
    pub fn free_kpages(&self, td: &Thread, kvaddr: VirtAddr) {
        let pfn = kvaddr.to_paddr().pfn();
        self.coremap.free_kernel_run(td, pfn);
    }

    /// Allocates one user frame owned by `(space, vaddr)`. Falls back to
    /// eviction under memory pressure.
    pub fn alloc_upage(
        &self,
        td: &Thread,
        space: &Arc<AddressSpace>,
        vaddr: VirtAddr,
    ) -> Result<u32> {
        td.assert_can_sleep();
        let vpn = vaddr.vpn();

        if let Some(pfn) = self.coremap.try_alloc_user_frame(td, space, vpn) {
            return Ok(pfn);
        }
        loop {
            let freed = fault::evict_page(self, td)?;
            if self.coremap.claim_user_frame(td, freed, space, vpn) {
                return Ok(freed);
            }
            if let Some(pfn) = self.coremap.try_alloc_user_frame(td, space, vpn) {
                return Ok(pfn);
            }
        }
    }

    /// Frees a user frame. A frame mid-eviction is left to the evictor.
    pub fn free_upage(&self, td: &Thread, pfn: u32) {
        self.coremap.free_user_frame(td, pfn);
    }

    /// Bytes of RAM not currently `Free`.
    pub fn coremap_used_bytes(&self, td: &Thread) -> usize {
        self.coremap.used_bytes(td)
    }
}
