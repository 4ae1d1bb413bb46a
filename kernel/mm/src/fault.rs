//! The VM fault handler and the eviction path it leans on.
//!
//! A fault materializes the touched page: zero-fill on first touch, swap-in
//! for paged-out pages, then a TLB install. Under memory pressure the
//! allocator calls [`evict_page`], which runs the clock scan, writes the
//! victim out, and hands the freed frame back.

use alloc::sync::Arc;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::VirtAddr;

use crate::address_space::{AddressSpace, RegionPerms};
use crate::coremap::FrameState;
use crate::page_table::PteState;
use crate::Vm;

/// What kind of access faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// A read missed the TLB.
    Read,
    /// A write missed the TLB.
    Write,
    /// A write hit a TLB entry without the dirty bit. With no
    /// copy-on-write this is always a protection violation.
    ReadOnly,
}

/// Handles a TLB miss at `vaddr`.
///
/// Rejects kernel addresses and protection violations with `BadAddress`;
/// otherwise finds the governing region (or the heap), materializes the
/// page, and installs a TLB entry that is writable exactly when the page
/// is.
pub fn vm_fault(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    fault: FaultType,
    vaddr: VirtAddr,
) -> Result<()> {
    let page_va = vaddr.page_align_down();
    if !page_va.is_user() {
        return Err(KernelError::BadAddress);
    }
    if fault == FaultType::ReadOnly {
        // No copy-on-write: a write through a read-only mapping is fatal
        // to the process.
        return Err(KernelError::BadAddress);
    }

    // Find who governs this page: a region, or the heap (always
    // writable).
    let region_readonly = match space.region_for(td, page_va) {
        Some(region) => !region.perms.contains(RegionPerms::WRITE),
        None => {
            let (heap_start, heap_end) = space.heap_bounds(td);
            if page_va >= heap_start && page_va < heap_end {
                false
            } else {
                return Err(KernelError::BadAddress);
            }
        }
    };

    let pref = match space.lookup_pte(td, page_va) {
        Some(pref) => pref,
        None => {
            let pref = space.ensure_pte(td, page_va);
            let mut pte = pref.lock(td);
            if pte.state == PteState::Unalloc {
                pte.state = PteState::Zero;
                pte.readonly = region_readonly;
            }
            drop(pte);
            pref
        }
    };

    let mut pte = pref.lock(td);
    // The PTE's own flag wins: prepare_load leaves pages writable during
    // the load regardless of the region.
    let readonly = pte.readonly;

    match pte.state {
        PteState::Ram => {
            pte.referenced = true;
            let pfn = pte.pfn;
            drop(pte);
            vm.tlb().write_random(td, page_va.vpn(), pfn, !readonly);
        }
        PteState::Zero | PteState::Unalloc => {
            // Allocate with the PTE lock released; the allocation can
            // sleep in eviction. Recheck afterwards: a concurrent fault
            // on the same page may have won the race.
            drop(pte);
            let pfn = vm.alloc_upage(td, space, page_va)?;
            vm.ram().zero_frame(pfn);

            let mut pte = pref.lock(td);
            match pte.state {
                PteState::Zero | PteState::Unalloc => {
                    pte.state = PteState::Ram;
                    pte.pfn = pfn;
                    pte.referenced = true;
                    let readonly = pte.readonly;
                    drop(pte);
                    vm.tlb().write_random(td, page_va.vpn(), pfn, !readonly);
                }
                PteState::Ram => {
                    // Lost the race; the other faulter's frame stands.
                    let winner = pte.pfn;
                    pte.referenced = true;
                    let readonly = pte.readonly;
                    drop(pte);
                    vm.free_upage(td, pfn);
                    vm.tlb().write_random(td, page_va.vpn(), winner, !readonly);
                }
                PteState::Swap => {
                    // Materialized and already evicted again while we
                    // allocated. Give the frame back and retry.
                    drop(pte);
                    vm.free_upage(td, pfn);
                    return vm_fault(vm, td, space, fault, vaddr);
                }
            }
        }
        PteState::Swap => {
            // Bring the page back in. The PTE lock is held across the
            // transfer so the slot cannot be reused under us.
            let slot = pte.swap_slot;
            let pfn = vm.alloc_upage(td, space, page_va)?;
            if let Err(e) = vm.swap().swap_in(vm.ram(), td, pfn, slot) {
                vm.free_upage(td, pfn);
                return Err(e);
            }
            vm.swap().free_slot(td, slot);
            pte.state = PteState::Ram;
            pte.pfn = pfn;
            pte.swap_slot = 0;
            pte.referenced = true;
            let readonly = pte.readonly;
            drop(pte);
            vm.tlb().write_random(td, page_va.vpn(), pfn, !readonly);
        }
    }

    Ok(())
}

/// Clock (second-chance) victim selection.
///
/// The first sweep skips referenced pages, clearing their bits; the
/// second takes any user frame. The coremap spinlock is dropped around
/// the PTE lock attempt, and contended PTEs are skipped outright so two
/// evictors can never deadlock on each other's pages.
fn find_victim(vm: &Vm, td: &Thread) -> Result<u32> {
    let total = vm.coremap().total_frames();
    let start = vm.coremap().victim_cursor(td);

    for pass in 0..2 {
        for i in 0..total {
            let pfn = ((start + i) % total) as u32;

            if pass == 1 {
                // Second pass: any user frame will do.
                if vm.coremap().state_of(td, pfn) == FrameState::User {
                    vm.coremap().set_victim_cursor(td, pfn as usize + 1);
                    return Ok(pfn);
                }
                continue;
            }

            let Some((owner, vpn)) = vm.coremap().frame_owner(td, pfn) else {
                continue;
            };
            if vm.coremap().state_of(td, pfn) != FrameState::User {
                continue;
            }
            let Some(space) = owner.upgrade() else {
                continue;
            };
            let Some(pref) = space.lookup_pte(td, VirtAddr::from_vpn(vpn)) else {
                continue;
            };
            let Some(mut pte) = pref.try_lock(td) else {
                continue;
            };
            if !pte.referenced {
                vm.coremap().set_victim_cursor(td, pfn as usize + 1);
                return Ok(pfn);
            }
            pte.referenced = false;
        }
    }
    Err(KernelError::OutOfMemory)
}

/// Evicts one user page to swap and returns the freed frame index.
///
/// The sequence per victim: mark the frame `Evicting` (anyone freeing it
/// meanwhile defers to us), revalidate the owning PTE, write the page to
/// a fresh swap slot, invalidate the TLB entry, flip the PTE to `Swap`,
/// and release the frame. Any mismatch after the mark -- the owner was
/// torn down, or the PTE is locked by a faulting thread -- rolls back or
/// reclaims and moves on to another victim.
pub(crate) fn evict_page(vm: &Vm, td: &Thread) -> Result<u32> {
    loop {
        let victim = find_victim(vm, td)?;

        match vm.coremap().mark_evicting(td, victim) {
            Ok(()) => {}
            Err(KernelError::Busy) | Err(KernelError::Invalid) => continue,
            Err(e) => return Err(e),
        }

        let Some((owner, vpn)) = vm.coremap().frame_owner(td, victim) else {
            // Ownership vanished between the scan and the mark; the frame
            // is ours to reclaim.
            vm.coremap().eviction_finished(td, victim);
            return Ok(victim);
        };
        let Some(space) = owner.upgrade() else {
            vm.coremap().eviction_finished(td, victim);
            return Ok(victim);
        };

        let va = VirtAddr::from_vpn(vpn);
        let Some(pref) = space.lookup_pte(td, va) else {
            vm.coremap().eviction_finished(td, victim);
            return Ok(victim);
        };
        let Some(mut pte) = pref.try_lock(td) else {
            // A faulting thread owns the PTE; trying to wait for it could
            // deadlock (it may itself be evicting). Pick another victim.
            vm.coremap().unmark_evicting(td, victim);
            continue;
        };

        if pte.state != PteState::Ram || pte.pfn != victim {
            // The mapping moved on (e.g. the space freed the page; the
            // free deferred to us). The frame holds no live data.
            drop(pte);
            vm.coremap().eviction_finished(td, victim);
            return Ok(victim);
        }

        let slot = match vm.swap().alloc_slot(td) {
            Ok(slot) => slot,
            Err(e) => {
                drop(pte);
                vm.coremap().unmark_evicting(td, victim);
                return Err(e);
            }
        };
        if let Err(e) = vm.swap().swap_out(vm.ram(), td, victim, slot) {
            vm.swap().free_slot(td, slot);
            drop(pte);
            vm.coremap().unmark_evicting(td, victim);
            return Err(e);
        }

        vm.tlb().invalidate(td, vpn);

        pte.state = PteState::Swap;
        pte.swap_slot = slot;
        pte.pfn = 0;
        drop(pte);

        vm.coremap().eviction_finished(td, victim);
        log::debug!("evict: pfn {victim} (vpn {vpn:#x}) -> slot {slot}");
        return Ok(victim);
    }
}
