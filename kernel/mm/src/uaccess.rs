//! Kernel access to user memory.
//!
//! `copyin`/`copyout`/`copyinstr` walk the page tables directly, faulting
//! pages in as needed and copying frame bytes while the PTE lock is held
//! so an eviction cannot pull the frame mid-transfer. `user_load` /
//! `user_store` instead model what a user instruction does: consult the
//! TLB, fault on a miss, retry.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::{PAGE_SIZE, VirtAddr};
use pion_machine::tlb::TlbFlags;

use crate::address_space::AddressSpace;
use crate::fault::{vm_fault, FaultType};
use crate::page_table::PteState;
use crate::Vm;

/// Checks that `[base, base + len)` lies entirely in user space.
fn check_user_range(base: VirtAddr, len: usize) -> Result<()> {
    let end = base.as_u32() as u64 + len as u64;
    if end > pion_machine::addr::KSEG0 as u64 {
        return Err(KernelError::BadAddress);
    }
    Ok(())
}

/// Runs `f` with the page containing `va` resident, under its PTE lock.
/// `f` receives the frame's PFN.
fn with_resident_page<R>(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    va: VirtAddr,
    write: bool,
    f: impl FnOnce(u32) -> R,
) -> Result<R> {
    let page = va.page_align_down();
    loop {
        if let Some(pref) = space.lookup_pte(td, page) {
            let mut pte = pref.lock(td);
            if pte.state == PteState::Ram {
                if write && pte.readonly {
                    return Err(KernelError::BadAddress);
                }
                pte.referenced = true;
                if write {
                    pte.dirty = true;
                }
                let pfn = pte.pfn;
                // f runs under the PTE lock: eviction is held off.
                return Ok(f(pfn));
            }
        }
        let fault = if write {
            FaultType::Write
        } else {
            FaultType::Read
        };
        vm_fault(vm, td, space, fault, page)?;
    }
}

/// Copies kernel bytes out to user space.
pub fn copyout(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    src: &[u8],
    dst: VirtAddr,
) -> Result<()> {
    check_user_range(dst, src.len())?;
    let mut done = 0;
    while done < src.len() {
        let va = dst + done as u32;
        let in_page = PAGE_SIZE - va.page_offset();
        let chunk = in_page.min(src.len() - done);
        with_resident_page(vm, td, space, va, true, |pfn| {
            vm.ram()
                .write(pfn, va.page_offset(), &src[done..done + chunk]);
        })?;
        done += chunk;
    }
    Ok(())
}

/// Copies user bytes into a kernel buffer.
pub fn copyin(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    src: VirtAddr,
    dst: &mut [u8],
) -> Result<()> {
    check_user_range(src, dst.len())?;
    let mut done = 0;
    while done < dst.len() {
        let va = src + done as u32;
        let in_page = PAGE_SIZE - va.page_offset();
        let chunk = in_page.min(dst.len() - done);
        with_resident_page(vm, td, space, va, false, |pfn| {
            vm.ram()
                .read(pfn, va.page_offset(), &mut dst[done..done + chunk]);
        })?;
        done += chunk;
    }
    Ok(())
}

/// Copies a NUL-terminated user string, rejecting strings longer than
/// `maxlen` bytes (terminator included) with `ArgTooLong` and non-UTF-8
/// contents with `Invalid`.
pub fn copyinstr(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    src: VirtAddr,
    maxlen: usize,
) -> Result<String> {
    let mut collected: Vec<u8> = Vec::new();
    let mut pos = 0usize;
    'outer: while pos < maxlen {
        let va = src + pos as u32;
        check_user_range(va, 1)?;
        let in_page = (PAGE_SIZE - va.page_offset()).min(maxlen - pos);
        let mut chunk = vec![0u8; in_page];
        with_resident_page(vm, td, space, va, false, |pfn| {
            vm.ram().read(pfn, va.page_offset(), &mut chunk);
        })?;
        for &b in &chunk {
            if b == 0 {
                break 'outer;
            }
            collected.push(b);
            pos += 1;
        }
        if pos == maxlen {
            return Err(KernelError::ArgTooLong);
        }
    }
    if pos >= maxlen {
        return Err(KernelError::ArgTooLong);
    }
    String::from_utf8(collected).map_err(|_| KernelError::Invalid)
}

/// Copies a 32-bit word in from user space. The address must be aligned.
pub fn copyin_word(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    src: VirtAddr,
) -> Result<u32> {
    if src.as_u32() % 4 != 0 {
        return Err(KernelError::BadAddress);
    }
    let mut buf = [0u8; 4];
    copyin(vm, td, space, src, &mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

/// Copies a 32-bit word out to user space. The address must be aligned.
pub fn copyout_word(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    val: u32,
    dst: VirtAddr,
) -> Result<()> {
    if dst.as_u32() % 4 != 0 {
        return Err(KernelError::BadAddress);
    }
    copyout(vm, td, space, &val.to_le_bytes(), dst)
}

/// A user-mode load of one byte: TLB lookup, fault on miss, retry.
pub fn user_load(vm: &Vm, td: &Thread, space: &Arc<AddressSpace>, va: VirtAddr) -> Result<u8> {
    check_user_range(va, 1)?;
    loop {
        if let Some((pfn, _)) = vm.tlb().probe(td, va.vpn()) {
            let mut b = [0u8];
            vm.ram().read(pfn, va.page_offset(), &mut b);
            return Ok(b[0]);
        }
        vm_fault(vm, td, space, FaultType::Read, va)?;
    }
}

/// A user-mode store of one byte. A TLB hit without the dirty bit raises
/// a read-only fault, which is fatal to the access.
pub fn user_store(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    va: VirtAddr,
    byte: u8,
) -> Result<()> {
    check_user_range(va, 1)?;
    loop {
        match vm.tlb().probe(td, va.vpn()) {
            Some((pfn, flags)) => {
                if !flags.contains(TlbFlags::DIRTY) {
                    vm_fault(vm, td, space, FaultType::ReadOnly, va)?;
                    continue;
                }
                vm.ram().write(pfn, va.page_offset(), &[byte]);
                return Ok(());
            }
            None => vm_fault(vm, td, space, FaultType::Write, va)?,
        }
    }
}
