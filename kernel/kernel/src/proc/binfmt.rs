//! Executable images.
//!
//! The ELF loader proper is an external collaborator; the kernel-side
//! seam is [`load_image`], which reads a program image from a vnode into
//! a fresh address space and returns the entry point. The image format
//! here is a flat segment table ("PIF"), which is what the build system
//! packs user programs into:
//!
//! ```text
//! magic "PIF0" | entry u32 | nsegs u32
//! per segment: vaddr u32 | file_off u32 | file_sz u32 | mem_sz u32 | flags u32
//! segment bytes at their file offsets
//! ```
//!
//! All words are little-endian. Segment flags use the region permission
//! bits (1 = read, 2 = write, 4 = execute).

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_fs::vnode::Vnode;
use pion_machine::addr::VirtAddr;
use pion_mm::address_space::{AddressSpace, RegionPerms};
use pion_mm::{uaccess, Vm};

const MAGIC: &[u8; 4] = b"PIF0";
const HEADER_LEN: usize = 12;
const SEG_DESC_LEN: usize = 20;

/// One segment of a program image.
#[derive(Debug, Clone, Copy)]
struct Segment {
    vaddr: u32,
    file_off: u32,
    file_sz: u32,
    mem_sz: u32,
    flags: u32,
}

fn read_exact(td: &Thread, vnode: &Arc<dyn Vnode>, buf: &mut [u8], off: u64) -> Result<()> {
    let n = vnode.read_at(td, buf, off)?;
    if n != buf.len() {
        return Err(KernelError::Invalid);
    }
    Ok(())
}

fn word(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Loads the image in `vnode` into `space` and returns the entry point.
///
/// Defines one region per segment, zero-fills everything via
/// `prepare_load`, copies the file bytes in through the normal
/// demand-paging path, and restores permissions with `complete_load`.
pub fn load_image(
    vm: &Vm,
    td: &Thread,
    space: &Arc<AddressSpace>,
    vnode: &Arc<dyn Vnode>,
) -> Result<VirtAddr> {
    let mut header = [0u8; HEADER_LEN];
    read_exact(td, vnode, &mut header, 0)?;
    if &header[0..4] != MAGIC {
        return Err(KernelError::Invalid);
    }
    let entry = word(&header, 4);
    let nsegs = word(&header, 8) as usize;
    if nsegs == 0 || nsegs > 16 {
        return Err(KernelError::Invalid);
    }

    let mut descs = vec![0u8; nsegs * SEG_DESC_LEN];
    read_exact(td, vnode, &mut descs, HEADER_LEN as u64)?;
    let segments: Vec<Segment> = (0..nsegs)
        .map(|i| {
            let at = i * SEG_DESC_LEN;
            Segment {
                vaddr: word(&descs, at),
                file_off: word(&descs, at + 4),
                file_sz: word(&descs, at + 8),
                mem_sz: word(&descs, at + 12),
                flags: word(&descs, at + 16),
            }
        })
        .collect();

    for seg in &segments {
        if seg.file_sz > seg.mem_sz {
            return Err(KernelError::Invalid);
        }
        let perms = RegionPerms::from_bits(seg.flags as u8).ok_or(KernelError::Invalid)?;
        space.define_region(td, VirtAddr::new(seg.vaddr), seg.mem_sz as usize, perms)?;
    }

    space.prepare_load(td)?;
    for seg in &segments {
        if seg.file_sz == 0 {
            continue;
        }
        let mut data = vec![0u8; seg.file_sz as usize];
        read_exact(td, vnode, &mut data, seg.file_off as u64)?;
        uaccess::copyout(vm, td, space, &data, VirtAddr::new(seg.vaddr))?;
    }
    space.complete_load(td)?;
    // The load went through writable TLB entries; drop them so restored
    // read-only pages cannot be written through stale translations.
    vm.tlb().flush_all(td);

    log::debug!(
        "load_image: {} segment(s), entry {:#x}",
        segments.len(),
        entry
    );
    Ok(VirtAddr::new(entry))
}

/// Packs segments into an image, the inverse of [`load_image`]. Used by
/// the build tooling and the tests.
///
/// Each element of `segments` is `(vaddr, file bytes, mem_sz, perms)`.
pub fn build_image(entry: u32, segments: &[(u32, &[u8], u32, RegionPerms)]) -> Vec<u8> {
    let mut image = Vec::new();
    image.extend_from_slice(MAGIC);
    image.extend_from_slice(&entry.to_le_bytes());
    image.extend_from_slice(&(segments.len() as u32).to_le_bytes());

    let mut file_off = (HEADER_LEN + segments.len() * SEG_DESC_LEN) as u32;
    for (vaddr, data, mem_sz, perms) in segments {
        image.extend_from_slice(&vaddr.to_le_bytes());
        image.extend_from_slice(&file_off.to_le_bytes());
        image.extend_from_slice(&(data.len() as u32).to_le_bytes());
        image.extend_from_slice(&mem_sz.to_le_bytes());
        image.extend_from_slice(&(perms.bits() as u32).to_le_bytes());
        file_off += data.len() as u32;
    }
    for (_, data, _, _) in segments {
        image.extend_from_slice(data);
    }
    image
}
