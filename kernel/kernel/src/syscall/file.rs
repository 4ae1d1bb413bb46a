//! File syscalls: open, close, dup2, read, write, lseek, remove, chdir,
//! __getcwd.
//!
//! User buffers are staged through kernel memory: reads and writes copy
//! between user space and a kernel buffer with `copyin`/`copyout`, and
//! the transfer itself goes through the shared file handle, which owns
//! the offset protocol.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;

use pion_core::id::Fd;
use pion_core::limits::PATH_MAX;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_fs::file::{decode_open_flags, FileHandle, Whence};
use pion_machine::addr::VirtAddr;
use pion_mm::address_space::AddressSpace;
use pion_mm::uaccess;

use crate::boot::Kernel;
use crate::proc::Process;

fn current_space(td: &Thread, proc: &Arc<Process>) -> Result<Arc<AddressSpace>> {
    proc.space(td).ok_or(KernelError::BadAddress)
}

fn copy_path(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    upath: u32,
) -> Result<String> {
    let space = current_space(td, proc)?;
    uaccess::copyinstr(kernel.vm(), td, &space, VirtAddr::new(upath), PATH_MAX)
}

pub(super) fn sys_open(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    upath: u32,
    flags: u32,
) -> Result<u32> {
    let path = copy_path(kernel, td, proc, upath)?;
    let (mode, oflags) = decode_open_flags(flags)?;
    let vnode = kernel.vfs().open(td, &path, &proc.cwd(td), mode, oflags)?;
    let handle = FileHandle::new(vnode, mode);
    let fd = proc.fdtable().alloc(td, handle)?;
    Ok(fd.as_u32())
}

pub(super) fn sys_close(td: &Thread, proc: &Arc<Process>, fd: u32) -> Result<()> {
    proc.fdtable().free(td, Fd::new(fd))
}

pub(super) fn sys_dup2(
    td: &Thread,
    proc: &Arc<Process>,
    oldfd: u32,
    newfd: u32,
) -> Result<u32> {
    let fd = proc.fdtable().dup(td, Fd::new(oldfd), Fd::new(newfd))?;
    Ok(fd.as_u32())
}

pub(super) fn sys_read(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    fd: u32,
    ubuf: u32,
    len: u32,
) -> Result<u32> {
    let space = current_space(td, proc)?;
    let handle = proc.fdtable().get(td, Fd::new(fd))?;

    let mut kbuf = vec![0u8; len as usize];
    let n = handle.read(td, &mut kbuf)?;
    uaccess::copyout(kernel.vm(), td, &space, &kbuf[..n], VirtAddr::new(ubuf))?;
    Ok(n as u32)
}

pub(super) fn sys_write(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    fd: u32,
    ubuf: u32,
    len: u32,
) -> Result<u32> {
    let space = current_space(td, proc)?;
    let handle = proc.fdtable().get(td, Fd::new(fd))?;

    let mut kbuf = vec![0u8; len as usize];
    uaccess::copyin(kernel.vm(), td, &space, VirtAddr::new(ubuf), &mut kbuf)?;
    let n = handle.write(td, &kbuf)?;
    Ok(n as u32)
}

pub(super) fn sys_lseek(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    fd: u32,
    offset: i64,
    sp: u32,
) -> Result<u64> {
    // The whence argument lives on the user stack, past the register
    // save area.
    let space = current_space(td, proc)?;
    let whence_raw =
        uaccess::copyin_word(kernel.vm(), td, &space, VirtAddr::new(sp + 16))?;
    let whence = Whence::from_raw(whence_raw)?;

    let handle = proc.fdtable().get(td, Fd::new(fd))?;
    handle.lseek(td, offset, whence)
}

pub(super) fn sys_remove(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    upath: u32,
) -> Result<()> {
    let path = copy_path(kernel, td, proc, upath)?;
    kernel.vfs().remove(td, &path, &proc.cwd(td))
}

pub(super) fn sys_chdir(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    upath: u32,
) -> Result<()> {
    let path = copy_path(kernel, td, proc, upath)?;
    let normalized = kernel.vfs().normalize_dir(td, &path, &proc.cwd(td))?;
    proc.set_cwd(td, &normalized);
    Ok(())
}

pub(super) fn sys_getcwd(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    ubuf: u32,
    buflen: u32,
) -> Result<u32> {
    let space = current_space(td, proc)?;
    let cwd = proc.cwd(td);
    let bytes = cwd.as_bytes();
    let n = bytes.len().min(buflen as usize);
    uaccess::copyout(kernel.vm(), td, &space, &bytes[..n], VirtAddr::new(ubuf))?;
    Ok(n as u32)
}
