//! Program execution: the shared core of `execv`, the kernel-driven
//! exec, and `runprogram`.
//!
//! The caller has already copied the path and argument strings into
//! kernel memory (bounded by `ARG_MAX`). From there: open the executable,
//! tear down the old address space, build and activate a fresh one, load
//! the image, define the stack, and lay the argument block out on the
//! user stack -- strings word-aligned, pointer array NULL-terminated.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use pion_core::limits::ARG_MAX;
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::VirtAddr;
use pion_machine::trapframe::Trapframe;
use pion_mm::address_space::AddressSpace;
use pion_mm::uaccess;

use crate::boot::Kernel;
use crate::proc::binfmt;
use crate::proc::Process;

/// Where a fresh image starts executing.
#[derive(Debug, Clone, Copy)]
pub struct ExecImage {
    /// Program entry point.
    pub entry: VirtAddr,
    /// Initial stack pointer, below the argument block.
    pub stack_ptr: VirtAddr,
    /// Argument count.
    pub argc: u32,
    /// User address of the argv pointer array.
    pub argv: VirtAddr,
}

fn round_word(n: usize) -> usize {
    (n + 3) & !3
}

/// Total stack bytes the argument strings need, or `ArgTooLong` when the
/// vector exceeds `ARG_MAX`.
pub(crate) fn measure_args(args: &[String]) -> Result<usize> {
    let mut stringspace = 0usize;
    for arg in args {
        let padded = round_word(arg.len() + 1);
        stringspace = stringspace
            .checked_add(padded)
            .ok_or(KernelError::ArgTooLong)?;
        if stringspace > ARG_MAX {
            return Err(KernelError::ArgTooLong);
        }
    }
    Ok(stringspace)
}

/// Replaces `proc`'s image with `progname`, returning the new entry
/// state. Does not touch the trap frame; the dispatcher (or the trap
/// layer) builds the user-mode entry from the returned [`ExecImage`].
///
/// Failures before the old address space is torn down leave the caller
/// untouched; failures after it leave the process with a fresh, empty
/// image and still propagate the error.
pub fn exec_into(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    progname: &str,
    args: &[String],
) -> Result<ExecImage> {
    let stringspace = measure_args(args)?;

    // Open the executable before the point of no return.
    let vnode = kernel.vfs().resolve(td, progname, &proc.cwd(td))?;

    // Tear down the old image and activate a fresh space.
    if let Some(old) = proc.set_space(td, None) {
        old.destroy(td, kernel.vm());
    }
    let space = AddressSpace::create();
    proc.set_space(td, Some(Arc::clone(&space)));
    space.activate(td, kernel.vm().tlb());

    let entry = binfmt::load_image(kernel.vm(), td, &space, &vnode)?;
    let stack_top = space.define_stack(td)?;

    // Argument block: [argv pointers][strings], stack pointer below both,
    // word-aligned.
    let ptrspace = (args.len() + 1) * 4;
    let sp = (stack_top.as_u32() - stringspace as u32 - ptrspace as u32) & !3;
    let argv_base = VirtAddr::new(sp);

    let mut dest = sp + ptrspace as u32;
    let mut pointers: Vec<u32> = Vec::with_capacity(args.len() + 1);
    for arg in args {
        let mut bytes = Vec::with_capacity(arg.len() + 1);
        bytes.extend_from_slice(arg.as_bytes());
        bytes.push(0);
        uaccess::copyout(kernel.vm(), td, &space, &bytes, VirtAddr::new(dest))?;
        pointers.push(dest);
        dest += round_word(bytes.len()) as u32;
    }
    pointers.push(0);

    for (i, ptr) in pointers.iter().enumerate() {
        uaccess::copyout_word(
            kernel.vm(),
            td,
            &space,
            *ptr,
            argv_base + (i * 4) as u32,
        )?;
    }

    log::info!(
        "exec: pid {} -> {} ({} arg(s))",
        proc.pid(),
        progname,
        args.len()
    );

    Ok(ExecImage {
        entry,
        stack_ptr: VirtAddr::new(sp),
        argc: args.len() as u32,
        argv: argv_base,
    })
}

/// Builds the trap frame that enters user mode for `image`, the way the
/// trap layer's enter-new-process path would: `a0 = argc`, `a1 = argv`,
/// `a2 = NULL` environment.
pub fn entry_trapframe(image: &ExecImage) -> Trapframe {
    Trapframe {
        a0: image.argc,
        a1: image.argv.as_u32(),
        a2: 0,
        sp: image.stack_ptr.as_u32(),
        epc: image.entry.as_u32(),
        ..Trapframe::default()
    }
}

/// Creates a fresh user process running `path`: console descriptors
/// bound, cwd inherited from the kernel process, image loaded, arguments
/// in place. Returns the process and the trap frame that starts it.
pub fn run_program(
    kernel: &Kernel,
    td: &Thread,
    path: &str,
    args: &[String],
) -> Result<(Arc<Process>, Trapframe)> {
    let proc = kernel.proc_create_user(td, path)?;
    match exec_into(kernel, td, &proc, path, args) {
        Ok(image) => Ok((proc, entry_trapframe(&image))),
        Err(e) => {
            kernel.proc_reap(td, &proc);
            Err(e)
        }
    }
}
