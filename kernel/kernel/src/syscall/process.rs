//! Process syscalls: fork, execv, _exit, waitpid.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use pion_core::id::Pid;
use pion_core::limits::{ARG_MAX, NSIG, PATH_MAX};
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::VirtAddr;
use pion_machine::trapframe::Trapframe;
use pion_mm::uaccess;

use super::Outcome;
use crate::boot::Kernel;
use crate::proc::exec;
use crate::proc::wait;
use crate::proc::Process;

/// `fork`: duplicate the calling process. The parent gets the child's
/// PID; the child's trap frame returns 0 from the same syscall.
pub(super) fn sys_fork(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    tf: &Trapframe,
) -> Result<Outcome> {
    let child = kernel.proc_create(td, proc.name())?;
    child.set_parent(td, Some(proc.pid()));
    proc.add_child(td, child.pid());

    let space = proc.space(td).ok_or(KernelError::BadAddress)?;
    let child_space = match space.copy(td, kernel.vm()) {
        Ok(s) => s,
        Err(e) => {
            kernel.proc_reap(td, &child);
            return Err(e);
        }
    };
    child.set_space(td, Some(child_space));

    child.set_cwd(td, &proc.cwd(td));
    child.fdtable().inherit(td, proc.fdtable());

    // The child resumes just past the syscall with fork() == 0.
    let mut child_tf = *tf;
    child_tf.v0 = 0;
    child_tf.a3 = 0;
    child_tf.epc += Trapframe::INSTRUCTION_SIZE;

    log::debug!("fork: pid {} -> child {}", proc.pid(), child.pid());
    Ok(Outcome::Spawn {
        child_pid: child.pid().as_u32(),
        child,
        trapframe: child_tf,
    })
}

/// `execv`: copy the path and argument vector in, then replace the
/// process image.
pub(super) fn sys_execv(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    uprog: u32,
    uargs: u32,
) -> Result<Outcome> {
    let space = proc.space(td).ok_or(KernelError::BadAddress)?;
    let progname =
        uaccess::copyinstr(kernel.vm(), td, &space, VirtAddr::new(uprog), PATH_MAX)?;

    // Walk the user argv array: NULL-terminated pointers to strings,
    // total size bounded by ARG_MAX.
    let mut args: Vec<String> = Vec::new();
    let mut total = 0usize;
    let mut index = 0u32;
    loop {
        let ptr = uaccess::copyin_word(
            kernel.vm(),
            td,
            &space,
            VirtAddr::new(uargs + index * 4),
        )?;
        if ptr == 0 {
            break;
        }
        let arg =
            uaccess::copyinstr(kernel.vm(), td, &space, VirtAddr::new(ptr), ARG_MAX + 1)?;
        total += (arg.len() + 1 + 3) & !3;
        if total > ARG_MAX {
            return Err(KernelError::ArgTooLong);
        }
        args.push(arg);
        index += 1;
    }

    let image = exec::exec_into(kernel, td, proc, &progname, &args)?;
    Ok(Outcome::NewImage(image))
}

/// `_exit`: release every resource, record the encoded status, and wake
/// the parent. The process record stays behind as a zombie until reaped.
/// Returns the encoded status for the trap layer.
pub(super) fn sys_exit(kernel: &Kernel, td: &Thread, proc: &Arc<Process>, code: i32) -> i32 {
    proc.fdtable().close_all(td);
    proc.set_cwd(td, "");

    if let Some(space) = proc.set_space(td, None) {
        // Deactivate before destroying so no stale translations survive.
        kernel.vm().tlb().flush_all(td);
        space.destroy(td, kernel.vm());
    }

    let status = if code > 0 && code <= NSIG {
        wait::make_sig_status(code)
    } else {
        wait::make_exit_status(code)
    };
    proc.mark_exited(td, status);
    log::info!("exit: pid {} status {:#x}", proc.pid(), status);
    status
}

/// `waitpid`: collect a child's exit status, blocking until it exits,
/// then reap it. Only direct children can be waited on, and only with
/// `options == 0`.
pub(super) fn sys_waitpid(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    pid_raw: u32,
    statusptr: u32,
    options: u32,
) -> Result<u32> {
    if options != 0 {
        return Err(KernelError::Invalid);
    }
    let pid = Pid::new(pid_raw);
    let child = kernel.pids().lookup(td, pid).ok_or(KernelError::NoSuchProcess)?;
    if child.parent(td) != Some(proc.pid()) {
        return Err(KernelError::NotChild);
    }

    let status = child.wait_for_exit(td);

    if statusptr != 0 {
        let space = proc.space(td).ok_or(KernelError::BadAddress)?;
        uaccess::copyout_word(
            kernel.vm(),
            td,
            &space,
            status as u32,
            VirtAddr::new(statusptr),
        )?;
    }

    kernel.proc_reap(td, &child);
    Ok(pid_raw)
}
