//! Syscall dispatch.
//!
//! The trap layer hands every syscall here as a trap frame: number in
//! `v0`, arguments in `a0`-`a3` (64-bit values in the aligned `a2`/`a3`
//! pair, overflow arguments on the user stack at `sp + 16`). On the way
//! out, results land in `v0` (`v0`/`v1` for 64-bit) with `a3` cleared,
//! errors put the errno in `v0` with `a3` set, and `epc` advances one
//! instruction either way.
//!
//! Syscalls that change the flow of control -- `fork`, `execv`, `_exit`,
//! `reboot` -- cannot be expressed as a register update alone, so the
//! dispatcher returns a [`Disposition`] telling the trap layer what to do
//! next.

mod file;
mod memory;
mod process;
mod time;

use alloc::sync::Arc;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::power::PowerRequest;
use pion_machine::trapframe::{join32to64, split64to32, Trapframe};

use crate::boot::Kernel;
use crate::proc::exec::{entry_trapframe, ExecImage};
use crate::proc::Process;

/// `fork`
pub const SYS_FORK: u32 = 0;
/// `execv`
pub const SYS_EXECV: u32 = 2;
/// `_exit`
pub const SYS_EXIT: u32 = 3;
/// `waitpid`
pub const SYS_WAITPID: u32 = 4;
/// `getpid`
pub const SYS_GETPID: u32 = 5;
/// `sbrk`
pub const SYS_SBRK: u32 = 9;
/// `open`
pub const SYS_OPEN: u32 = 45;
/// `dup2`
pub const SYS_DUP2: u32 = 48;
/// `close`
pub const SYS_CLOSE: u32 = 49;
/// `read`
pub const SYS_READ: u32 = 50;
/// `write`
pub const SYS_WRITE: u32 = 55;
/// `lseek`
pub const SYS_LSEEK: u32 = 59;
/// `remove`
pub const SYS_REMOVE: u32 = 68;
/// `chdir`
pub const SYS_CHDIR: u32 = 74;
/// `__getcwd`
pub const SYS___GETCWD: u32 = 76;
/// `__time`
pub const SYS___TIME: u32 = 113;
/// `reboot`
pub const SYS_REBOOT: u32 = 119;

/// What the trap layer must do after a syscall.
#[derive(Debug)]
pub enum Disposition {
    /// Resume the calling process with the updated trap frame.
    Return,
    /// The process exited with this encoded status; the calling thread
    /// must not return to user mode.
    Exited(i32),
    /// `fork` succeeded: schedule `child` entering user mode with
    /// `trapframe` (the parent resumes normally).
    SpawnChild {
        /// The newly created process.
        child: Arc<Process>,
        /// The child's initial register state: `fork` returning 0.
        trapframe: Trapframe,
    },
    /// The machine should reboot, halt, or power off.
    Shutdown(PowerRequest),
}

enum Outcome {
    Value(u32),
    Value64(u64),
    Spawn {
        child: Arc<Process>,
        trapframe: Trapframe,
        child_pid: u32,
    },
    NewImage(ExecImage),
    Exited(i32),
    Shutdown(PowerRequest),
}

/// The syscall entry point.
pub fn syscall(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    tf: &mut Trapframe,
) -> Disposition {
    assert_eq!(
        td.spinlocks_held(),
        0,
        "syscall entry with spinlocks held"
    );

    let disposition = match dispatch(kernel, td, proc, tf) {
        Err(e) => {
            tf.v0 = e.errno();
            tf.a3 = 1;
            tf.epc += Trapframe::INSTRUCTION_SIZE;
            Disposition::Return
        }
        Ok(Outcome::Value(v)) => {
            tf.v0 = v;
            tf.a3 = 0;
            tf.epc += Trapframe::INSTRUCTION_SIZE;
            Disposition::Return
        }
        Ok(Outcome::Value64(v)) => {
            let (hi, lo) = split64to32(v);
            tf.v0 = hi;
            tf.v1 = lo;
            tf.a3 = 0;
            tf.epc += Trapframe::INSTRUCTION_SIZE;
            Disposition::Return
        }
        Ok(Outcome::Spawn {
            child,
            trapframe,
            child_pid,
        }) => {
            tf.v0 = child_pid;
            tf.a3 = 0;
            tf.epc += Trapframe::INSTRUCTION_SIZE;
            Disposition::SpawnChild { child, trapframe }
        }
        Ok(Outcome::NewImage(image)) => {
            // execv does not return: the frame is rebuilt from scratch
            // for the new image.
            *tf = entry_trapframe(&image);
            Disposition::Return
        }
        Ok(Outcome::Exited(status)) => Disposition::Exited(status),
        Ok(Outcome::Shutdown(req)) => {
            tf.v0 = 0;
            tf.a3 = 0;
            tf.epc += Trapframe::INSTRUCTION_SIZE;
            Disposition::Shutdown(req)
        }
    };

    assert_eq!(
        td.spinlocks_held(),
        0,
        "syscall handler leaked a spinlock"
    );
    disposition
}

fn dispatch(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    tf: &Trapframe,
) -> Result<Outcome> {
    match tf.v0 {
        SYS_FORK => process::sys_fork(kernel, td, proc, tf),
        SYS_EXECV => process::sys_execv(kernel, td, proc, tf.a0, tf.a1),
        SYS_EXIT => Ok(Outcome::Exited(process::sys_exit(
            kernel,
            td,
            proc,
            tf.a0 as i32,
        ))),
        SYS_WAITPID => {
            process::sys_waitpid(kernel, td, proc, tf.a0, tf.a1, tf.a2).map(Outcome::Value)
        }
        SYS_GETPID => Ok(Outcome::Value(proc.pid().as_u32())),
        SYS_SBRK => memory::sys_sbrk(kernel, td, proc, tf.a0 as i32).map(Outcome::Value),
        SYS_OPEN => file::sys_open(kernel, td, proc, tf.a0, tf.a1).map(Outcome::Value),
        SYS_DUP2 => file::sys_dup2(td, proc, tf.a0, tf.a1).map(Outcome::Value),
        SYS_CLOSE => file::sys_close(td, proc, tf.a0).map(|()| Outcome::Value(0)),
        SYS_READ => file::sys_read(kernel, td, proc, tf.a0, tf.a1, tf.a2).map(Outcome::Value),
        SYS_WRITE => file::sys_write(kernel, td, proc, tf.a0, tf.a1, tf.a2).map(Outcome::Value),
        SYS_LSEEK => {
            // Offset arrives in the aligned a2/a3 pair; whence overflows
            // onto the user stack at sp + 16.
            let offset = join32to64(tf.a2, tf.a3) as i64;
            file::sys_lseek(kernel, td, proc, tf.a0, offset, tf.sp).map(Outcome::Value64)
        }
        SYS_REMOVE => file::sys_remove(kernel, td, proc, tf.a0).map(|()| Outcome::Value(0)),
        SYS_CHDIR => file::sys_chdir(kernel, td, proc, tf.a0).map(|()| Outcome::Value(0)),
        SYS___GETCWD => {
            file::sys_getcwd(kernel, td, proc, tf.a0, tf.a1).map(Outcome::Value)
        }
        SYS___TIME => time::sys_time(kernel, td, proc, tf.a0, tf.a1).map(Outcome::Value),
        SYS_REBOOT => time::sys_reboot(kernel, tf.a0).map(Outcome::Shutdown),
        unknown => {
            log::warn!("unknown syscall {unknown}");
            Err(KernelError::NoSys)
        }
    }
}
