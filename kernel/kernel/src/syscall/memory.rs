//! Memory syscalls: sbrk.

use alloc::sync::Arc;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};

use crate::boot::Kernel;
use crate::proc::Process;

/// `sbrk`: move the program break by `amount` bytes; returns the old
/// break.
pub(super) fn sys_sbrk(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    amount: i32,
) -> Result<u32> {
    let space = proc.space(td).ok_or(KernelError::BadAddress)?;
    let old_break = space.sbrk(td, kernel.vm(), amount)?;
    Ok(old_break.as_u32())
}
