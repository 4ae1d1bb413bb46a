//! Clock and power syscalls: __time, reboot.

use alloc::sync::Arc;

use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_machine::addr::VirtAddr;
use pion_machine::power::{PowerRequest, RB_HALT, RB_POWEROFF, RB_REBOOT};
use pion_mm::uaccess;

use crate::boot::Kernel;
use crate::proc::Process;

/// `__time`: write the current time through the user's seconds and
/// nanoseconds pointers (either may be NULL).
pub(super) fn sys_time(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    usecs: u32,
    unsecs: u32,
) -> Result<u32> {
    let (secs, nanos) = kernel.clock().now();
    if usecs != 0 || unsecs != 0 {
        let space = proc.space(td).ok_or(KernelError::BadAddress)?;
        if usecs != 0 {
            uaccess::copyout_word(kernel.vm(), td, &space, secs as u32, VirtAddr::new(usecs))?;
        }
        if unsecs != 0 {
            uaccess::copyout_word(kernel.vm(), td, &space, nanos, VirtAddr::new(unsecs))?;
        }
    }
    Ok(0)
}

/// `reboot`: record the requested power transition; the embedder honors
/// it once the syscall returns.
pub(super) fn sys_reboot(kernel: &Kernel, code: u32) -> Result<PowerRequest> {
    let req = match code {
        RB_REBOOT => PowerRequest::Reboot,
        RB_HALT => PowerRequest::Halt,
        RB_POWEROFF => PowerRequest::PowerOff,
        _ => return Err(KernelError::Invalid),
    };
    log::warn!("reboot: request {req:?}");
    kernel.power().request(req);
    Ok(req)
}
