//! Power-state latch.
//!
//! `reboot` and friends do not themselves stop the machine; they record a
//! request that the embedder honors when the syscall returns.

use core::sync::atomic::{AtomicU8, Ordering};

/// What the user asked the machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerRequest {
    /// Reboot the machine.
    Reboot = 1,
    /// Halt without powering off.
    Halt = 2,
    /// Power the machine off.
    PowerOff = 3,
}

/// `reboot` code: reboot.
pub const RB_REBOOT: u32 = 0;
/// `reboot` code: halt.
pub const RB_HALT: u32 = 1;
/// `reboot` code: power off.
pub const RB_POWEROFF: u32 = 2;

/// The machine's power latch.
pub struct Power {
    state: AtomicU8,
}

impl Power {
    /// Creates a latch with no request pending.
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(0),
        }
    }

    /// Records a power request.
    pub fn request(&self, req: PowerRequest) {
        self.state.store(req as u8, Ordering::Release);
    }

    /// The pending request, if any.
    pub fn requested(&self) -> Option<PowerRequest> {
        match self.state.load(Ordering::Acquire) {
            1 => Some(PowerRequest::Reboot),
            2 => Some(PowerRequest::Halt),
            3 => Some(PowerRequest::PowerOff),
            _ => None,
        }
    }
}

impl Default for Power {
    fn default() -> Self {
        Self::new()
    }
}
