//! Typed identifier newtypes.
//!
//! Prevents mixing up process ids, descriptor numbers, and address-space
//! ids at the type level.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// A process identifier.
///
/// PID 0 is reserved for the kernel process; user PIDs live in
/// `[PID_MIN, PID_MAX)` (see [`crate::limits`]).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// The kernel process.
    pub const KERNEL: Pid = Pid(0);

    /// Creates a `Pid` from a raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pid({})", self.0)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file descriptor number, an index into a process's descriptor table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Fd(u32);

impl Fd {
    /// Standard input.
    pub const STDIN: Fd = Fd(0);
    /// Standard output.
    pub const STDOUT: Fd = Fd(1);
    /// Standard error.
    pub const STDERR: Fd = Fd(2);

    /// Creates an `Fd` from a raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the descriptor as a table index.
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fd({})", self.0)
    }
}

impl fmt::Display for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A unique address-space identifier, assigned at creation time.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AsId(u64);

static NEXT_AS_ID: AtomicU64 = AtomicU64::new(1);

impl AsId {
    /// Allocates a fresh, never-before-used id.
    pub fn alloc() -> Self {
        Self(NEXT_AS_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AsId({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_kernel_is_zero() {
        assert_eq!(Pid::KERNEL.as_u32(), 0);
    }

    #[test]
    fn fd_constants() {
        assert_eq!(Fd::STDIN.as_usize(), 0);
        assert_eq!(Fd::STDOUT.as_usize(), 1);
        assert_eq!(Fd::STDERR.as_usize(), 2);
    }

    #[test]
    fn as_ids_are_unique() {
        let a = AsId::alloc();
        let b = AsId::alloc();
        assert_ne!(a, b);
    }
}
