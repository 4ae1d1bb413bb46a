//! The kernel-wide error type.
//!
//! Every fallible core operation returns [`KernelError`]. Syscall return
//! paths convert it to an errno value for the user-level C library via
//! [`KernelError::errno`].

use core::fmt;

/// Convenience alias used throughout the kernel.
pub type Result<T> = core::result::Result<T, KernelError>;

/// Error kinds the core can report to callers.
///
/// Internal inconsistencies (coremap state violations, PID table
/// corruption, releasing a lock that is not held) are bugs, not errors,
/// and panic instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Invalid argument.
    Invalid,
    /// No such process.
    NoSuchProcess,
    /// The named process is not a child of the caller.
    NotChild,
    /// No such file or device.
    NoSuchFile,
    /// Bad file descriptor, or descriptor open in the wrong access mode.
    BadFd,
    /// The object does not support seeking.
    NotSeekable,
    /// The per-process descriptor table is full.
    TooManyFiles,
    /// The process table is full.
    ProcessTableFull,
    /// Out of physical memory.
    OutOfMemory,
    /// Out of swap slots.
    OutOfSwap,
    /// Bad user-space address.
    BadAddress,
    /// Argument vector exceeds `ARG_MAX`.
    ArgTooLong,
    /// The resource is transiently busy.
    Busy,
    /// File already exists.
    Exists,
    /// Low-level device I/O failure.
    Io,
    /// Unknown or unimplemented syscall.
    NoSys,
}

impl KernelError {
    /// The errno value delivered to userland.
    pub const fn errno(self) -> u32 {
        match self {
            Self::NoSys => 1,
            Self::OutOfMemory => 2,
            Self::BadAddress => 5,
            Self::Invalid => 7,
            Self::ProcessTableFull => 11,
            Self::NoSuchFile => 12,
            Self::Exists => 15,
            Self::Busy => 20,
            Self::Io => 25,
            Self::NoSuchProcess => 28,
            Self::NotChild => 29,
            Self::BadFd => 30,
            Self::TooManyFiles => 32,
            Self::OutOfSwap => 33,
            Self::NotSeekable => 34,
            Self::ArgTooLong => 35,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::Invalid => "invalid argument",
            Self::NoSuchProcess => "no such process",
            Self::NotChild => "not a child of the caller",
            Self::NoSuchFile => "no such file or device",
            Self::BadFd => "bad file descriptor",
            Self::NotSeekable => "object is not seekable",
            Self::TooManyFiles => "too many open files",
            Self::ProcessTableFull => "process table full",
            Self::OutOfMemory => "out of memory",
            Self::OutOfSwap => "out of swap space",
            Self::BadAddress => "bad address",
            Self::ArgTooLong => "argument list too long",
            Self::Busy => "resource busy",
            Self::Exists => "file exists",
            Self::Io => "device I/O error",
            Self::NoSys => "no such system call",
        };
        f.write_str(msg)
    }
}
