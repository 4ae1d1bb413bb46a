//! System-wide limits.

/// Maximum open descriptors per process.
pub const OPEN_MAX: usize = 128;

/// Maximum length of a pathname, including the NUL.
pub const PATH_MAX: usize = 1024;

/// Maximum total size of an exec argument vector (strings + padding).
pub const ARG_MAX: usize = 65536;

/// Lowest PID handed to user processes. PIDs below this are reserved for
/// system processes (the kernel process is PID 0).
pub const PID_MIN: u32 = 2;

/// Exclusive upper bound of the PID space.
pub const PID_MAX: u32 = 32768;

/// Highest signal number recognized by the exit-status encoding.
pub const NSIG: i32 = 31;
