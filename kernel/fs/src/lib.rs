//! File layer: vnodes, the device namespace, open-file handles, and
//! per-process descriptor tables.
//!
//! On-disk filesystems are external collaborators; what lives here is the
//! part the core consumes: the [`Vnode`] object interface, the `con:`
//! console device, memory-backed files (which also back the raw swap
//! device), and the shared-handle / descriptor-table machinery of the
//! file syscalls.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod console;
pub mod file;
pub mod memfile;
pub mod vfs;
pub mod vnode;

pub use console::Console;
pub use file::{AccessMode, FdTable, FileHandle, OpenFlags, Whence};
pub use memfile::MemFile;
pub use vfs::Vfs;
pub use vnode::Vnode;
