//! The pion kernel proper: processes, PIDs, the syscall dispatcher, and
//! the boot sequence that wires the subsystems together.
//!
//! The trap/exception stubs and the thread scheduler are external
//! collaborators. They drive this crate through three entry points:
//! [`boot::Kernel::boot`] once at startup, [`syscall::syscall`] on every
//! trap, and [`pion_mm::fault::vm_fault`] on TLB misses.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod boot;
pub mod klog;
pub mod proc;
pub mod syscall;

pub use boot::{BootParams, Kernel};
pub use proc::Process;
pub use syscall::{Disposition, syscall};
