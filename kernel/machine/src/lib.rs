//! The MIPS-like machine the pion kernel runs on.
//!
//! Physical RAM, the software-refilled TLB, the trap frame, the wall
//! clock, and the power latch are modeled here so the kernel core is
//! exercisable without real hardware. The trap/exception entry stubs that
//! would drive these on a real machine are external collaborators.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod addr;
pub mod clock;
pub mod power;
pub mod ram;
pub mod tlb;
pub mod trapframe;

pub use addr::{PAGE_SIZE, PhysAddr, VirtAddr};
pub use ram::Ram;
pub use tlb::Tlb;
pub use trapframe::Trapframe;
