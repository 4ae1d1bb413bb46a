//! Shared harness: boots a kernel, packs a user program into the RAM
//! volume, and drives the syscall dispatcher the way the trap layer
//! would.

// Not every test binary uses every helper.
#![allow(dead_code)]

use std::sync::Arc;

use pion_core::thread::Thread;
use pion_fs::file::{AccessMode, OpenFlags};
use pion_kernel::boot::{BootParams, Kernel};
use pion_kernel::proc::binfmt;
use pion_kernel::proc::exec;
use pion_kernel::proc::Process;
use pion_kernel::syscall;
use pion_machine::addr::{VirtAddr, PAGE_SIZE};
use pion_machine::trapframe::Trapframe;
use pion_mm::address_space::RegionPerms;
use pion_mm::uaccess;

/// Text and data base addresses of the packed test program.
pub const PROG_TEXT: u32 = 0x0040_0000;
pub const PROG_DATA: u32 = 0x0041_0000;

/// Boots a kernel with the given memory geometry.
pub fn boot(ram_pages: usize, swap_pages: usize) -> (Arc<Kernel>, Thread) {
    pion_kernel::klog::init();
    let td = Thread::new("boot");
    let kernel = Kernel::boot(
        &td,
        BootParams {
            ram_pages,
            kernel_frames: 4,
            swap_pages,
            clock_epoch_secs: 1_000_000,
        },
    )
    .expect("boot failed");
    (kernel, td)
}

/// Packs a minimal program (one text page, one writable data page) into
/// the RAM volume under `name`.
pub fn install_program(kernel: &Kernel, td: &Thread, name: &str) {
    // A few recognizable instruction bytes; the machine model never
    // decodes them.
    let text = [0x27u8, 0xbd, 0xff, 0xe8];
    let image = binfmt::build_image(
        PROG_TEXT,
        &[
            (
                PROG_TEXT,
                text.as_slice(),
                PAGE_SIZE as u32,
                RegionPerms::READ | RegionPerms::EXEC,
            ),
            (
                PROG_DATA,
                b"pion test program".as_slice(),
                PAGE_SIZE as u32,
                RegionPerms::READ | RegionPerms::WRITE,
            ),
        ],
    );
    let file = kernel
        .vfs()
        .open(
            td,
            name,
            "emu0:",
            AccessMode::WriteOnly,
            OpenFlags::CREATE | OpenFlags::TRUNC,
        )
        .expect("create program file");
    file.write_at(td, &image, 0).expect("write program image");
}

/// Installs and starts `name`, returning the process and its entry trap
/// frame.
pub fn start_program(
    kernel: &Kernel,
    td: &Thread,
    name: &str,
    args: &[&str],
) -> (Arc<Process>, Trapframe) {
    install_program(kernel, td, name);
    let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
    exec::run_program(kernel, td, name, &args).expect("run_program failed")
}

/// Issues a syscall through the dispatcher, exactly as the trap stub
/// would.
pub fn trap(
    kernel: &Kernel,
    td: &Thread,
    proc: &Arc<Process>,
    tf: &mut Trapframe,
    nr: u32,
    a0: u32,
    a1: u32,
    a2: u32,
    a3: u32,
) -> syscall::Disposition {
    tf.v0 = nr;
    tf.a0 = a0;
    tf.a1 = a1;
    tf.a2 = a2;
    tf.a3 = a3;
    syscall::syscall(kernel, td, proc, tf)
}

/// Asserts the last syscall succeeded and returns its value.
pub fn value(tf: &Trapframe) -> u32 {
    assert_eq!(tf.a3, 0, "syscall failed with errno {}", tf.v0);
    tf.v0
}

/// Asserts the last syscall failed and returns its errno.
pub fn errno(tf: &Trapframe) -> u32 {
    assert_eq!(tf.a3, 1, "syscall unexpectedly succeeded (v0={})", tf.v0);
    tf.v0
}

/// Grows the heap by `len` bytes and returns the old break -- scratch
/// space for strings and buffers a real program would hold in its image.
pub fn ualloc(kernel: &Kernel, td: &Thread, proc: &Arc<Process>, len: usize) -> u32 {
    let space = proc.space(td).expect("process has no address space");
    let old = space
        .sbrk(td, kernel.vm(), ((len + 7) & !7) as i32)
        .expect("sbrk for scratch space");
    old.as_u32()
}

/// Places a NUL-terminated string in user memory and returns its address.
pub fn ustr(kernel: &Kernel, td: &Thread, proc: &Arc<Process>, s: &str) -> u32 {
    let addr = ualloc(kernel, td, proc, s.len() + 1);
    let space = proc.space(td).unwrap();
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    uaccess::copyout(kernel.vm(), td, &space, &bytes, VirtAddr::new(addr)).unwrap();
    addr
}

/// Places raw bytes in user memory and returns their address.
pub fn ubytes(kernel: &Kernel, td: &Thread, proc: &Arc<Process>, data: &[u8]) -> u32 {
    let addr = ualloc(kernel, td, proc, data.len());
    let space = proc.space(td).unwrap();
    uaccess::copyout(kernel.vm(), td, &space, data, VirtAddr::new(addr)).unwrap();
    addr
}

/// Reads user memory back into a kernel buffer.
pub fn uread(kernel: &Kernel, td: &Thread, proc: &Arc<Process>, addr: u32, len: usize) -> Vec<u8> {
    let space = proc.space(td).unwrap();
    let mut buf = vec![0u8; len];
    uaccess::copyin(kernel.vm(), td, &space, VirtAddr::new(addr), &mut buf).unwrap();
    buf
}
