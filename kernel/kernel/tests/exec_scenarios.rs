//! exec: image replacement and argument passing.

mod common;

use common::*;
use pion_core::KernelError;
use pion_fs::file::{AccessMode, OpenFlags};
use pion_kernel::syscall::{self, Disposition};
use pion_machine::addr::VirtAddr;
use pion_mm::uaccess;

fn read_argv_pointer(
    kernel: &std::sync::Arc<pion_kernel::Kernel>,
    td: &pion_core::thread::Thread,
    proc: &std::sync::Arc<pion_kernel::Process>,
    argv: u32,
    index: u32,
) -> u32 {
    let space = proc.space(td).unwrap();
    uaccess::copyin_word(kernel.vm(), td, &space, VirtAddr::new(argv + index * 4)).unwrap()
}

fn read_user_string(
    kernel: &std::sync::Arc<pion_kernel::Kernel>,
    td: &pion_core::thread::Thread,
    proc: &std::sync::Arc<pion_kernel::Process>,
    addr: u32,
) -> String {
    let space = proc.space(td).unwrap();
    uaccess::copyinstr(kernel.vm(), td, &space, VirtAddr::new(addr), 256).unwrap()
}

#[test]
fn run_program_lays_out_argv() {
    let (kernel, td) = boot(64, 64);
    let (proc, tf) = start_program(&kernel, &td, "emu0:argvprog", &["argvprog", "alpha", "bz"]);

    assert_eq!(tf.epc, PROG_TEXT);
    assert_eq!(tf.a0, 3, "argc in a0");
    assert_eq!(tf.a2, 0, "NULL environment in a2");
    assert_eq!(tf.sp % 4, 0, "stack pointer stays word-aligned");
    assert_eq!(tf.a1, tf.sp, "argv array sits at the stack pointer");

    // Pointer array: three strings then the terminator.
    let argv = tf.a1;
    let p0 = read_argv_pointer(&kernel, &td, &proc, argv, 0);
    let p1 = read_argv_pointer(&kernel, &td, &proc, argv, 1);
    let p2 = read_argv_pointer(&kernel, &td, &proc, argv, 2);
    let p3 = read_argv_pointer(&kernel, &td, &proc, argv, 3);
    assert_eq!(p3, 0, "argv is NULL-terminated");
    assert_eq!(p0 % 4, 0, "strings are word-aligned");
    assert_eq!(p1 % 4, 0);

    assert_eq!(read_user_string(&kernel, &td, &proc, p0), "argvprog");
    assert_eq!(read_user_string(&kernel, &td, &proc, p1), "alpha");
    assert_eq!(read_user_string(&kernel, &td, &proc, p2), "bz");

    kernel.proc_reap(&td, &proc);
}

#[test]
fn execv_replaces_the_image() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:first", &["first"]);

    // A second program to exec into.
    install_program(&kernel, &td, "emu0:second");

    // Leave a mark in the current image; it must not survive the exec.
    let mark = ualloc(&kernel, &td, &proc, 8);
    let old_space_id = proc.space(&td).unwrap().id();

    // Build the argv array in user memory: ["second", "xyz", NULL].
    let s0 = ustr(&kernel, &td, &proc, "second");
    let s1 = ustr(&kernel, &td, &proc, "xyz");
    let argv_block = ubytes(
        &kernel,
        &td,
        &proc,
        &[s0.to_le_bytes(), s1.to_le_bytes(), 0u32.to_le_bytes()].concat(),
    );
    let path = ustr(&kernel, &td, &proc, "emu0:second");

    let d = trap(&kernel, &td, &proc, &mut tf, syscall::SYS_EXECV, path, argv_block, 0, 0);
    assert!(matches!(d, Disposition::Return));
    // The frame was rebuilt for the new image, not advanced.
    assert_eq!(tf.epc, PROG_TEXT);
    assert_eq!(tf.a0, 2, "argc carried into the new image");

    // New address space, arguments relaid on the new stack.
    assert_ne!(proc.space(&td).unwrap().id(), old_space_id);
    let p0 = read_argv_pointer(&kernel, &td, &proc, tf.a1, 0);
    assert_eq!(read_user_string(&kernel, &td, &proc, p0), "second");
    let p1 = read_argv_pointer(&kernel, &td, &proc, tf.a1, 1);
    assert_eq!(read_user_string(&kernel, &td, &proc, p1), "xyz");

    // The old heap mark is gone with the old image: its address is no
    // longer mapped (the new image has a fresh, empty heap).
    let space = proc.space(&td).unwrap();
    let mut probe = [0u8; 1];
    assert_eq!(
        uaccess::copyin(kernel.vm(), &td, &space, VirtAddr::new(mark), &mut probe),
        Err(KernelError::BadAddress)
    );

    kernel.proc_reap(&td, &proc);
}

#[test]
fn execv_missing_program_leaves_caller_intact() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:survivor", &[]);

    let mark = ualloc(&kernel, &td, &proc, 4);
    let space = proc.space(&td).unwrap();
    uaccess::copyout(kernel.vm(), &td, &space, b"mark", VirtAddr::new(mark)).unwrap();

    let path = ustr(&kernel, &td, &proc, "emu0:no-such-program");
    let argv_block = ubytes(&kernel, &td, &proc, &0u32.to_le_bytes());
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_EXECV, path, argv_block, 0, 0);
    assert_eq!(errno(&tf), KernelError::NoSuchFile.errno());

    // The failure happened before the point of no return: the old image
    // is untouched.
    let mut back = [0u8; 4];
    uaccess::copyin(kernel.vm(), &td, &space, VirtAddr::new(mark), &mut back).unwrap();
    assert_eq!(&back, b"mark");

    kernel.proc_reap(&td, &proc);
}

#[test]
fn execv_rejects_corrupt_images() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:victim", &[]);

    // A file that is not a program image.
    let junk = kernel
        .vfs()
        .open(
            &td,
            "emu0:junk",
            "",
            AccessMode::WriteOnly,
            OpenFlags::CREATE,
        )
        .unwrap();
    junk.write_at(&td, b"this is not an executable", 0).unwrap();

    let path = ustr(&kernel, &td, &proc, "emu0:junk");
    let argv_block = ubytes(&kernel, &td, &proc, &0u32.to_le_bytes());
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_EXECV, path, argv_block, 0, 0);
    assert_eq!(errno(&tf), KernelError::Invalid.errno());

    kernel.proc_reap(&td, &proc);
}
