//! File syscalls end-to-end: open/read/write/lseek/dup2/close, the
//! console, the cwd calls, __time, and reboot.

mod common;

use common::*;
use pion_core::KernelError;
use pion_kernel::syscall::{self, Disposition};
use pion_machine::power::PowerRequest;
use pion_machine::trapframe::split64to32;
use pion_mm::uaccess;
use pion_machine::addr::VirtAddr;

/// open flags as userland encodes them: low bits access mode, 0x4 CREATE,
/// 0x10 TRUNC.
const O_RDONLY: u32 = 0;
const O_WRONLY: u32 = 1;
const O_RDWR: u32 = 2;
const O_CREAT: u32 = 0x4;

fn lseek(
    kernel: &std::sync::Arc<pion_kernel::Kernel>,
    td: &pion_core::thread::Thread,
    proc: &std::sync::Arc<pion_kernel::Process>,
    tf: &mut pion_machine::trapframe::Trapframe,
    fd: u32,
    offset: i64,
    whence: u32,
) {
    // Per the ABI, whence goes on the user stack at sp + 16. Push a call
    // frame first, the way the C library's syscall stub would.
    let caller_sp = tf.sp;
    tf.sp -= 64;
    let space = proc.space(td).unwrap();
    uaccess::copyout_word(kernel.vm(), td, &space, whence, VirtAddr::new(tf.sp + 16)).unwrap();
    let (hi, lo) = split64to32(offset as u64);
    trap(kernel, td, proc, tf, syscall::SYS_LSEEK, fd, 0, hi, lo);
    tf.sp = caller_sp;
}

fn value64(tf: &pion_machine::trapframe::Trapframe) -> u64 {
    assert_eq!(tf.a3, 0, "syscall failed with errno {}", tf.v0);
    pion_machine::trapframe::join32to64(tf.v0, tf.v1)
}

#[test]
fn lseek_semantics_on_a_written_file() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:lseek", &[]);

    let path = ustr(&kernel, &td, &proc, "emu0:scratch");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_OPEN, path, O_RDWR | O_CREAT, 0, 0);
    let fd = value(&tf);

    // Write ten bytes.
    let buf = ubytes(&kernel, &td, &proc, b"0123456789");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_WRITE, fd, buf, 10, 0);
    assert_eq!(value(&tf), 10);

    // lseek(fd, -5, SEEK_CUR) == 5.
    lseek(&kernel, &td, &proc, &mut tf, fd, -5, 1);
    assert_eq!(value64(&tf), 5);

    // Reading five bytes yields the tail of the write.
    let rbuf = ualloc(&kernel, &td, &proc, 5);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_READ, fd, rbuf, 5, 0);
    assert_eq!(value(&tf), 5);
    assert_eq!(uread(&kernel, &td, &proc, rbuf, 5), b"56789");

    // lseek(fd, 0, SEEK_END) == 10.
    lseek(&kernel, &td, &proc, &mut tf, fd, 0, 2);
    assert_eq!(value64(&tf), 10);

    // lseek(fd, 0, SEEK_CUR) is a pure query.
    lseek(&kernel, &td, &proc, &mut tf, fd, 0, 1);
    assert_eq!(value64(&tf), 10);
    lseek(&kernel, &td, &proc, &mut tf, fd, 0, 1);
    assert_eq!(value64(&tf), 10);

    // Negative resulting offsets are invalid.
    lseek(&kernel, &td, &proc, &mut tf, fd, -11, 1);
    assert_eq!(errno(&tf), KernelError::Invalid.errno());

    // Bad whence is invalid.
    lseek(&kernel, &td, &proc, &mut tf, fd, 0, 9);
    assert_eq!(errno(&tf), KernelError::Invalid.errno());

    kernel.proc_reap(&td, &proc);
}

#[test]
fn lseek_on_console_is_espipe() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:espipe", &[]);
    lseek(&kernel, &td, &proc, &mut tf, 1, 0, 0);
    assert_eq!(errno(&tf), KernelError::NotSeekable.errno());
    kernel.proc_reap(&td, &proc);
}

#[test]
fn dup2_then_close_keeps_console_reachable() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:dup2", &[]);

    // dup2(1, 5); close(1); write(5, "hi", 2).
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_DUP2, 1, 5, 0, 0);
    assert_eq!(value(&tf), 5);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_CLOSE, 1, 0, 0, 0);
    value(&tf);

    let msg = ubytes(&kernel, &td, &proc, b"hi");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_WRITE, 5, msg, 2, 0);
    assert_eq!(value(&tf), 2);
    assert_eq!(kernel.console().take_output(&td), b"hi");

    // The closed descriptor is dead.
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_WRITE, 1, msg, 2, 0);
    assert_eq!(errno(&tf), KernelError::BadFd.errno());

    // dup2(a, a) is a no-op validity check.
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_DUP2, 5, 5, 0, 0);
    assert_eq!(value(&tf), 5);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_DUP2, 77, 77, 0, 0);
    assert_eq!(errno(&tf), KernelError::BadFd.errno());

    kernel.proc_reap(&td, &proc);
}

#[test]
fn access_mode_is_enforced() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:modes", &[]);

    let path = ustr(&kernel, &td, &proc, "emu0:ro");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_OPEN, path, O_WRONLY | O_CREAT, 0, 0);
    let wfd = value(&tf);
    let buf = ubytes(&kernel, &td, &proc, b"abc");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_WRITE, wfd, buf, 3, 0);
    assert_eq!(value(&tf), 3);

    // Reading a write-only descriptor fails.
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_READ, wfd, buf, 3, 0);
    assert_eq!(errno(&tf), KernelError::BadFd.errno());

    // And the other way around.
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_OPEN, path, O_RDONLY, 0, 0);
    let rfd = value(&tf);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_WRITE, rfd, buf, 3, 0);
    assert_eq!(errno(&tf), KernelError::BadFd.errno());

    // Reading works and sees the earlier write.
    let rbuf = ualloc(&kernel, &td, &proc, 3);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_READ, rfd, rbuf, 3, 0);
    assert_eq!(value(&tf), 3);
    assert_eq!(uread(&kernel, &td, &proc, rbuf, 3), b"abc");

    kernel.proc_reap(&td, &proc);
}

#[test]
fn console_read_returns_typed_input() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:coninput", &[]);

    kernel.console().push_input(&td, b"ok\n");
    let rbuf = ualloc(&kernel, &td, &proc, 8);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_READ, 0, rbuf, 8, 0);
    assert_eq!(value(&tf), 3);
    assert_eq!(uread(&kernel, &td, &proc, rbuf, 3), b"ok\n");

    kernel.proc_reap(&td, &proc);
}

#[test]
fn chdir_getcwd_remove() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:cwd", &[]);

    // The runprogram cwd is the boot volume.
    let cwd_buf = ualloc(&kernel, &td, &proc, 32);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS___GETCWD, cwd_buf, 32, 0, 0);
    let n = value(&tf);
    assert_eq!(uread(&kernel, &td, &proc, cwd_buf, n as usize), b"emu0:");

    // chdir to a bad path fails, to the volume root succeeds.
    let bad = ustr(&kernel, &td, &proc, "nosuch:");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_CHDIR, bad, 0, 0, 0);
    assert_eq!(errno(&tf), KernelError::NoSuchFile.errno());
    let good = ustr(&kernel, &td, &proc, "emu0:");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_CHDIR, good, 0, 0, 0);
    value(&tf);

    // Create a file by relative path, then remove it.
    let rel = ustr(&kernel, &td, &proc, "doomed");
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_OPEN, rel, O_WRONLY | O_CREAT, 0, 0);
    let fd = value(&tf);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_CLOSE, fd, 0, 0, 0);
    value(&tf);

    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_REMOVE, rel, 0, 0, 0);
    value(&tf);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_OPEN, rel, O_RDONLY, 0, 0);
    assert_eq!(errno(&tf), KernelError::NoSuchFile.errno());

    kernel.proc_reap(&td, &proc);
}

#[test]
fn time_reports_the_clock() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:time", &[]);

    kernel.clock().advance(2_500_000_000); // +2.5s
    let secs_ptr = ualloc(&kernel, &td, &proc, 4);
    let nsecs_ptr = ualloc(&kernel, &td, &proc, 4);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS___TIME, secs_ptr, nsecs_ptr, 0, 0);
    value(&tf);

    let secs = u32::from_le_bytes(uread(&kernel, &td, &proc, secs_ptr, 4).try_into().unwrap());
    let nsecs = u32::from_le_bytes(uread(&kernel, &td, &proc, nsecs_ptr, 4).try_into().unwrap());
    assert_eq!(secs, 1_000_002);
    assert_eq!(nsecs, 500_000_000);

    kernel.proc_reap(&td, &proc);
}

#[test]
fn reboot_latches_a_power_request() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:reboot", &[]);

    // Invalid codes are rejected without touching the latch.
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_REBOOT, 99, 0, 0, 0);
    assert_eq!(errno(&tf), KernelError::Invalid.errno());
    assert_eq!(kernel.power().requested(), None);

    let d = trap(&kernel, &td, &proc, &mut tf, syscall::SYS_REBOOT, 0, 0, 0, 0);
    assert!(matches!(d, Disposition::Shutdown(PowerRequest::Reboot)));
    assert_eq!(kernel.power().requested(), Some(PowerRequest::Reboot));

    kernel.proc_reap(&td, &proc);
}

#[test]
fn unknown_syscall_is_nosys() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:nosys", &[]);
    trap(&kernel, &td, &proc, &mut tf, 4242, 0, 0, 0, 0);
    assert_eq!(errno(&tf), KernelError::NoSys.errno());
    kernel.proc_reap(&td, &proc);
}
