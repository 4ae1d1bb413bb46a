//! Process lifecycle: fork, exit, waitpid, and the PID table.

mod common;

use common::*;
use pion_core::id::Pid;
use pion_core::thread::Thread;
use pion_core::KernelError;
use pion_kernel::proc::wait;
use pion_kernel::syscall::{self, Disposition};
use pion_machine::addr::VirtAddr;
use pion_machine::trapframe::Trapframe;
use pion_mm::uaccess;

#[test]
fn getpid_reports_own_pid() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:getpid", &[]);
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_GETPID, 0, 0, 0, 0);
    assert_eq!(value(&tf), proc.pid().as_u32());
    kernel.proc_reap(&td, &proc);
}

#[test]
fn fork_child_sees_parent_memory_and_exit_status_flows_back() {
    let (kernel, td) = boot(64, 64);
    let (parent, mut tf) = start_program(&kernel, &td, "emu0:forker", &[]);
    let count_before_fork = kernel.process_count(&td);

    // Parent stores 0x5A in a fresh heap byte.
    let heap = ualloc(&kernel, &td, &parent, 8);
    let parent_space = parent.space(&td).unwrap();
    parent_space.activate(&td, kernel.vm().tlb());
    uaccess::user_store(kernel.vm(), &td, &parent_space, VirtAddr::new(heap), 0x5A).unwrap();

    // fork through the dispatcher.
    let disposition = trap(&kernel, &td, &parent, &mut tf, syscall::SYS_FORK, 0, 0, 0, 0);
    let (child, child_tf) = match disposition {
        Disposition::SpawnChild { child, trapframe } => (child, trapframe),
        other => panic!("fork returned {other:?}"),
    };
    // Parent gets the child PID, the child gets zero, both resume past
    // the syscall.
    assert_eq!(value(&tf), child.pid().as_u32());
    assert_eq!(child_tf.v0, 0);
    assert_eq!(child_tf.a3, 0);
    assert_eq!(child_tf.epc, tf.epc);
    assert_eq!(child.parent(&td), Some(parent.pid()));

    // Run the child on its own thread: read 0x5A, overwrite with 0xA5,
    // exit 7.
    let child_thread = {
        let kernel = std::sync::Arc::clone(&kernel);
        let child = std::sync::Arc::clone(&child);
        std::thread::spawn(move || {
            let ctd = Thread::new("child");
            let child_space = child.space(&ctd).unwrap();
            child_space.activate(&ctd, kernel.vm().tlb());
            let seen =
                uaccess::user_load(kernel.vm(), &ctd, &child_space, VirtAddr::new(heap)).unwrap();
            assert_eq!(seen, 0x5A, "child must observe parent's pre-fork store");
            uaccess::user_store(kernel.vm(), &ctd, &child_space, VirtAddr::new(heap), 0xA5)
                .unwrap();

            let mut ctf = Trapframe::default();
            let d = trap(&kernel, &ctd, &child, &mut ctf, syscall::SYS_EXIT, 7, 0, 0, 0);
            match d {
                Disposition::Exited(status) => status,
                other => panic!("_exit returned {other:?}"),
            }
        })
    };
    let exit_status = child_thread.join().unwrap();
    assert!(wait::is_signal(exit_status), "codes 1..=31 encode as signals");
    assert_eq!(wait::status_code(exit_status), 7);

    // waitpid returns the child PID and copies the status out.
    let status_ptr = ualloc(&kernel, &td, &parent, 4);
    let d = trap(
        &kernel,
        &td,
        &parent,
        &mut tf,
        syscall::SYS_WAITPID,
        child.pid().as_u32(),
        status_ptr,
        0,
        0,
    );
    assert!(matches!(d, Disposition::Return));
    assert_eq!(value(&tf), child.pid().as_u32());
    let status_bytes = uread(&kernel, &td, &parent, status_ptr, 4);
    let status = i32::from_le_bytes(status_bytes.try_into().unwrap());
    assert_eq!(status, exit_status);

    // Parent's byte is untouched by the child's write.
    let parent_space = parent.space(&td).unwrap();
    parent_space.activate(&td, kernel.vm().tlb());
    let byte =
        uaccess::user_load(kernel.vm(), &td, &parent_space, VirtAddr::new(heap)).unwrap();
    assert_eq!(byte, 0x5A);

    // The zombie is gone: count restored, PID unknown.
    assert_eq!(kernel.process_count(&td), count_before_fork);
    assert!(kernel.pids().lookup(&td, child.pid()).is_none());

    kernel.proc_reap(&td, &parent);
}

#[test]
fn waitpid_blocks_until_child_exits() {
    let (kernel, td) = boot(64, 64);
    let (parent, mut tf) = start_program(&kernel, &td, "emu0:waiter", &[]);
    let count_before_fork = kernel.process_count(&td);

    let d = trap(&kernel, &td, &parent, &mut tf, syscall::SYS_FORK, 0, 0, 0, 0);
    let (child, _child_tf) = match d {
        Disposition::SpawnChild { child, trapframe } => (child, trapframe),
        other => panic!("fork returned {other:?}"),
    };

    // The child exits only after a delay, so the parent's waitpid must
    // actually block on the condition variable.
    let exiter = {
        let kernel = std::sync::Arc::clone(&kernel);
        let child = std::sync::Arc::clone(&child);
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(30));
            let ctd = Thread::new("child");
            let mut ctf = Trapframe::default();
            trap(&kernel, &ctd, &child, &mut ctf, syscall::SYS_EXIT, 0, 0, 0, 0);
        })
    };

    let status_ptr = ualloc(&kernel, &td, &parent, 4);
    trap(
        &kernel,
        &td,
        &parent,
        &mut tf,
        syscall::SYS_WAITPID,
        child.pid().as_u32(),
        status_ptr,
        0,
        0,
    );
    assert_eq!(value(&tf), child.pid().as_u32());
    exiter.join().unwrap();

    // _exit(0) encodes as a normal exit with code 0.
    let status_bytes = uread(&kernel, &td, &parent, status_ptr, 4);
    let status = i32::from_le_bytes(status_bytes.try_into().unwrap());
    assert!(wait::is_exit(status));
    assert_eq!(wait::status_code(status), 0);

    // The fork/exit/wait cycle restored the process count.
    assert_eq!(kernel.process_count(&td), count_before_fork);

    kernel.proc_reap(&td, &parent);
}

#[test]
fn waitpid_error_cases() {
    let (kernel, td) = boot(64, 64);
    let (proc, mut tf) = start_program(&kernel, &td, "emu0:errors", &[]);

    // Unknown PID.
    trap(&kernel, &td, &proc, &mut tf, syscall::SYS_WAITPID, 31000, 0, 0, 0);
    assert_eq!(errno(&tf), KernelError::NoSuchProcess.errno());

    // Not a child of the caller (the process itself qualifies).
    trap(
        &kernel,
        &td,
        &proc,
        &mut tf,
        syscall::SYS_WAITPID,
        proc.pid().as_u32(),
        0,
        0,
        0,
    );
    assert_eq!(errno(&tf), KernelError::NotChild.errno());

    // Nonzero options are rejected.
    let d = trap(&kernel, &td, &proc, &mut tf, syscall::SYS_FORK, 0, 0, 0, 0);
    let child = match d {
        Disposition::SpawnChild { child, .. } => child,
        other => panic!("fork returned {other:?}"),
    };
    trap(
        &kernel,
        &td,
        &proc,
        &mut tf,
        syscall::SYS_WAITPID,
        child.pid().as_u32(),
        0,
        1,
        0,
    );
    assert_eq!(errno(&tf), KernelError::Invalid.errno());

    // Clean up: exit the child and reap it properly.
    {
        let ctd = Thread::new("child");
        let mut ctf = Trapframe::default();
        trap(&kernel, &ctd, &child, &mut ctf, syscall::SYS_EXIT, 0, 0, 0, 0);
    }
    trap(
        &kernel,
        &td,
        &proc,
        &mut tf,
        syscall::SYS_WAITPID,
        child.pid().as_u32(),
        0,
        0,
        0,
    );
    assert_eq!(value(&tf), child.pid().as_u32());
    kernel.proc_reap(&td, &proc);
}

#[test]
fn zombie_lingers_until_reaped() {
    let (kernel, td) = boot(64, 64);
    let (parent, mut tf) = start_program(&kernel, &td, "emu0:zombie", &[]);

    let d = trap(&kernel, &td, &parent, &mut tf, syscall::SYS_FORK, 0, 0, 0, 0);
    let child = match d {
        Disposition::SpawnChild { child, .. } => child,
        other => panic!("fork returned {other:?}"),
    };
    let child_pid = child.pid();

    {
        let ctd = Thread::new("child");
        let mut ctf = Trapframe::default();
        trap(&kernel, &ctd, &child, &mut ctf, syscall::SYS_EXIT, 42, 0, 0, 0);
    }

    // Exited but not reaped: still in the PID table.
    assert!(child.has_exited(&td));
    assert!(kernel.pids().lookup(&td, child_pid).is_some());

    trap(
        &kernel,
        &td,
        &parent,
        &mut tf,
        syscall::SYS_WAITPID,
        child_pid.as_u32(),
        0,
        0,
        0,
    );
    assert_eq!(value(&tf), child_pid.as_u32());
    assert!(kernel.pids().lookup(&td, child_pid).is_none());

    kernel.proc_reap(&td, &parent);
}

#[test]
fn fork_shares_open_files_with_bumped_refcounts() {
    let (kernel, td) = boot(64, 64);
    let (parent, mut tf) = start_program(&kernel, &td, "emu0:fdfork", &[]);

    let stdout = parent.fdtable().get(&td, pion_core::id::Fd::STDOUT).unwrap();
    let before = std::sync::Arc::strong_count(&stdout);

    let d = trap(&kernel, &td, &parent, &mut tf, syscall::SYS_FORK, 0, 0, 0, 0);
    let child = match d {
        Disposition::SpawnChild { child, .. } => child,
        other => panic!("fork returned {other:?}"),
    };

    // The child's slot references the same handle.
    assert_eq!(std::sync::Arc::strong_count(&stdout), before + 1);
    let child_stdout = child.fdtable().get(&td, pion_core::id::Fd::STDOUT).unwrap();
    assert!(std::sync::Arc::ptr_eq(&stdout, &child_stdout));
    drop(child_stdout);

    // Exit drops the child's references.
    {
        let ctd = Thread::new("child");
        let mut ctf = Trapframe::default();
        trap(&kernel, &ctd, &child, &mut ctf, syscall::SYS_EXIT, 0, 0, 0, 0);
    }
    assert_eq!(std::sync::Arc::strong_count(&stdout), before);

    trap(
        &kernel,
        &td,
        &parent,
        &mut tf,
        syscall::SYS_WAITPID,
        child.pid().as_u32(),
        0,
        0,
        0,
    );
    value(&tf);
    kernel.proc_reap(&td, &parent);
}

#[test]
fn pid_zero_is_never_a_user_process() {
    let (kernel, td) = boot(64, 64);
    assert!(kernel.pids().lookup(&td, Pid::KERNEL).is_none());
    assert_eq!(kernel.kproc().pid(), Pid::KERNEL);
}
