//! The boot sequence and the kernel context it produces.
//!
//! [`Kernel::boot`] runs once: coremap over all of RAM, VFS with the
//! console and the raw swap device mounted, swap map sized from that
//! device, PID table with the kernel process registered. The resulting
//! [`Kernel`] is the process-wide context -- there are no ambient
//! globals; everything takes it by reference.

use alloc::sync::Arc;

use pion_core::id::Pid;
use pion_core::thread::Thread;
use pion_core::Result;
use pion_fs::console::Console;
use pion_fs::memfile::MemFile;
use pion_fs::vfs::Vfs;
use pion_machine::addr::PAGE_SIZE;
use pion_machine::clock::Clock;
use pion_machine::power::Power;
use pion_mm::Vm;

use crate::proc::{PidTable, Process};

/// Boot-time machine description.
#[derive(Debug, Clone, Copy)]
pub struct BootParams {
    /// Physical memory size in pages.
    pub ram_pages: usize,
    /// Frames occupied by the kernel image and the coremap, wired at
    /// boot.
    pub kernel_frames: usize,
    /// Size of the raw swap device in pages.
    pub swap_pages: usize,
    /// Initial wall-clock reading in seconds.
    pub clock_epoch_secs: u64,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            ram_pages: 128,
            kernel_frames: 8,
            swap_pages: 256,
            clock_epoch_secs: 1_000_000,
        }
    }
}

/// The process-wide kernel context.
pub struct Kernel {
    vm: Vm,
    vfs: Vfs,
    pids: PidTable,
    console: Arc<Console>,
    clock: Clock,
    power: Power,
    kproc: Arc<Process>,
}

impl Kernel {
    /// The single boot sequence.
    pub fn boot(td: &Thread, params: BootParams) -> Result<Arc<Self>> {
        let console = Console::new();
        let vfs = Vfs::new();
        vfs.mount_device(td, "con", Arc::clone(&console) as Arc<dyn pion_fs::vnode::Vnode>);
        vfs.mount_device(td, "sd0raw", MemFile::with_size(params.swap_pages * PAGE_SIZE));
        vfs.mount_volume(td, "emu0");

        // The swap map opens its backing store through the VFS like any
        // other consumer.
        let swap_vnode = vfs.resolve(td, "sd0raw:", "")?;
        let vm = Vm::bootstrap(td, params.ram_pages, params.kernel_frames, swap_vnode)?;
        vm.coremap().log_stats(td);

        let pids = PidTable::new();
        let kproc = Process::new("[kernel]", Pid::KERNEL);
        kproc.set_cwd(td, "emu0:");
        pids.register_system(td, &kproc);

        log::info!(
            "pion: booted with {} RAM pages, {} swap pages",
            params.ram_pages,
            params.swap_pages
        );

        Ok(Arc::new(Self {
            vm,
            vfs,
            pids,
            console,
            clock: Clock::new(params.clock_epoch_secs),
            power: Power::new(),
            kproc,
        }))
    }

    /// The virtual-memory context.
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// The mount namespace.
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// The PID table.
    pub fn pids(&self) -> &PidTable {
        &self.pids
    }

    /// The console device.
    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    /// The wall clock.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The power latch.
    pub fn power(&self) -> &Power {
        &self.power
    }

    /// The kernel process (PID 0).
    pub fn kproc(&self) -> &Arc<Process> {
        &self.kproc
    }

    /// Creates a process with a fresh PID and no descriptors. The caller
    /// wires parentage and resources.
    pub fn proc_create(&self, td: &Thread, name: &str) -> Result<Arc<Process>> {
        let pid = self.pids.reserve(td)?;
        let proc = Process::new(name, pid);
        self.pids.install(td, pid, &proc);
        Ok(proc)
    }

    /// Creates a process the runprogram way: parented to the kernel
    /// process, cwd inherited from it, console bound to descriptors
    /// 0/1/2.
    pub fn proc_create_user(&self, td: &Thread, name: &str) -> Result<Arc<Process>> {
        let proc = self.proc_create(td, name)?;
        proc.set_parent(td, Some(self.kproc.pid()));
        self.kproc.add_child(td, proc.pid());
        proc.set_cwd(td, &self.kproc.cwd(td));
        if let Err(e) = proc.fdtable().bind_console(td, &self.vfs) {
            self.proc_reap(td, &proc);
            return Err(e);
        }
        Ok(proc)
    }

    /// Destroys a process record: unlinks it from its parent, releases
    /// any address space it still holds, and frees the PID. Called by
    /// `waitpid` after collecting the status, and on creation failures.
    pub fn proc_reap(&self, td: &Thread, proc: &Arc<Process>) {
        if let Some(parent_pid) = proc.parent(td) {
            if let Some(parent) = self.pids.lookup(td, parent_pid) {
                parent.remove_child(td, proc.pid());
            } else if parent_pid == self.kproc.pid() {
                self.kproc.remove_child(td, proc.pid());
            }
        }
        if let Some(space) = proc.set_space(td, None) {
            space.destroy(td, &self.vm);
        }
        proc.fdtable().close_all(td);
        self.pids.free(td, proc.pid());
    }

    /// Number of registered processes, kernel process included.
    pub fn process_count(&self, td: &Thread) -> usize {
        self.pids.len(td)
    }
}
