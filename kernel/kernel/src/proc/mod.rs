//! Processes and the PID table.
//!
//! A process couples a PID, the parent/child links (kept as PIDs, never
//! pointers, so the graph has no cycles), an address-space slot, a
//! current directory, a descriptor table, and the exit rendezvous its
//! parent blocks on. Exited processes linger as zombies until the parent
//! reaps them in `waitpid`; only reaping frees the PID.

pub mod binfmt;
pub mod exec;
pub mod wait;

use alloc::borrow::ToOwned;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use pion_core::id::Pid;
use pion_core::limits::{PID_MAX, PID_MIN};
use pion_core::sync::{Condvar, SleepLock, SpinLock};
use pion_core::thread::Thread;
use pion_core::{KernelError, Result};
use pion_fs::file::FdTable;
use pion_mm::address_space::AddressSpace;

struct ProcInner {
    parent: Option<Pid>,
    children: Vec<Pid>,
    space: Option<Arc<AddressSpace>>,
    cwd: String,
}

struct ExitState {
    has_exited: bool,
    status: i32,
}

/// A process.
pub struct Process {
    name: String,
    pid: Pid,
    /// Short internal mutations: links, address-space slot, cwd.
    inner: SpinLock<ProcInner>,
    /// Wait/exit rendezvous: waiters sleep on the condition variable
    /// until `has_exited` flips.
    exit: SleepLock<ExitState>,
    exit_cv: Condvar,
    fdtable: FdTable,
}

impl Process {
    pub(crate) fn new(name: &str, pid: Pid) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_owned(),
            pid,
            inner: SpinLock::new(ProcInner {
                parent: None,
                children: Vec::new(),
                space: None,
                cwd: String::new(),
            }),
            exit: SleepLock::new(ExitState {
                has_exited: false,
                status: 0,
            }),
            exit_cv: Condvar::new(),
            fdtable: FdTable::new(),
        })
    }

    /// The process id.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// The process name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The per-process descriptor table.
    pub fn fdtable(&self) -> &FdTable {
        &self.fdtable
    }

    /// The current address space, if any.
    pub fn space(&self, td: &Thread) -> Option<Arc<AddressSpace>> {
        self.inner.lock(td).space.clone()
    }

    /// Replaces the address space, returning the old one for disposal.
    pub fn set_space(
        &self,
        td: &Thread,
        space: Option<Arc<AddressSpace>>,
    ) -> Option<Arc<AddressSpace>> {
        let mut inner = self.inner.lock(td);
        core::mem::replace(&mut inner.space, space)
    }

    /// The current working directory (a volume prefix such as `emu0:`).
    pub fn cwd(&self, td: &Thread) -> String {
        self.inner.lock(td).cwd.clone()
    }

    /// Replaces the current working directory.
    pub fn set_cwd(&self, td: &Thread, cwd: &str) {
        self.inner.lock(td).cwd = cwd.to_owned();
    }

    /// The parent's PID, if the process has one.
    pub fn parent(&self, td: &Thread) -> Option<Pid> {
        self.inner.lock(td).parent
    }

    pub(crate) fn set_parent(&self, td: &Thread, parent: Option<Pid>) {
        self.inner.lock(td).parent = parent;
    }

    pub(crate) fn add_child(&self, td: &Thread, child: Pid) {
        self.inner.lock(td).children.push(child);
    }

    pub(crate) fn remove_child(&self, td: &Thread, child: Pid) {
        let mut inner = self.inner.lock(td);
        inner.children.retain(|c| *c != child);
    }

    /// PIDs of the live children.
    pub fn children(&self, td: &Thread) -> Vec<Pid> {
        self.inner.lock(td).children.clone()
    }

    /// Whether the process has exited (and is a zombie until reaped).
    pub fn has_exited(&self, td: &Thread) -> bool {
        self.exit.acquire(td).has_exited
    }

    /// Records the encoded exit status and wakes every waiter.
    pub(crate) fn mark_exited(&self, td: &Thread, status: i32) {
        let mut exit = self.exit.acquire(td);
        assert!(!exit.has_exited, "process {} exited twice", self.pid);
        exit.status = status;
        exit.has_exited = true;
        self.exit_cv.broadcast(&exit);
    }

    /// Blocks until the process exits, then returns the encoded status.
    pub fn wait_for_exit(&self, td: &Thread) -> i32 {
        let mut exit = self.exit.acquire(td);
        while !exit.has_exited {
            exit = self.exit_cv.wait(exit);
        }
        exit.status
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A PID-table slot: reserved during creation, then holding the process.
type PidSlot = Option<Arc<Process>>;

struct PidTableInner {
    slots: BTreeMap<Pid, PidSlot>,
    next_pid: u32,
}

/// The process-wide PID table.
pub struct PidTable {
    inner: SpinLock<PidTableInner>,
}

impl PidTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: SpinLock::new(PidTableInner {
                slots: BTreeMap::new(),
                next_pid: PID_MIN,
            }),
        }
    }

    /// Registers the kernel process under its fixed PID below `PID_MIN`.
    pub(crate) fn register_system(&self, td: &Thread, proc: &Arc<Process>) {
        assert!(proc.pid().as_u32() < PID_MIN, "system PIDs sit below PID_MIN");
        let mut inner = self.inner.lock(td);
        let prev = inner.slots.insert(proc.pid(), Some(Arc::clone(proc)));
        assert!(prev.is_none(), "system PID {} double-registered", proc.pid());
    }

    /// Reserves a free PID, scanning circularly from the last handed out.
    /// Every slot in `[PID_MIN, PID_MAX)` is usable.
    pub(crate) fn reserve(&self, td: &Thread) -> Result<Pid> {
        let span = PID_MAX - PID_MIN;
        let mut inner = self.inner.lock(td);
        for i in 0..span {
            let raw = PID_MIN + (inner.next_pid - PID_MIN + i) % span;
            let pid = Pid::new(raw);
            if !inner.slots.contains_key(&pid) {
                inner.slots.insert(pid, None);
                inner.next_pid = PID_MIN + (raw - PID_MIN + 1) % span;
                return Ok(pid);
            }
        }
        Err(KernelError::ProcessTableFull)
    }

    /// Fills a reserved slot.
    pub(crate) fn install(&self, td: &Thread, pid: Pid, proc: &Arc<Process>) {
        let mut inner = self.inner.lock(td);
        let slot = inner
            .slots
            .get_mut(&pid)
            .unwrap_or_else(|| panic!("install into unreserved PID {pid}"));
        assert!(slot.is_none(), "PID {pid} installed twice");
        *slot = Some(Arc::clone(proc));
    }

    /// Looks a user process up by PID. The kernel process (and any other
    /// system PID) is never returned.
    pub fn lookup(&self, td: &Thread, pid: Pid) -> Option<Arc<Process>> {
        if pid.as_u32() < PID_MIN {
            return None;
        }
        let inner = self.inner.lock(td);
        inner.slots.get(&pid).and_then(|slot| slot.clone())
    }

    /// Frees a PID after the process has been reaped.
    ///
    /// # Panics
    ///
    /// Panics if the PID is not present; that is a table inconsistency,
    /// not a caller error.
    pub(crate) fn free(&self, td: &Thread, pid: Pid) {
        let mut inner = self.inner.lock(td);
        let removed = inner.slots.remove(&pid);
        assert!(removed.is_some(), "freeing unallocated PID {pid}");
    }

    /// Number of live entries (reserved or installed), kernel process
    /// included.
    pub fn len(&self, td: &Thread) -> usize {
        self.inner.lock(td).slots.len()
    }

    /// True when no process at all is registered.
    pub fn is_empty(&self, td: &Thread) -> bool {
        self.len(td) == 0
    }
}
