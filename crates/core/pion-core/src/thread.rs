//! The current-thread handle.
//!
//! The kernel has no ambient `curthread`; every operation that cares about
//! the calling thread takes a `&Thread` explicitly. The handle carries the
//! bookkeeping the synchronization layer needs: how many spinlocks the
//! thread holds (spinlock acquire stands in for disabling interrupts on
//! the local CPU) and whether it is running in interrupt context.
//!
//! A `Thread` belongs to exactly one executing thread and is deliberately
//! not `Sync`.

use alloc::borrow::ToOwned;
use alloc::string::String;
use core::cell::Cell;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Identifies a thread for lock-ownership checks.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ThreadId(u64);

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// Per-thread state threaded through the core by reference.
pub struct Thread {
    id: ThreadId,
    name: String,
    spinlocks_held: Cell<u32>,
    in_interrupt: Cell<bool>,
}

impl Thread {
    /// Creates a handle for the calling thread.
    pub fn new(name: &str) -> Self {
        Self {
            id: ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.to_owned(),
            spinlocks_held: Cell::new(0),
            in_interrupt: Cell::new(false),
        }
    }

    /// This thread's id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// This thread's name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of spinlocks currently held.
    pub fn spinlocks_held(&self) -> u32 {
        self.spinlocks_held.get()
    }

    /// True while executing an interrupt handler.
    pub fn in_interrupt(&self) -> bool {
        self.in_interrupt.get()
    }

    /// Brackets interrupt-context execution.
    pub fn set_in_interrupt(&self, v: bool) {
        self.in_interrupt.set(v);
    }

    /// Asserts that blocking is legal right now: no spinlocks held and not
    /// in interrupt context. Called before every operation that may sleep.
    pub fn assert_can_sleep(&self) {
        assert_eq!(
            self.spinlocks_held.get(),
            0,
            "thread '{}' would sleep while holding {} spinlock(s)",
            self.name,
            self.spinlocks_held.get()
        );
        assert!(
            !self.in_interrupt.get(),
            "thread '{}' would sleep in interrupt context",
            self.name
        );
    }

    pub(crate) fn spinlock_acquired(&self) {
        self.spinlocks_held.set(self.spinlocks_held.get() + 1);
    }

    pub(crate) fn spinlock_released(&self) {
        let held = self.spinlocks_held.get();
        assert!(held > 0, "spinlock release with zero held count");
        self.spinlocks_held.set(held - 1);
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("spinlocks_held", &self.spinlocks_held.get())
            .finish()
    }
}
