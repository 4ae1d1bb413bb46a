//! Wait channel: the parking queue under every blocking primitive.
//!
//! A channel is always paired with a caller-supplied spinlock.
//! [`sleep`](WaitChannel::sleep) atomically releases that spinlock, blocks
//! until the channel is woken, and re-acquires the spinlock before
//! returning. Wakeups are implemented as a generation counter: a sleeper
//! snapshots the generation while still holding the spinlock, so a wake
//! that races with the release cannot be lost. Wakeups may be spurious and
//! are not FIFO; every caller rechecks its predicate in a loop.

use core::sync::atomic::{AtomicU64, Ordering};

use super::spinlock::SpinLockGuard;

/// An opaque parking queue associated with a caller-supplied spinlock.
pub struct WaitChannel {
    generation: AtomicU64,
}

impl WaitChannel {
    /// Creates an empty wait channel.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(0),
        }
    }

    /// Atomically releases the guard's spinlock, blocks until the channel
    /// is woken, and re-acquires the spinlock.
    ///
    /// The calling thread must hold exactly the one spinlock being
    /// released; sleeping with any other spinlock held is a bug.
    pub fn sleep<'a, T>(&self, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
        let td = guard.thread();
        let lock = guard.lock_ref();
        assert_eq!(
            td.spinlocks_held(),
            1,
            "wchan sleep: thread '{}' holds extra spinlocks",
            td.name()
        );
        assert!(
            !td.in_interrupt(),
            "wchan sleep: blocking in interrupt context"
        );

        // Snapshot under the lock: a waker must take the same spinlock
        // before waking, so it cannot bump the generation until we have
        // the ticket.
        let ticket = self.generation.load(Ordering::Acquire);
        drop(guard);

        while self.generation.load(Ordering::Acquire) == ticket {
            core::hint::spin_loop();
        }

        lock.lock(td)
    }

    /// Wakes one sleeper. The caller must hold the channel's paired
    /// spinlock, witnessed by `_held`.
    ///
    /// With generation-based parking a wake may release more than one
    /// sleeper; all of them recheck their predicate, so the effect is
    /// indistinguishable from a wake-one plus spurious wakeups.
    pub fn wake_one<T>(&self, _held: &SpinLockGuard<'_, T>) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Wakes every sleeper. The caller must hold the channel's paired
    /// spinlock, witnessed by `_held`.
    pub fn wake_all<T>(&self, _held: &SpinLockGuard<'_, T>) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
