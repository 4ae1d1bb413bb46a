//! Condition variable over [`SleepLock`] guards.
//!
//! [`wait`](Condvar::wait) consumes the caller's sleep-lock guard,
//! atomically releases the lock and parks on the condition variable, then
//! re-acquires and returns a fresh guard. Passing the guard (rather than
//! the lock) makes the hold-the-lock contract impossible to violate.
//! Wakeups may be spurious; callers recheck their predicate in a loop.

use super::sleeplock::SleepLockGuard;
use super::spinlock::SpinLock;
use super::wchan::WaitChannel;

/// A condition variable.
pub struct Condvar {
    gate: SpinLock<()>,
    wchan: WaitChannel,
}

impl Condvar {
    /// Creates a new condition variable.
    pub const fn new() -> Self {
        Self {
            gate: SpinLock::new(()),
            wchan: WaitChannel::new(),
        }
    }

    /// Atomically releases the guard's sleep lock and sleeps until
    /// signaled, then re-acquires the lock and returns a new guard.
    ///
    /// ```ignore
    /// let mut st = lock.acquire(td);
    /// while !st.ready {
    ///     st = cv.wait(st);
    /// }
    /// ```
    pub fn wait<'a, T>(&self, guard: SleepLockGuard<'a, T>) -> SleepLockGuard<'a, T> {
        let td = guard.thread();
        let lock = guard.lock_ref();

        // Take the CV's internal spinlock before releasing the sleep lock:
        // a signaler must pass through the same spinlock, so a signal sent
        // between our release and our sleep cannot be lost.
        let gate = self.gate.lock(td);
        drop(guard);
        let gate = self.wchan.sleep(gate);
        drop(gate);

        lock.acquire(td)
    }

    /// Wakes one waiter. The caller must hold the sleep lock the waiters
    /// used, witnessed by `held`.
    pub fn signal<T>(&self, held: &SleepLockGuard<'_, T>) {
        let gate = self.gate.lock(held.thread());
        self.wchan.wake_one(&gate);
    }

    /// Wakes all waiters. The caller must hold the sleep lock the waiters
    /// used, witnessed by `held`.
    pub fn broadcast<T>(&self, held: &SleepLockGuard<'_, T>) {
        let gate = self.gate.lock(held.thread());
        self.wchan.wake_all(&gate);
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}
