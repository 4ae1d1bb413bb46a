//! Sleep lock: a blocking mutual-exclusion lock with an owner.
//!
//! Unlike a spinlock, a contended acquire parks the thread on the lock's
//! wait channel. The holder is recorded so that misuse (release by a
//! non-holder) is a fatal error and [`do_i_hold`](SleepLock::do_i_hold)
//! can answer ownership queries, which the condition variable relies on.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::spinlock::SpinLock;
use super::wchan::WaitChannel;
use crate::thread::{Thread, ThreadId};

/// A blocking lock protecting `T`.
pub struct SleepLock<T> {
    holder: SpinLock<Option<ThreadId>>,
    wchan: WaitChannel,
    data: UnsafeCell<T>,
}

// SAFETY: The holder protocol guarantees at most one thread accesses the
// data at a time; `T: Send` lets that access move between threads.
unsafe impl<T: Send> Send for SleepLock<T> {}
unsafe impl<T: Send> Sync for SleepLock<T> {}

impl<T> SleepLock<T> {
    /// Creates a new unlocked `SleepLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            holder: SpinLock::new(None),
            wchan: WaitChannel::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, blocking while another thread holds it.
    ///
    /// # Panics
    ///
    /// Panics on recursive acquisition, in interrupt context, or when any
    /// spinlock is held (blocking would be illegal).
    pub fn acquire<'a>(&'a self, td: &'a Thread) -> SleepLockGuard<'a, T> {
        td.assert_can_sleep();

        let mut holder = self.holder.lock(td);
        assert!(
            *holder != Some(td.id()),
            "sleep lock: recursive acquire by '{}'",
            td.name()
        );
        while holder.is_some() {
            holder = self.wchan.sleep(holder);
        }
        *holder = Some(td.id());
        drop(holder);

        SleepLockGuard { lock: self, td }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_acquire<'a>(&'a self, td: &'a Thread) -> Option<SleepLockGuard<'a, T>> {
        let mut holder = self.holder.lock(td);
        if holder.is_some() {
            return None;
        }
        *holder = Some(td.id());
        drop(holder);
        Some(SleepLockGuard { lock: self, td })
    }

    /// Returns whether the calling thread currently holds the lock.
    pub fn do_i_hold(&self, td: &Thread) -> bool {
        *self.holder.lock(td) == Some(td.id())
    }

    fn release(&self, td: &Thread) {
        let mut holder = self.holder.lock(td);
        match *holder {
            Some(owner) if owner == td.id() => {}
            _ => panic!("sleep lock released by non-holder '{}'", td.name()),
        }
        *holder = None;
        self.wchan.wake_one(&holder);
    }
}

/// RAII guard for a [`SleepLock`]; releases and wakes one waiter on drop.
pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
    td: &'a Thread,
}

impl<'a, T> SleepLockGuard<'a, T> {
    /// The thread holding this guard.
    pub fn thread(&self) -> &'a Thread {
        self.td
    }

    /// The underlying lock. Used by [`Condvar::wait`] to re-acquire after
    /// the atomic release-and-sleep.
    ///
    /// [`Condvar::wait`]: super::Condvar::wait
    pub fn lock_ref(&self) -> &'a SleepLock<T> {
        self.lock
    }
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Holding the guard means holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: Holding the guard means holding the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release(self.td);
    }
}
