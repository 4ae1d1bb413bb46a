//! Spin-based mutual exclusion lock.
//!
//! Uses test-and-test-and-set (TTAS) to reduce cache-line contention.
//! Acquisition takes the caller's [`Thread`] handle and bumps its
//! held-spinlock count, which models disabling interrupts on the local
//! CPU: while any spinlock is held, blocking operations assert-fail.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::thread::Thread;

/// A spin-based mutual exclusion lock.
///
/// Const-constructable so it can live in long-lived kernel structures.
pub struct SpinLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: The lock ensures exclusive access to `T` via atomic operations.
// `T: Send` is required because the data may be accessed from different
// threads.
unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    /// Creates a new unlocked `SpinLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Returns a [`SpinLockGuard`] that releases the lock when dropped.
    pub fn lock<'a>(&'a self, td: &'a Thread) -> SpinLockGuard<'a, T> {
        loop {
            // Fast path: try to acquire directly.
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                td.spinlock_acquired();
                return SpinLockGuard { lock: self, td };
            }

            // TTAS: spin on a read until the lock looks free.
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire the lock without spinning.
    pub fn try_lock<'a>(&'a self, td: &'a Thread) -> Option<SpinLockGuard<'a, T>> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            td.spinlock_acquired();
            Some(SpinLockGuard { lock: self, td })
        } else {
            None
        }
    }
}

/// RAII guard that releases the [`SpinLock`] when dropped.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    td: &'a Thread,
}

impl<'a, T> SpinLockGuard<'a, T> {
    /// The thread holding this guard.
    pub fn thread(&self) -> &'a Thread {
        self.td
    }

    /// The underlying lock. Used by [`WaitChannel::sleep`] to re-acquire
    /// after the atomic release-and-block.
    ///
    /// [`WaitChannel::sleep`]: super::WaitChannel::sleep
    pub fn lock_ref(&self) -> &'a SpinLock<T> {
        self.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard guarantees exclusive access while it exists.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        self.td.spinlock_released();
    }
}
