//! Readers-writer lock with writer preference.
//!
//! Built on a sleep lock and a condition variable. State tracks the set of
//! active reader threads, the number of waiting writers, and the active
//! writer. New readers are held off while any writer is active *or
//! waiting*, so a stream of readers cannot starve a writer. The last
//! reader out, and a releasing writer, broadcast the condition variable.

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::condvar::Condvar;
use super::sleeplock::SleepLock;
use crate::thread::{Thread, ThreadId};

struct RwState {
    active_readers: Vec<ThreadId>,
    waiting_writers: u32,
    active_writer: Option<ThreadId>,
}

/// A blocking readers-writer lock protecting `T`.
pub struct RwLock<T> {
    state: SleepLock<RwState>,
    cv: Condvar,
    data: UnsafeCell<T>,
}

// SAFETY: Readers get shared access (`T: Sync`), the writer exclusive
// access (`T: Send`); the state protocol enforces the exclusion.
unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new unlocked `RwLock` wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            state: SleepLock::new(RwState {
                active_readers: Vec::new(),
                waiting_writers: 0,
                active_writer: None,
            }),
            cv: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquires a shared read lock.
    ///
    /// Blocks while a writer is active or any writer is waiting.
    pub fn acquire_read<'a>(&'a self, td: &'a Thread) -> RwLockReadGuard<'a, T> {
        let mut st = self.state.acquire(td);
        while st.waiting_writers > 0 || st.active_writer.is_some() {
            st = self.cv.wait(st);
        }
        st.active_readers.push(td.id());
        drop(st);
        RwLockReadGuard { lock: self, td }
    }

    /// Acquires the exclusive write lock.
    ///
    /// Registers as a waiting writer first, which blocks new readers, then
    /// waits for the lock to drain.
    pub fn acquire_write<'a>(&'a self, td: &'a Thread) -> RwLockWriteGuard<'a, T> {
        let mut st = self.state.acquire(td);
        st.waiting_writers += 1;
        while !st.active_readers.is_empty() || st.active_writer.is_some() {
            st = self.cv.wait(st);
        }
        debug_assert!(st.active_readers.is_empty());
        st.waiting_writers -= 1;
        st.active_writer = Some(td.id());
        drop(st);
        RwLockWriteGuard { lock: self, td }
    }

    /// Number of currently active readers, for diagnostics and tests.
    pub fn active_readers(&self, td: &Thread) -> usize {
        self.state.acquire(td).active_readers.len()
    }

    /// Number of writers currently waiting, for diagnostics and tests.
    pub fn waiting_writers(&self, td: &Thread) -> u32 {
        self.state.acquire(td).waiting_writers
    }

    fn release_read(&self, td: &Thread) {
        let mut st = self.state.acquire(td);
        let pos = st
            .active_readers
            .iter()
            .position(|id| *id == td.id())
            .unwrap_or_else(|| {
                panic!("rwlock: read release by '{}' which holds no read lock", td.name())
            });
        st.active_readers.swap_remove(pos);
        if st.active_readers.is_empty() {
            self.cv.broadcast(&st);
        }
    }

    fn release_write(&self, td: &Thread) {
        let mut st = self.state.acquire(td);
        assert_eq!(
            st.active_writer,
            Some(td.id()),
            "rwlock: write release by '{}' which is not the writer",
            td.name()
        );
        st.active_writer = None;
        self.cv.broadcast(&st);
    }
}

/// Shared-access RAII guard for [`RwLock`].
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    td: &'a Thread,
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: Read guards coexist only with other readers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read(self.td);
    }
}

/// Exclusive-access RAII guard for [`RwLock`].
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    td: &'a Thread,
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The write guard is exclusive.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The write guard is exclusive.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write(self.td);
    }
}
