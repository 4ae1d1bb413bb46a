//! Synchronization primitives.
//!
//! The substrate is [`SpinLock`] plus [`WaitChannel`]; [`Semaphore`],
//! [`SleepLock`], [`Condvar`], and [`RwLock`] are built on top of them,
//! mirroring the layering of the machine they model: a spinlock acquire
//! disables interrupts on the local CPU (tracked on the [`Thread`] handle),
//! and nothing may block while any spinlock is held.
//!
//! [`Thread`]: crate::thread::Thread

mod condvar;
mod rwlock;
mod semaphore;
mod sleeplock;
mod spinlock;
mod wchan;

pub use condvar::Condvar;
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
pub use wchan::WaitChannel;
