//! Counting semaphore.

use super::spinlock::SpinLock;
use super::wchan::WaitChannel;
use crate::thread::Thread;

/// A counting semaphore built on a spinlock and a wait channel.
///
/// `P` blocks while the count is zero, then decrements; `V` increments and
/// wakes one waiter. No FIFO ordering is guaranteed: a late arrival may
/// win the count over threads that were already waiting.
pub struct Semaphore {
    count: SpinLock<u32>,
    wchan: WaitChannel,
}

impl Semaphore {
    /// Creates a semaphore with `initial` permits.
    pub const fn new(initial: u32) -> Self {
        Self {
            count: SpinLock::new(initial),
            wchan: WaitChannel::new(),
        }
    }

    /// P: waits until the count is positive, then decrements it.
    ///
    /// May block; must not be called from interrupt context.
    pub fn p(&self, td: &Thread) {
        assert!(!td.in_interrupt(), "semaphore P in interrupt context");

        // The semaphore spinlock protects the wait channel as well.
        let mut count = self.count.lock(td);
        while *count == 0 {
            count = self.wchan.sleep(count);
        }
        debug_assert!(*count > 0);
        *count -= 1;
    }

    /// V: increments the count and wakes one waiter. Never blocks.
    pub fn v(&self, td: &Thread) {
        let mut count = self.count.lock(td);
        *count += 1;
        self.wchan.wake_one(&count);
    }

    /// Snapshot of the current count, for diagnostics.
    pub fn count(&self, td: &Thread) -> u32 {
        *self.count.lock(td)
    }
}
