//! Wall clock.
//!
//! A monotonically advancing nanosecond counter. Real hardware would tick
//! it from a timer interrupt; the embedder (or a test) advances it
//! explicitly.

use core::sync::atomic::{AtomicU64, Ordering};

/// Nanoseconds per second.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// The machine clock.
pub struct Clock {
    nanos: AtomicU64,
}

impl Clock {
    /// Creates a clock reading `epoch_secs` seconds.
    pub fn new(epoch_secs: u64) -> Self {
        Self {
            nanos: AtomicU64::new(epoch_secs * NANOS_PER_SEC),
        }
    }

    /// Current time as (seconds, nanoseconds-within-second).
    pub fn now(&self) -> (u64, u32) {
        let n = self.nanos.load(Ordering::Acquire);
        (n / NANOS_PER_SEC, (n % NANOS_PER_SEC) as u32)
    }

    /// Advances the clock by `nanos` nanoseconds.
    pub fn advance(&self, nanos: u64) {
        self.nanos.fetch_add(nanos, Ordering::AcqRel);
    }
}
