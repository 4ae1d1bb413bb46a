//! Kernel logger: a bounded ring buffer behind the `log` facade.
//!
//! On real hardware this would feed the serial console; here the records
//! accumulate in memory and the embedder (or a test) drains them. The
//! buffer uses a `spin::Mutex` because the global logger is reached from
//! contexts that carry no thread handle.

use alloc::collections::VecDeque;
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use log::{LevelFilter, Log, Metadata, Record};

/// Records retained before the oldest is dropped.
const CAPACITY: usize = 1024;

struct RingLogger {
    buf: spin::Mutex<VecDeque<String>>,
}

impl Log for RingLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        let line = format!(
            "[{:5}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
        let mut buf = self.buf.lock();
        if buf.len() == CAPACITY {
            buf.pop_front();
        }
        buf.push_back(line);
    }

    fn flush(&self) {}
}

static LOGGER: RingLogger = RingLogger {
    buf: spin::Mutex::new(VecDeque::new()),
};

/// Installs the ring logger. Safe to call more than once; later calls are
/// no-ops (the facade accepts exactly one logger per process).
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Drains and returns everything logged so far.
pub fn drain() -> Vec<String> {
    LOGGER.buf.lock().drain(..).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_records() {
        init();
        log::info!(target: "klog-test", "hello {}", 42);
        let lines = drain();
        assert!(
            lines.iter().any(|l| l.contains("klog-test") && l.contains("hello 42")),
            "missing record in {lines:?}"
        );
    }
}
