//! The console character device, reachable as `con:`.
//!
//! Input arrives from the embedder (on real hardware, the UART interrupt
//! handler) into a bounded queue; reads block until at least one byte is
//! buffered. Output accumulates in a capture buffer the embedder drains.

use alloc::sync::Arc;
use alloc::vec::Vec;

use arrayvec::ArrayVec;
use pion_core::sync::{SpinLock, WaitChannel};
use pion_core::thread::Thread;
use pion_core::Result;
use pion_core::KernelError;

use crate::vnode::Vnode;

/// Capacity of the input queue; excess input is dropped, as a UART would.
const INPUT_BUF: usize = 512;

struct ConsoleInner {
    input: ArrayVec<u8, INPUT_BUF>,
    output: Vec<u8>,
}

/// The console device.
pub struct Console {
    inner: SpinLock<ConsoleInner>,
    readers: WaitChannel,
}

impl Console {
    /// Creates a console with empty buffers.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(ConsoleInner {
                input: ArrayVec::new(),
                output: Vec::new(),
            }),
            readers: WaitChannel::new(),
        })
    }

    /// Feeds input bytes, as the keyboard/UART side would. Returns how
    /// many bytes fit in the queue.
    pub fn push_input(&self, td: &Thread, bytes: &[u8]) -> usize {
        let mut inner = self.inner.lock(td);
        let mut accepted = 0;
        for &b in bytes {
            if inner.input.try_push(b).is_err() {
                break;
            }
            accepted += 1;
        }
        if accepted > 0 {
            self.readers.wake_all(&inner);
        }
        accepted
    }

    /// Drains and returns everything written to the console so far.
    pub fn take_output(&self, td: &Thread) -> Vec<u8> {
        let mut inner = self.inner.lock(td);
        core::mem::take(&mut inner.output)
    }
}

impl Vnode for Console {
    fn read_at(&self, td: &Thread, buf: &mut [u8], _offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.inner.lock(td);
        while inner.input.is_empty() {
            inner = self.readers.sleep(inner);
        }
        let n = buf.len().min(inner.input.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inner.input.remove(0);
        }
        Ok(n)
    }

    fn write_at(&self, td: &Thread, buf: &[u8], _offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock(td);
        inner.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn size(&self, _td: &Thread) -> Result<u64> {
        Err(KernelError::NotSeekable)
    }

    fn is_seekable(&self) -> bool {
        false
    }
}
