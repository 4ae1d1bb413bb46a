//! Software-refilled translation lookaside buffer.
//!
//! 64 entries mapping VPN to PFN with valid/dirty bits. Refill is entirely
//! in software: a miss raises a fault and the fault handler installs an
//! entry through the random-replacement register, modeled as an xorshift
//! generator. All TLB operations run under a spinlock, the stand-in for
//! performing them with interrupts raised.

use bitflags::bitflags;
use pion_core::sync::SpinLock;
use pion_core::thread::Thread;

/// Number of TLB entries.
pub const NUM_TLB: usize = 64;

bitflags! {
    /// Permission and state bits of a TLB entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TlbFlags: u8 {
        /// The entry maps a page.
        const VALID = 0b01;
        /// Writes through this entry are permitted.
        const DIRTY = 0b10;
    }
}

#[derive(Clone, Copy)]
struct TlbEntry {
    vpn: u32,
    pfn: u32,
    flags: TlbFlags,
}

impl TlbEntry {
    const INVALID: TlbEntry = TlbEntry {
        vpn: 0,
        pfn: 0,
        flags: TlbFlags::empty(),
    };
}

struct TlbInner {
    entries: [TlbEntry; NUM_TLB],
    random: u64,
}

impl TlbInner {
    fn find(&self, vpn: u32) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.flags.contains(TlbFlags::VALID) && e.vpn == vpn)
    }

    fn next_random(&mut self) -> usize {
        // xorshift64; never zero by construction.
        let mut x = self.random;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.random = x;
        (x % NUM_TLB as u64) as usize
    }
}

/// The machine TLB.
pub struct Tlb {
    inner: SpinLock<TlbInner>,
}

impl Tlb {
    /// Creates a TLB with every entry invalid.
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(TlbInner {
                entries: [TlbEntry::INVALID; NUM_TLB],
                random: 0x9E37_79B9_7F4A_7C15,
            }),
        }
    }

    /// Looks up `vpn`. Returns the mapped PFN and flags on a hit.
    pub fn probe(&self, td: &Thread, vpn: u32) -> Option<(u32, TlbFlags)> {
        let inner = self.inner.lock(td);
        inner.find(vpn).map(|i| {
            let e = inner.entries[i];
            (e.pfn, e.flags)
        })
    }

    /// Installs a mapping through the random-replacement register.
    ///
    /// If `vpn` is already present its slot is reused: the hardware traps
    /// on duplicate VPNs, so the refill path must never create one.
    pub fn write_random(&self, td: &Thread, vpn: u32, pfn: u32, writable: bool) {
        let mut flags = TlbFlags::VALID;
        if writable {
            flags |= TlbFlags::DIRTY;
        }
        let mut inner = self.inner.lock(td);
        let slot = match inner.find(vpn) {
            Some(i) => i,
            None => inner.next_random(),
        };
        inner.entries[slot] = TlbEntry { vpn, pfn, flags };
    }

    /// Drops any entry mapping `vpn`.
    pub fn invalidate(&self, td: &Thread, vpn: u32) {
        let mut inner = self.inner.lock(td);
        if let Some(i) = inner.find(vpn) {
            inner.entries[i] = TlbEntry::INVALID;
        }
    }

    /// Invalidates every entry. Used on address-space activation.
    pub fn flush_all(&self, td: &Thread) {
        let mut inner = self.inner.lock(td);
        inner.entries = [TlbEntry::INVALID; NUM_TLB];
    }
}

impl Default for Tlb {
    fn default() -> Self {
        Self::new()
    }
}
