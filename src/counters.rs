//! Per-direction observability counters, shared with the status worker.
//!
//! Each direction has exactly one writer (encrypt writes TX counters,
//! decrypt writes RX counters) and any number of readers (the status
//! worker), so plain atomics with no locking are sufficient.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[repr(C)]
pub struct Ifstat {
    spi: AtomicU32,
    pkt: AtomicU64,
    last: AtomicU64,
    bytes: AtomicU64,
}

impl Ifstat {
    pub fn record(&self, spi: u32, bytes: u64, uptime: u64) {
        self.spi.store(spi, Ordering::SeqCst);
        self.pkt.fetch_add(1, Ordering::SeqCst);
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
        self.last.store(uptime, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> IfstatSnapshot {
        IfstatSnapshot {
            spi: self.spi.load(Ordering::SeqCst),
            pkt: self.pkt.load(Ordering::SeqCst),
            last: self.last.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfstatSnapshot {
    pub spi: u32,
    pub pkt: u64,
    pub last: u64,
    pub bytes: u64,
}

impl IfstatSnapshot {
    pub const WIRE_LEN: usize = 4 + 8 + 8 + 8;

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::WIRE_LEN);
        out[0..4].copy_from_slice(&self.spi.to_be_bytes());
        out[4..12].copy_from_slice(&self.pkt.to_be_bytes());
        out[12..20].copy_from_slice(&self.last.to_be_bytes());
        out[20..28].copy_from_slice(&self.bytes.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::WIRE_LEN {
            return None;
        }
        Some(Self {
            spi: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            pkt: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            last: u64::from_be_bytes(buf[12..20].try_into().unwrap()),
            bytes: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

/// Both directions' counters plus the shared daemon uptime clock the
/// supervisor updates once a second.
#[repr(C)]
pub struct Counters {
    pub tx: Ifstat,
    pub rx: Ifstat,
    pub uptime: AtomicU64,
}

impl Counters {
    /// # Safety
    /// `counters` must point at a zero-initialized, appropriately aligned
    /// `Counters`.
    pub unsafe fn init(_counters: *mut Counters) {}
}
