//! 64-bit sliding anti-replay window, IPsec-style.
//!
//! `last` is the highest packet number ever accepted; `bitmap` tracks
//! which of the 64 packet numbers at and below `last` have been seen,
//! bit 0 being `last` itself. Two checks exist:
//!
//! - [`ReplayWindow::precheck`]: read-only, used by the crypto worker
//!   before a packet is even handed to decrypt, so obviously-replayed or
//!   obviously-too-old packets never cost an AEAD verification.
//! - [`ReplayWindow::accept`]: authoritative, called by the decrypt
//!   worker only *after* the AEAD tag has verified -- an attacker must
//!   not be able to use the window's side effects as an oracle before
//!   proving they hold the key.
//!
//! Only decrypt ever calls `accept`; the window is otherwise read-only,
//! so there is no concurrent-writer problem to solve here.

use std::sync::atomic::{AtomicU64, Ordering};

pub const WINDOW_SIZE: u64 = 64;

#[repr(C)]
pub struct ReplayWindow {
    last: AtomicU64,
    bitmap: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Newer than anything seen so far.
    Advance,
    /// Within the window, not seen before.
    InWindow,
    /// Already-seen packet number, or older than the window covers.
    Replay,
}

impl ReplayWindow {
    /// # Safety
    /// `window` must point at a zero-initialized, appropriately aligned
    /// `ReplayWindow`.
    pub unsafe fn init(_window: *mut ReplayWindow) {}

    pub fn reset(&self) {
        self.last.store(0, Ordering::SeqCst);
        self.bitmap.store(0, Ordering::SeqCst);
    }

    fn classify(last: u64, bitmap: u64, pn: u64) -> Verdict {
        // Packet number 0 is reserved and never a legitimate value on the
        // wire -- always reject it rather than let it fall through to the
        // ordinary in-window/advance cases.
        if pn == 0 {
            return Verdict::Replay;
        }

        if pn > last {
            return Verdict::Advance;
        }

        let age = last - pn;
        if age >= WINDOW_SIZE {
            return Verdict::Replay;
        }

        if bitmap & (1u64 << age) != 0 {
            Verdict::Replay
        } else {
            Verdict::InWindow
        }
    }

    /// Read-only check: would this packet number currently be accepted?
    /// Never mutates the window.
    pub fn precheck(&self, pn: u64) -> bool {
        let last = self.last.load(Ordering::SeqCst);
        let bitmap = self.bitmap.load(Ordering::SeqCst);
        Self::classify(last, bitmap, pn) != Verdict::Replay
    }

    /// Authoritative check-and-update, to be called only once the AEAD
    /// tag for `pn` has verified. Returns `true` if the packet is
    /// accepted (and the window advances/marks accordingly), `false` if
    /// it must be dropped as a replay.
    pub fn accept(&self, pn: u64) -> bool {
        let last = self.last.load(Ordering::SeqCst);
        let bitmap = self.bitmap.load(Ordering::SeqCst);

        match Self::classify(last, bitmap, pn) {
            Verdict::Replay => false,
            Verdict::InWindow => {
                let age = last - pn;
                self.bitmap.store(bitmap | (1u64 << age), Ordering::SeqCst);
                true
            }
            Verdict::Advance => {
                let shift = pn - last;
                let new_bitmap = if shift >= WINDOW_SIZE {
                    1
                } else {
                    (bitmap << shift) | 1
                };
                self.last.store(pn, Ordering::SeqCst);
                self.bitmap.store(new_bitmap, Ordering::SeqCst);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> Box<ReplayWindow> {
        unsafe { Box::new(std::mem::zeroed()) }
    }

    #[test]
    fn strictly_increasing_sequence_always_accepted() {
        let w = fresh();
        for pn in 1..200u64 {
            assert!(w.accept(pn), "pn {pn} should be accepted");
        }
    }

    #[test]
    fn packet_number_zero_is_always_rejected() {
        let w = fresh();
        assert!(!w.accept(0));
        assert!(!w.precheck(0));

        // Even once the window has advanced, 0 stays rejected as reserved
        // rather than merely "older than the window".
        assert!(w.accept(5));
        assert!(!w.accept(0));
        assert!(!w.precheck(0));
    }

    #[test]
    fn exact_duplicate_is_replay() {
        let w = fresh();
        assert!(w.accept(10));
        assert!(!w.accept(10));
    }

    #[test]
    fn reordered_but_in_window_is_accepted_once() {
        let w = fresh();
        assert!(w.accept(100));
        assert!(w.accept(95));
        assert!(!w.accept(95));
        assert!(w.accept(99));
    }

    #[test]
    fn older_than_window_is_replay() {
        let w = fresh();
        assert!(w.accept(1000));
        assert!(!w.accept(1000 - WINDOW_SIZE));
    }

    #[test]
    fn precheck_does_not_mutate() {
        let w = fresh();
        assert!(w.accept(50));
        assert!(w.precheck(49));
        assert!(w.precheck(49));
        assert!(w.accept(49));
        assert!(!w.precheck(49));
    }
}
