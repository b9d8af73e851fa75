//! The key hand-off protocol between the keying worker and the
//! encrypt/decrypt workers.
//!
//! A slot cycles through four states, each transition owned by exactly
//! one side so no locking is needed:
//!
//! ```text
//!   EMPTY --(keying: derives key)--> GENERATING
//!   GENERATING --(keying: publishes key material)--> PENDING
//!   PENDING --(encrypt/decrypt: begins install)--> INSTALLING
//!   INSTALLING --(encrypt/decrypt: finished install)--> EMPTY
//! ```
//!
//! Observing any state other than the one a transition expects is a
//! fatal invariant violation: it means two actors raced on the same
//! slot, which should be structurally impossible given the ownership
//! split above.

use std::sync::atomic::{AtomicU32, Ordering};

use zeroize::Zeroize;

use crate::cipher::KEY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SlotState {
    Empty = 0,
    Generating = 1,
    Pending = 2,
    Installing = 3,
}

impl SlotState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => SlotState::Empty,
            1 => SlotState::Generating,
            2 => SlotState::Pending,
            3 => SlotState::Installing,
            other => panic!("key slot observed in impossible state {other}"),
        }
    }
}

/// One direction's key slot, living in shared memory.
#[repr(C)]
pub struct KeySlot {
    state: AtomicU32,
    spi: u32,
    salt: u32,
    key: [u8; KEY_LEN],
}

impl KeySlot {
    /// # Safety
    /// `slot` must point at a zero-initialized, appropriately aligned
    /// `KeySlot`. Zero happens to be `SlotState::Empty`, so no further
    /// initialization is required, but the helper documents the intent.
    pub unsafe fn init(_slot: *mut KeySlot) {}

    pub fn state(&self) -> SlotState {
        SlotState::from_u32(self.state.load(Ordering::SeqCst))
    }

    /// Keying-side: claim an empty slot to begin generating a new key.
    /// Fatal if the slot was not actually empty -- two keying workers can
    /// never exist, so this can only mean corrupted shared state.
    pub fn begin_generate(&self) {
        self.transition(SlotState::Empty, SlotState::Generating);
    }

    /// Keying-side: publish the derived key material and move to pending.
    pub fn publish(&mut self, spi: u32, salt: u32, key: &[u8; KEY_LEN]) {
        assert_eq!(self.state(), SlotState::Generating);
        self.spi = spi;
        self.salt = salt;
        self.key.copy_from_slice(key);
        self.transition(SlotState::Generating, SlotState::Pending);
    }

    /// Encrypt/decrypt-side: is there a key waiting to be installed?
    pub fn is_pending(&self) -> bool {
        self.state() == SlotState::Pending
    }

    /// Encrypt/decrypt-side: take ownership of a pending key for install.
    /// Returns `(spi, salt, key)` and leaves the slot in `Installing`.
    /// The shared copy of the key is wiped before returning -- once the
    /// caller has its own copy, the bytes sitting in shared memory serve
    /// no purpose and must not linger.
    pub fn begin_install(&self) -> (u32, u32, [u8; KEY_LEN]) {
        self.transition(SlotState::Pending, SlotState::Installing);
        let spi = self.spi;
        let salt = self.salt;
        let key = self.key;

        // `self` is a shared reference, but the transition above is this
        // role's exclusive license to touch `key` until `finish_install`
        // hands the slot back to `Empty` -- keying never reads it again
        // until then.
        let key_ptr = &self.key as *const [u8; KEY_LEN] as *mut [u8; KEY_LEN];
        unsafe { (*key_ptr).zeroize() };

        (spi, salt, key)
    }

    /// Encrypt/decrypt-side: installation finished, the slot is free for
    /// the next rekey.
    pub fn finish_install(&self) {
        self.transition(SlotState::Installing, SlotState::Empty);
    }

    fn transition(&self, from: SlotState, to: SlotState) {
        let observed = self
            .state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst);
        if observed.is_err() {
            panic!(
                "key slot transition {from:?} -> {to:?} failed: slot was not in the expected state"
            );
        }
    }
}
