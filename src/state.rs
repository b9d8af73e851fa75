//! Shared state bundle: one independently allocated segment per data
//! model structure, plus the per-role "shed" step that detaches whatever
//! a worker does not need. This is the privilege-separation boundary --
//! grounded in `clear_drop_access`/`encrypt_drop_access`/
//! `decrypt_drop_access`/`keying_drop_access`, each of which detaches a
//! different subset of `struct signsky_proc_io`'s segments.
//!
//! The four rings are named after where a packet is headed rather than
//! which worker owns them, to avoid the "clear ring vs clear process"
//! ambiguity the `io->clear`/`io->encrypt` naming invites:
//!
//! - `to_encrypt`: plaintext tun packets waiting for the encrypt worker.
//! - `to_crypto`: ciphertext packets waiting to go out over the wire.
//! - `to_decrypt`: ciphertext packets received off the wire.
//! - `to_clear`: plaintext packets waiting to be written to the tun device.

use crate::counters::Counters;
use crate::error::SetupError;
use crate::keyslot::KeySlot;
use crate::packet::PoolStore;
use crate::peer::PeerCell;
use crate::proc::ProcType;
use crate::replay::ReplayWindow;
use crate::ring::Ring;
use crate::shm::Segment;

/// Live capacity of every ring. Must be a power of two and fit within
/// `Ring`'s fixed 4096-slot backing array.
pub const RING_CAPACITY: usize = 2048;

pub struct State {
    pub to_clear: Option<Segment<Ring>>,
    pub to_encrypt: Option<Segment<Ring>>,
    pub to_crypto: Option<Segment<Ring>>,
    pub to_decrypt: Option<Segment<Ring>>,
    pub pool: Option<Segment<PoolStore>>,
    pub tx_key: Option<Segment<KeySlot>>,
    pub rx_key: Option<Segment<KeySlot>>,
    pub replay: Option<Segment<ReplayWindow>>,
    pub peer: Option<Segment<PeerCell>>,
    pub counters: Option<Segment<Counters>>,
}

impl State {
    /// Allocate and initialize every segment. Must run in the supervisor
    /// before any `fork()`, so every child inherits the attachments it
    /// will keep and can cleanly detach the ones it won't.
    pub fn create() -> Result<State, SetupError> {
        let to_clear = Segment::<Ring>::create()?;
        let to_encrypt = Segment::<Ring>::create()?;
        let to_crypto = Segment::<Ring>::create()?;
        let to_decrypt = Segment::<Ring>::create()?;
        let pool = Segment::<PoolStore>::create()?;
        let tx_key = Segment::<KeySlot>::create()?;
        let rx_key = Segment::<KeySlot>::create()?;
        let replay = Segment::<ReplayWindow>::create()?;
        let peer = Segment::<PeerCell>::create()?;
        let counters = Segment::<Counters>::create()?;

        unsafe {
            Ring::init(to_clear.as_ptr(), RING_CAPACITY);
            Ring::init(to_encrypt.as_ptr(), RING_CAPACITY);
            Ring::init(to_crypto.as_ptr(), RING_CAPACITY);
            Ring::init(to_decrypt.as_ptr(), RING_CAPACITY);
            PoolStore::init(pool.as_ptr());
            KeySlot::init(tx_key.as_ptr());
            KeySlot::init(rx_key.as_ptr());
            ReplayWindow::init(replay.as_ptr());
            PeerCell::init(peer.as_ptr());
            Counters::init(counters.as_ptr());
        }

        Ok(State {
            to_clear: Some(to_clear),
            to_encrypt: Some(to_encrypt),
            to_crypto: Some(to_crypto),
            to_decrypt: Some(to_decrypt),
            pool: Some(pool),
            tx_key: Some(tx_key),
            rx_key: Some(rx_key),
            replay: Some(replay),
            peer: Some(peer),
            counters: Some(counters),
        })
    }

    /// Detach every segment this role does not need. Called once, right
    /// after `fork()`, in the child.
    pub fn shed_for(&mut self, kind: ProcType) {
        let keep: &[&str] = match kind {
            ProcType::Clear => &["to_clear", "to_encrypt", "pool"],
            ProcType::Crypto => &["to_crypto", "to_decrypt", "pool", "peer", "replay"],
            ProcType::Encrypt => &["tx_key", "to_encrypt", "to_crypto", "counters", "pool"],
            ProcType::Decrypt => &["rx_key", "to_decrypt", "to_clear", "replay", "counters", "pool", "peer"],
            ProcType::Keying => &["tx_key", "rx_key"],
            ProcType::Status => &["counters"],
        };

        macro_rules! shed_unless_kept {
            ($field:ident) => {
                if !keep.contains(&stringify!($field)) {
                    self.$field = None;
                }
            };
        }

        shed_unless_kept!(to_clear);
        shed_unless_kept!(to_encrypt);
        shed_unless_kept!(to_crypto);
        shed_unless_kept!(to_decrypt);
        shed_unless_kept!(pool);
        shed_unless_kept!(tx_key);
        shed_unless_kept!(rx_key);
        shed_unless_kept!(replay);
        shed_unless_kept!(peer);
        shed_unless_kept!(counters);
    }
}

/// Borrow the inner value of a segment a worker is known to have kept.
/// Panics if the segment was detached -- a worker reaching for a segment
/// its own `shed_for` match didn't retain is a programming error, not a
/// recoverable condition.
pub fn require<T>(segment: &Option<Segment<T>>) -> &'static T {
    let segment = segment
        .as_ref()
        .expect("segment required by this worker was detached");
    unsafe { &*segment.as_ptr() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn shed_for_clear_keeps_only_its_own_segments() {
        let mut state = State::create().expect("create shared state");
        state.shed_for(ProcType::Clear);

        assert!(state.to_clear.is_some());
        assert!(state.to_encrypt.is_some());
        assert!(state.pool.is_some());

        assert!(state.to_crypto.is_none());
        assert!(state.to_decrypt.is_none());
        assert!(state.tx_key.is_none());
        assert!(state.rx_key.is_none());
        assert!(state.replay.is_none());
        assert!(state.peer.is_none());
        assert!(state.counters.is_none());
    }

    #[test]
    #[serial]
    fn shed_for_keying_keeps_only_key_slots() {
        let mut state = State::create().expect("create shared state");
        state.shed_for(ProcType::Keying);

        assert!(state.tx_key.is_some());
        assert!(state.rx_key.is_some());
        assert!(state.to_clear.is_none());
        assert!(state.to_encrypt.is_none());
        assert!(state.to_crypto.is_none());
        assert!(state.to_decrypt.is_none());
        assert!(state.pool.is_none());
        assert!(state.replay.is_none());
        assert!(state.peer.is_none());
        assert!(state.counters.is_none());
    }

    #[test]
    #[serial]
    fn shed_for_status_keeps_only_counters() {
        let mut state = State::create().expect("create shared state");
        state.shed_for(ProcType::Status);

        assert!(state.counters.is_some());

        assert!(state.to_clear.is_none());
        assert!(state.to_encrypt.is_none());
        assert!(state.to_crypto.is_none());
        assert!(state.to_decrypt.is_none());
        assert!(state.pool.is_none());
        assert!(state.tx_key.is_none());
        assert!(state.rx_key.is_none());
        assert!(state.replay.is_none());
        assert!(state.peer.is_none());
    }
}
