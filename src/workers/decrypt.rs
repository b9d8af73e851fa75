//! The decrypt worker: holds the RX security associations (primary and
//! pending, for rekeys) and turns ESP-shaped ciphertext from the wire
//! back into plaintext for the clear side. Ported from `decrypt.c`,
//! with the anti-replay check the original left as a `/* XXX */` stub
//! fully implemented via [`crate::replay::ReplayWindow`].

use crate::cipher::Cipher;
use crate::counters::Counters;
use crate::keyslot::KeySlot;
use crate::packet::{Packet, Pool, Target};
use crate::peer::PeerCell;
use crate::proc::ProcType;
use crate::replay::ReplayWindow;
use crate::ring::Ring;
use crate::sa::Sa;
use crate::signal;
use crate::state::{self, State};
use crate::wire;

pub fn entry(state: &mut State) -> ! {
    state.shed_for(ProcType::Decrypt);

    signal::trap(libc::SIGQUIT);
    signal::ignore(libc::SIGINT);

    let rx_key: &KeySlot = state::require(&state.rx_key);
    let to_decrypt: &Ring = state::require(&state.to_decrypt);
    let to_clear: &Ring = state::require(&state.to_clear);
    let replay: &ReplayWindow = state::require(&state.replay);
    let counters: &Counters = state::require(&state.counters);
    let peer: &PeerCell = state::require(&state.peer);
    let pool = unsafe { Pool::from_raw(state.pool.as_ref().unwrap().as_ptr()) };

    let mut primary = Sa::default();
    let mut pending = Sa::default();

    let mut running = true;
    while running {
        if super::should_stop() {
            running = false;
            continue;
        }

        install_pending_key(rx_key, &mut primary, &mut pending);

        while let Some(idx) = to_decrypt.dequeue() {
            process_packet(
                idx, &pool, &mut primary, &mut pending, replay, to_clear, counters, peer,
            );
        }

        std::thread::sleep(std::time::Duration::from_micros(10));
    }

    log::info!("exiting");
    std::process::exit(0);
}

/// New keys always land in whichever slot has no cipher yet: once
/// `primary` holds a key, further rekeys install into `pending` first
/// and only take over on first successful decrypt under that slot.
pub(crate) fn install_pending_key(slot: &KeySlot, primary: &mut Sa, pending: &mut Sa) {
    if !slot.is_pending() {
        return;
    }

    let (spi, salt, key) = slot.begin_install();
    let cipher = Cipher::new(&zeroize::Zeroizing::new(key));

    if primary.cipher.is_none() {
        primary.install(spi, salt, cipher, 0);
    } else {
        pending.install(spi, salt, cipher, 0);
    }

    slot.finish_install();
}

pub(crate) fn process_packet(
    idx: u32,
    pool: &Pool,
    primary: &mut Sa,
    pending: &mut Sa,
    replay: &ReplayWindow,
    to_clear: &Ring,
    counters: &Counters,
    peer: &PeerCell,
) {
    let packet = unsafe { pool.packet(idx) };
    debug_assert_eq!(packet.target(), Target::Decrypt);

    if packet.len() < wire::TRAIL_LEN + Cipher::overhead() {
        pool.put(idx);
        return;
    }

    if decrypt_with_slot(packet, primary, replay, counters) {
        roam_if_needed(packet, peer);
        release_or_forward(pool, idx, to_clear);
        return;
    }

    if decrypt_with_slot(packet, pending, replay, counters) {
        roam_if_needed(packet, peer);
        release_or_forward(pool, idx, to_clear);
        // `pending`'s key just proved itself: it becomes primary and
        // the old primary key is dropped.
        *primary = std::mem::take(pending);
        return;
    }

    pool.put(idx);
}

/// A packet that has just passed full AEAD verification is trusted: if
/// it arrived from a different source address than the one on file,
/// the peer has roamed (NAT rebinding, mobile handoff) and the cell is
/// updated so the crypto worker starts sending there instead.
fn roam_if_needed(packet: &Packet, peer: &PeerCell) {
    let source = packet.source();
    if source != peer.get() {
        peer.set(source);
    }
}

/// Attempt to verify and decrypt `packet` under `sa`. On success the
/// packet's length and target are updated in place (to be handed to
/// [`release_or_forward`] by the caller) and `true` is returned.
pub(crate) fn decrypt_with_slot(
    packet: &mut Packet,
    sa: &mut Sa,
    replay: &ReplayWindow,
    counters: &Counters,
) -> bool {
    let Some(cipher) = sa.cipher.as_ref() else {
        return false;
    };

    let Some(header) = packet.header() else {
        return false;
    };

    if header.spi != sa.spi || !header.seq_consistent() {
        return false;
    }

    if !replay.precheck(header.pn) {
        return false;
    }

    let nonce = wire::Header::nonce(sa.salt, header.pn);
    let aad = wire::Header::aad(sa.spi, header.pn);

    // `open_in_place` verifies and decrypts within the buffer but does not
    // shrink it -- the tag bytes stay physically present after the
    // returned plaintext length, so that length (not the buffer's own
    // `len()`) is what bounds the real payload from here on.
    let mut scratch = packet.payload().to_vec();
    let Ok(with_trailer_len) = cipher.decrypt(nonce, &aad, &mut scratch) else {
        return false;
    };

    if !replay.accept(header.pn) {
        return false;
    }

    if with_trailer_len < wire::TRAIL_LEN {
        return false;
    }
    let trail_start = with_trailer_len - wire::TRAIL_LEN;
    let Some(trailer) = wire::Trailer::decode(&scratch[trail_start..with_trailer_len]) else {
        return false;
    };
    if !trailer.is_valid() {
        return false;
    }

    let plaintext_len = trail_start;
    packet.set_len(plaintext_len);
    packet.payload_mut().copy_from_slice(&scratch[..plaintext_len]);
    packet.set_target(Target::Clear);

    let uptime = counters.uptime.load(std::sync::atomic::Ordering::SeqCst);
    counters.rx.record(sa.spi, packet.len() as u64, uptime);

    true
}

fn release_or_forward(pool: &Pool, idx: u32, to_clear: &Ring) {
    if to_clear.queue(idx).is_err() {
        pool.put(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PoolStore;
    use crate::wire;
    use std::net::SocketAddrV4;
    use zeroize::Zeroizing;

    fn fresh_pool() -> Box<PoolStore> {
        let mut boxed: Box<PoolStore> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { PoolStore::init(boxed.as_mut() as *mut PoolStore) };
        boxed
    }

    fn fresh_ring(elements: usize) -> Box<Ring> {
        let mut boxed: Box<Ring> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { Ring::init(boxed.as_mut() as *mut Ring, elements) };
        boxed
    }

    fn fresh_replay() -> Box<ReplayWindow> {
        unsafe { Box::new(std::mem::zeroed()) }
    }

    fn fresh_peer() -> Box<PeerCell> {
        unsafe { Box::new(std::mem::zeroed()) }
    }

    fn cipher(byte: u8) -> Cipher {
        Cipher::new(&Zeroizing::new([byte; crate::cipher::KEY_LEN]))
    }

    /// Seals a datagram the way `workers/encrypt.rs` would, independent of
    /// any `Sa`/pn bookkeeping this test wants full control over.
    fn seal(spi: u32, salt: u32, pn: u64, cipher: &Cipher, plaintext: &[u8]) -> Vec<u8> {
        let mut buf = plaintext.to_vec();
        let mut trailer = [0u8; wire::TRAIL_LEN];
        wire::Trailer::IPV4.encode(&mut trailer);
        buf.extend_from_slice(&trailer);

        let nonce = wire::Header::nonce(salt, pn);
        let aad = wire::Header::aad(spi, pn);
        cipher.encrypt(nonce, &aad, &mut buf);

        let header = wire::Header::new(spi, pn);
        let mut datagram = vec![0u8; wire::HEADER_LEN];
        header.encode(&mut datagram);
        datagram.extend_from_slice(&buf);
        datagram
    }

    #[test]
    fn process_packet_decrypts_under_primary_and_forwards_to_clear() {
        let mut store = fresh_pool();
        let pool = unsafe { Pool::from_raw(store.as_mut() as *mut PoolStore) };
        let to_clear = fresh_ring(16);
        let replay = fresh_replay();
        let peer = fresh_peer();
        let counters: Box<Counters> = unsafe { Box::new(std::mem::zeroed()) };

        let mut primary = Sa::default();
        primary.install(0x1234, 0x1234, cipher(9), 0);
        let mut pending = Sa::default();

        let datagram = seal(0x1234, 0x1234, 1, &cipher(9), b"hello over the tunnel");
        let mut handle = pool.get().unwrap();
        handle.raw_mut()[..datagram.len()].copy_from_slice(&datagram);
        handle.set_wire_len(datagram.len());
        handle.set_target(Target::Decrypt);
        handle.set_source("203.0.113.9:4500".parse().unwrap());
        let idx = handle.take_index();

        process_packet(idx, &pool, &mut primary, &mut pending, &replay, &to_clear, &counters, &peer);

        let queued = to_clear.dequeue().expect("decrypted packet should be forwarded to clear");
        let packet = unsafe { pool.packet(queued) };
        assert_eq!(packet.target(), Target::Clear);
        assert_eq!(packet.payload(), b"hello over the tunnel");
        assert_eq!(counters.rx.snapshot().pkt, 1);

        pool.put(queued);
    }

    /// The decrypt worker's own direct mirror of spec.md's peer-roaming
    /// requirement: a packet that authenticates under a new source
    /// address must move the shared peer cell.
    #[test]
    fn process_packet_roams_the_peer_cell_on_a_verified_packet_from_a_new_address() {
        let mut store = fresh_pool();
        let pool = unsafe { Pool::from_raw(store.as_mut() as *mut PoolStore) };
        let to_clear = fresh_ring(16);
        let replay = fresh_replay();
        let peer = fresh_peer();
        let counters: Box<Counters> = unsafe { Box::new(std::mem::zeroed()) };

        let original: SocketAddrV4 = "198.51.100.10:4500".parse().unwrap();
        peer.set(original);

        let mut primary = Sa::default();
        primary.install(0x1, 0x1, cipher(4), 0);
        let mut pending = Sa::default();

        let datagram = seal(0x1, 0x1, 1, &cipher(4), b"roaming packet");
        let mut handle = pool.get().unwrap();
        handle.raw_mut()[..datagram.len()].copy_from_slice(&datagram);
        handle.set_wire_len(datagram.len());
        handle.set_target(Target::Decrypt);
        let roamed: SocketAddrV4 = "198.51.100.10:61234".parse().unwrap();
        handle.set_source(roamed);
        let idx = handle.take_index();

        process_packet(idx, &pool, &mut primary, &mut pending, &replay, &to_clear, &counters, &peer);

        assert_eq!(peer.get(), roamed);
        assert!(to_clear.dequeue().is_some());
    }

    /// Packet number 0 is reserved and must never decrypt, even with a
    /// correctly installed key and a matching SPI.
    #[test]
    fn packet_number_zero_is_rejected_even_with_a_valid_key() {
        let mut store = fresh_pool();
        let pool = unsafe { Pool::from_raw(store.as_mut() as *mut PoolStore) };
        let to_clear = fresh_ring(16);
        let replay = fresh_replay();
        let peer = fresh_peer();
        let counters: Box<Counters> = unsafe { Box::new(std::mem::zeroed()) };

        let mut primary = Sa::default();
        primary.install(0x7, 0x7, cipher(2), 0);
        let mut pending = Sa::default();

        let datagram = seal(0x7, 0x7, 0, &cipher(2), b"pn zero");
        let mut handle = pool.get().unwrap();
        handle.raw_mut()[..datagram.len()].copy_from_slice(&datagram);
        handle.set_wire_len(datagram.len());
        handle.set_target(Target::Decrypt);
        handle.set_source("203.0.113.9:4500".parse().unwrap());
        let idx = handle.take_index();

        process_packet(idx, &pool, &mut primary, &mut pending, &replay, &to_clear, &counters, &peer);

        assert!(to_clear.dequeue().is_none(), "pn=0 must never be forwarded to clear");
    }
}
