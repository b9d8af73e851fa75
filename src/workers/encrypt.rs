//! The encrypt worker: installs the current TX key and turns plaintext
//! packets from the clear side into ESP-shaped ciphertext for crypto to
//! send. Ported from `encrypt.c`.

use crate::cipher::Cipher;
use crate::counters::Counters;
use crate::keyslot::KeySlot;
use crate::packet::{Pool, Target};
use crate::proc::ProcType;
use crate::ring::Ring;
use crate::sa::Sa;
use crate::signal;
use crate::state::{self, State};
use crate::wire;

pub fn entry(state: &mut State) -> ! {
    state.shed_for(ProcType::Encrypt);

    signal::trap(libc::SIGQUIT);
    signal::ignore(libc::SIGINT);

    let tx_key: &KeySlot = state::require(&state.tx_key);
    let to_encrypt: &Ring = state::require(&state.to_encrypt);
    let to_crypto: &Ring = state::require(&state.to_crypto);
    let counters: &Counters = state::require(&state.counters);
    let pool = unsafe { Pool::from_raw(state.pool.as_ref().unwrap().as_ptr()) };

    let mut sa = Sa::default();

    let mut running = true;
    while running {
        if super::should_stop() {
            running = false;
            continue;
        }

        install_pending_key(tx_key, &mut sa);

        while let Some(idx) = to_encrypt.dequeue() {
            process_packet(idx, &pool, &mut sa, to_crypto, counters);
        }

        std::thread::sleep(std::time::Duration::from_micros(10));
    }

    log::info!("exiting");
    std::process::exit(0);
}

/// Take ownership of a pending TX key, if any, and install it as the
/// active association.
pub(crate) fn install_pending_key(slot: &KeySlot, sa: &mut Sa) {
    if !slot.is_pending() {
        return;
    }

    let (spi, salt, key) = slot.begin_install();
    let cipher = Cipher::new(&zeroize::Zeroizing::new(key));
    sa.install(spi, salt, cipher, 1);
    slot.finish_install();
}

pub(crate) fn process_packet(idx: u32, pool: &Pool, sa: &mut Sa, to_crypto: &Ring, counters: &Counters) {
    let packet = unsafe { pool.packet(idx) };
    debug_assert_eq!(packet.target(), crate::packet::Target::Encrypt);

    if sa.cipher.is_none() {
        pool.put(idx);
        return;
    }

    // Packet-number exhaustion at `PN_ABORT` is a fatal invariant, not a
    // per-packet error: continuing to run would mean either reusing a
    // nonce or silently dropping every packet from here on, so the whole
    // worker aborts and lets the supervisor bring the tunnel down.
    let Some(pn) = sa.next_pn() else {
        log::error!("spi {:#010x} exhausted its packet number space, aborting", sa.spi);
        std::process::exit(1);
    };

    let spi = sa.spi;
    let salt = sa.salt;
    let cipher = sa.cipher.as_ref().expect("checked above");

    let overhead = wire::TRAIL_LEN + Cipher::overhead();
    if packet.spare_capacity() < overhead {
        pool.put(idx);
        return;
    }

    let mut trail_buf = [0u8; wire::TRAIL_LEN];
    wire::Trailer::IPV4.encode(&mut trail_buf);
    packet.append(&trail_buf);

    let nonce = wire::Header::nonce(salt, pn);
    let aad = wire::Header::aad(spi, pn);

    let mut scratch = packet.payload().to_vec();
    cipher.encrypt(nonce, &aad, &mut scratch);

    packet.set_len(scratch.len());
    packet.payload_mut().copy_from_slice(&scratch);

    let header = wire::Header::new(spi, pn);
    packet.set_header(&header);
    packet.set_target(Target::Crypto);

    counters.tx.record(spi, packet.len() as u64, counters_uptime(counters));

    if to_crypto.queue(idx).is_err() {
        pool.put(idx);
    }
}

fn counters_uptime(counters: &Counters) -> u64 {
    counters.uptime.load(std::sync::atomic::Ordering::SeqCst)
}
