//! The clear-side worker: reads plaintext packets off the tun device and
//! queues them for encryption; writes decrypted packets it is handed
//! back out the same device. Ported from `clear.c`.

use crate::packet::{Pool, Target, PACKET_MIN_LEN};
use crate::proc::ProcType;
use crate::ring::Ring;
use crate::signal;
use crate::state::{self, State};
use crate::tun;

const PACKETS_PER_EVENT: usize = 64;
const TUN_NAME: &str = "esptun0";

pub fn entry(state: &mut State) -> ! {
    state.shed_for(ProcType::Clear);

    signal::trap(libc::SIGQUIT);
    signal::ignore(libc::SIGINT);

    let fd = match tun::create(TUN_NAME) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to create tun device: {err}");
            std::process::exit(1);
        }
    };

    let pool = unsafe { Pool::from_raw(state.pool.as_ref().unwrap().as_ptr()) };
    let to_clear: &Ring = state::require(&state.to_clear);
    let to_encrypt: &Ring = state::require(&state.to_encrypt);

    let mut running = true;
    while running {
        if super::should_stop() {
            running = false;
            continue;
        }

        recv_packets(fd, &pool, to_encrypt);

        while let Some(idx) = to_clear.dequeue() {
            send_packet(fd, &pool, idx);
        }

        std::thread::sleep(std::time::Duration::from_micros(500));
    }

    unsafe { libc::close(fd) };
    log::info!("exiting");
    std::process::exit(0);
}

/// Read up to `PACKETS_PER_EVENT` packets off the tun device, queueing
/// each for encryption. When the pool is momentarily exhausted, reads
/// still happen into a process-local scratch packet so the interface is
/// drained, but that packet is always discarded.
pub(crate) fn recv_packets(fd: i32, pool: &Pool, to_encrypt: &Ring) {
    let mut scratch = crate::packet::Packet::scratch();

    for _ in 0..PACKETS_PER_EVENT {
        let mut handle = pool.get();
        let target: &mut crate::packet::Packet = match &mut handle {
            Some(h) => &mut **h,
            None => &mut scratch,
        };

        let read = match tun::read(fd, target.data_region_mut()) {
            Ok(Some(n)) => n,
            Ok(None) => break,
            Err(err) => {
                log::error!("tun read failed: {err}");
                std::process::exit(1);
            }
        };

        if read == 0 {
            // A genuine zero-byte read means the tun device was closed or
            // removed out from under us -- not recoverable, so exit and
            // let the supervisor bring the whole tunnel down.
            log::error!("tun device closed (EOF), exiting");
            std::process::exit(1);
        }

        if read < PACKET_MIN_LEN {
            continue;
        }

        let Some(mut handle) = handle else {
            continue;
        };

        handle.set_len(read);
        handle.set_target(Target::Encrypt);

        let idx = handle.take_index();
        if to_encrypt.queue(idx).is_err() {
            pool.put(idx);
        }
    }
}

/// Write a packet destined for the clear interface, then return its
/// buffer to the pool.
pub(crate) fn send_packet(fd: i32, pool: &Pool, idx: u32) {
    let packet = unsafe { pool.packet(idx) };
    debug_assert_eq!(packet.target(), Target::Clear);

    match tun::write(fd, packet.payload()) {
        Ok(_) => {}
        Err(err) => log::error!("tun write failed: {err}"),
    }

    pool.put(idx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PoolStore;

    fn fresh_pool() -> (Box<PoolStore>, Pool) {
        let mut store: Box<PoolStore> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { PoolStore::init(store.as_mut() as *mut PoolStore) };
        let pool = unsafe { Pool::from_raw(store.as_mut() as *mut PoolStore) };
        (store, pool)
    }

    fn fresh_ring(elements: usize) -> Box<Ring> {
        let mut boxed: Box<Ring> = unsafe { Box::new(std::mem::zeroed()) };
        unsafe { Ring::init(boxed.as_mut() as *mut Ring, elements) };
        boxed
    }

    fn make_pipe() -> (i32, i32) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0, "pipe() failed");

        // Non-blocking read end: once the single test payload has been
        // drained, `recv_packets`'s remaining loop iterations must see
        // EAGAIN and break rather than block on an empty pipe.
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL, 0) };
        unsafe { libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) };

        (fds[0], fds[1])
    }

    /// A read of exactly `PACKET_MIN_LEN` bytes is the minimum round-trip
    /// property's lower bound and must be queued, not dropped -- this is
    /// the off-by-one the `<=` check used to get wrong.
    #[test]
    fn exact_minimum_length_read_is_queued() {
        let (store, pool) = fresh_pool();
        let ring = fresh_ring(16);

        let (read_fd, write_fd) = make_pipe();
        let payload = vec![0xabu8; PACKET_MIN_LEN];
        let n = unsafe {
            libc::write(write_fd, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n as usize, payload.len());

        recv_packets(read_fd, &pool, &ring);

        let idx = ring.dequeue().expect("a packet should have been queued");
        let packet = unsafe { pool.packet(idx) };
        assert_eq!(packet.len(), PACKET_MIN_LEN);
        assert_eq!(packet.target(), Target::Encrypt);

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        drop(store);
    }

    /// A read shorter than `PACKET_MIN_LEN` is dropped silently rather
    /// than queued.
    #[test]
    fn below_minimum_length_read_is_dropped() {
        let (store, pool) = fresh_pool();
        let ring = fresh_ring(16);

        let (read_fd, write_fd) = make_pipe();
        let payload = vec![0xabu8; PACKET_MIN_LEN - 1];
        unsafe { libc::write(write_fd, payload.as_ptr() as *const libc::c_void, payload.len()) };

        recv_packets(read_fd, &pool, &ring);

        assert!(ring.dequeue().is_none());

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        drop(store);
    }
}
