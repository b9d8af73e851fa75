//! The crypto-side worker: the only process that touches the network
//! socket. Reads ciphertext datagrams off the wire and queues them for
//! decryption; sends whatever encrypt has prepared to the configured
//! peer. Ported from `crypto.c`.
//!
//! `crypto.c`'s `crypto_recv_packets`/`crypto_send_packet` read and write
//! through `signsky_packet_data(pkt)`, i.e. starting past the reserved
//! ESP header room -- which would silently drop the header from the
//! actual wire I/O. That can't be right for a protocol whose header
//! carries the SPI and packet number, so here the full datagram
//! (header included) is read into [`crate::packet::Packet::raw_mut`]
//! and sent via [`crate::packet::Packet::wire`] instead.

use std::net::SocketAddrV4;
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Socket, Type};

use crate::packet::{Packet, Pool, Target, PACKET_HEAD_LEN, PACKET_MIN_LEN};
use crate::peer::PeerCell;
use crate::proc::ProcType;
use crate::replay::ReplayWindow;
use crate::ring::Ring;
use crate::signal;
use crate::state::{self, State};

const PACKETS_PER_EVENT: usize = 32;

pub fn entry(state: &mut State, local: SocketAddrV4) -> ! {
    state.shed_for(ProcType::Crypto);

    signal::trap(libc::SIGQUIT);
    signal::ignore(libc::SIGINT);

    let socket = match bind(local) {
        Ok(s) => s,
        Err(err) => {
            log::error!("failed to bind crypto socket: {err}");
            std::process::exit(1);
        }
    };
    let fd = socket.as_raw_fd();

    let pool = unsafe { Pool::from_raw(state.pool.as_ref().unwrap().as_ptr()) };
    let to_decrypt: &Ring = state::require(&state.to_decrypt);
    let to_crypto: &Ring = state::require(&state.to_crypto);
    let peer: &PeerCell = state::require(&state.peer);
    let replay: &ReplayWindow = state::require(&state.replay);

    let mut running = true;
    while running {
        if super::should_stop() {
            running = false;
            continue;
        }

        recv_packets(fd, &pool, to_decrypt, replay);

        while let Some(idx) = to_crypto.dequeue() {
            send_packet(fd, &pool, idx, peer.get());
        }

        std::thread::sleep(std::time::Duration::from_micros(10));
    }

    log::info!("exiting");
    std::process::exit(0);
}

pub(crate) fn bind(local: SocketAddrV4) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;
    socket.bind(&local.into())?;

    // Path MTU discovery: fragmenting an already-encrypted datagram is
    // not something the peer's decrypt worker can reassemble-then-verify,
    // so oversized datagrams should be reported back rather than split.
    let fd = socket.as_raw_fd();
    let pmtudisc = libc::IP_PMTUDISC_DO;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &pmtudisc as *const _ as *const libc::c_void,
            std::mem::size_of_val(&pmtudisc) as libc::socklen_t,
        );
    }

    Ok(socket)
}

pub(crate) fn recv_packets(fd: RawFd, pool: &Pool, to_decrypt: &Ring, replay: &ReplayWindow) {
    let mut scratch = Packet::scratch();

    for _ in 0..PACKETS_PER_EVENT {
        let mut handle = pool.get();
        let target: &mut Packet = match &mut handle {
            Some(h) => &mut **h,
            None => &mut scratch,
        };

        let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut socklen = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

        let buf = target.raw_mut();
        let ret = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut sin as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut socklen,
            )
        };

        if ret == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => break,
                Some(libc::EINTR) => continue,
                _ => {
                    log::error!("crypto recvfrom failed: {err}");
                    std::process::exit(1);
                }
            }
        }

        let ret = ret as usize;
        if ret < PACKET_HEAD_LEN + PACKET_MIN_LEN {
            continue;
        }

        // Eager anti-replay pre-check: cheap enough to run here and it
        // keeps obviously-stale datagrams from ever reaching decrypt's
        // AEAD verification. The decrypt worker still runs the
        // authoritative post-verify check itself.
        if let Some(header) = crate::wire::Header::decode(&buf[..PACKET_HEAD_LEN]) {
            if !replay.precheck(header.pn) {
                continue;
            }
        }

        let Some(mut handle) = handle else {
            continue;
        };

        handle.set_wire_len(ret);
        handle.set_target(Target::Decrypt);
        handle.set_source(sockaddr_in_to_v4(&sin));

        let idx = handle.take_index();
        if to_decrypt.queue(idx).is_err() {
            pool.put(idx);
        }
    }
}

fn sockaddr_in_to_v4(sin: &libc::sockaddr_in) -> SocketAddrV4 {
    let ip = u32::from_be(sin.sin_addr.s_addr);
    let port = u16::from_be(sin.sin_port);
    SocketAddrV4::new(ip.into(), port)
}

pub(crate) fn send_packet(fd: RawFd, pool: &Pool, idx: u32, peer: SocketAddrV4) {
    let packet = unsafe { pool.packet(idx) };

    let sin = socket2::SockAddr::from(std::net::SocketAddr::V4(peer));
    let wire = packet.wire();

    let ret = unsafe {
        libc::sendto(
            fd,
            wire.as_ptr() as *const libc::c_void,
            wire.len(),
            0,
            sin.as_ptr(),
            sin.len(),
        )
    };

    if ret == -1 {
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => {}
            _ => log::error!("crypto sendto failed: {err}"),
        }
    }

    pool.put(idx);
}
