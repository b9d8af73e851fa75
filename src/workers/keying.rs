//! The keying worker: the only process that touches the key-exchange
//! control socket. Receives a shared secret plus the SPI each direction
//! should use, derives the TX/RX session keys from it, and publishes
//! them into the shared key slots for encrypt/decrypt to pick up.
//! Ported from `keying.c`'s request loop; the request itself carries
//! `tx_spi`/`rx_spi` explicitly rather than `keying.c`'s secret-only
//! `struct request`, matching the control-plane wire format this
//! system actually specifies.

use std::os::unix::io::RawFd;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::cipher::KEY_LEN;
use crate::keyslot::KeySlot;
use crate::proc::ProcType;
use crate::signal;
use crate::state::State;

pub const KEY_SOCK_PATH: &str = "/tmp/esptun-keying.sock";

const SECRET_LEN: usize = 32;
const REQUEST_LEN: usize = 4 + 4 + SECRET_LEN;

const TX_INFO: &[u8] = b"esptun tx";
const RX_INFO: &[u8] = b"esptun rx";

pub fn entry(state: &mut State) -> ! {
    state.shed_for(ProcType::Keying);

    signal::trap(libc::SIGQUIT);
    signal::ignore(libc::SIGINT);

    // This worker is the sole writer of both key slots' `spi`/`salt`/`key`
    // fields (the single-actor invariant `keyslot.rs` relies on), so it
    // keeps a raw pointer rather than `state::require`'s `&'static T` --
    // `publish()` needs `&mut self` to fill in the new key material.
    let tx_key = state.tx_key.as_ref().expect("keying retains tx_key").as_ptr();
    let rx_key = state.rx_key.as_ref().expect("keying retains rx_key").as_ptr();

    let fd = match bind_path(KEY_SOCK_PATH) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to bind keying socket: {err}");
            std::process::exit(1);
        }
    };

    let mut running = true;
    while running {
        if super::should_stop() {
            running = false;
            continue;
        }

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };

        let ret = unsafe { libc::poll(&mut pfd, 1, 1000) };
        if ret == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            log::error!("keying poll failed: {err}");
            std::process::exit(1);
        }

        if ret > 0 && pfd.revents & libc::POLLIN != 0 {
            handle_request(fd, tx_key, rx_key);
        }
    }

    unsafe { libc::close(fd) };
    log::info!("exiting");
    std::process::exit(0);
}

fn bind_path(path: &str) -> std::io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
    if fd == -1 {
        return Err(std::io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }

    let _ = std::fs::remove_file(path);

    let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
    let ret = unsafe {
        libc::bind(
            fd,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret == -1 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    // The socket file is already owned by this worker's own (possibly
    // dropped-to-`runas`) uid/gid just by having created it; restricting
    // the mode to owner-only keeps other local users from sending key
    // material into it.
    let cpath = std::ffi::CString::new(path).expect("path has no interior NUL");
    if unsafe { libc::chmod(cpath.as_ptr(), 0o700) } == -1 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

pub(crate) fn handle_request(fd: RawFd, tx_key: *mut KeySlot, rx_key: *mut KeySlot) {
    let mut buf = [0u8; REQUEST_LEN];

    loop {
        let ret = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };

        if ret == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return,
                _ => {
                    log::error!("keying recvfrom failed: {err}");
                    return;
                }
            }
        }

        let ret = ret as usize;
        if ret != REQUEST_LEN {
            log::info!("keying received malformed request ({ret} bytes), ignoring");
            return;
        }

        install_keys(&buf, tx_key, rx_key);
        return;
    }
}

pub(crate) fn install_keys(buf: &[u8; REQUEST_LEN], tx_key: *mut KeySlot, rx_key: *mut KeySlot) {
    let tx_spi = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let rx_spi = u32::from_be_bytes(buf[4..8].try_into().unwrap());
    let secret: Zeroizing<[u8; SECRET_LEN]> = Zeroizing::new(buf[8..8 + SECRET_LEN].try_into().unwrap());

    let tx = derive_key(&secret, TX_INFO);
    let rx = derive_key(&secret, RX_INFO);

    publish(tx_key, tx_spi, tx);
    publish(rx_key, rx_spi, rx);

    log::debug!("installed new keys for tx_spi {tx_spi:#010x}, rx_spi {rx_spi:#010x}");
}

/// Salt is fixed to the low 32 bits of the installed SPI.
fn publish(slot: *mut KeySlot, spi: u32, key: Zeroizing<[u8; KEY_LEN]>) {
    let slot = unsafe { &mut *slot };
    slot.begin_generate();
    slot.publish(spi, spi, &key);
}

pub(crate) fn derive_key(secret: &Zeroizing<[u8; SECRET_LEN]>, info: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
    let hk = Hkdf::<Sha256>::new(None, secret.as_slice());
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    hk.expand(info, out.as_mut_slice())
        .expect("HKDF output length fits within the SHA-256 expand limit");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_slot() -> Box<KeySlot> {
        unsafe { Box::new(std::mem::zeroed()) }
    }

    fn request(tx_spi: u32, rx_spi: u32, secret: &[u8; SECRET_LEN]) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&tx_spi.to_be_bytes());
        buf[4..8].copy_from_slice(&rx_spi.to_be_bytes());
        buf[8..8 + SECRET_LEN].copy_from_slice(secret);
        buf
    }

    /// A server socket bound to a throwaway path (exercising the real
    /// `bind_path`, chmod included) plus an unconnected client socket of
    /// its own, matching the pattern the status worker's tests use.
    fn bound_pair(tag: &str) -> (RawFd, RawFd, std::path::PathBuf, std::path::PathBuf) {
        let mut server_path = std::env::temp_dir();
        server_path.push(format!("esptun-keying-test-{tag}-{}-server.sock", std::process::id()));
        let mut client_path = std::env::temp_dir();
        client_path.push(format!("esptun-keying-test-{tag}-{}-client.sock", std::process::id()));

        let server_fd = bind_path(server_path.to_str().unwrap()).expect("bind server socket");
        let client_fd = bind_path(client_path.to_str().unwrap()).expect("bind client socket");

        (server_fd, client_fd, server_path, client_path)
    }

    fn send_to(fd: RawFd, path: &std::path::Path, buf: &[u8]) {
        let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
        for (dst, src) in addr.sun_path.iter_mut().zip(path.to_str().unwrap().as_bytes()) {
            *dst = *src as libc::c_char;
        }
        let len = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        let ret = unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &addr as *const libc::sockaddr_un as *const libc::sockaddr,
                len,
            )
        };
        assert_eq!(ret as usize, buf.len());
    }

    fn cleanup(fds: &[RawFd], paths: &[&std::path::Path]) {
        for &fd in fds {
            unsafe { libc::close(fd) };
        }
        for path in paths {
            let _ = std::fs::remove_file(path);
        }
    }

    #[test]
    fn derive_key_is_deterministic_and_direction_specific() {
        let secret = Zeroizing::new([5u8; SECRET_LEN]);
        let tx_a = derive_key(&secret, TX_INFO);
        let tx_b = derive_key(&secret, TX_INFO);
        let rx = derive_key(&secret, RX_INFO);

        assert_eq!(*tx_a, *tx_b);
        assert_ne!(*tx_a, *rx);
    }

    #[test]
    fn install_keys_publishes_both_slots_as_pending() {
        let tx_slot = fresh_slot();
        let rx_slot = fresh_slot();
        let secret = [3u8; SECRET_LEN];

        let buf = request(0x1111, 0x2222, &secret);
        install_keys(&buf, tx_slot.as_ref() as *const KeySlot as *mut KeySlot, rx_slot.as_ref() as *const KeySlot as *mut KeySlot);

        assert!(tx_slot.is_pending());
        assert!(rx_slot.is_pending());

        let (tx_spi, tx_salt, tx_key) = tx_slot.begin_install();
        let (rx_spi, rx_salt, rx_key) = rx_slot.begin_install();

        assert_eq!(tx_spi, 0x1111);
        assert_eq!(tx_salt, 0x1111);
        assert_eq!(rx_spi, 0x2222);
        assert_eq!(rx_salt, 0x2222);
        assert_ne!(tx_key, rx_key, "tx and rx keys must be derived with distinct HKDF info");
        assert_eq!(tx_key, *derive_key(&Zeroizing::new(secret), TX_INFO));
        assert_eq!(rx_key, *derive_key(&Zeroizing::new(secret), RX_INFO));
    }

    #[test]
    fn handle_request_over_a_real_socket_installs_keys() {
        let tx_slot = fresh_slot();
        let rx_slot = fresh_slot();
        let (server_fd, client_fd, server_path, client_path) = bound_pair("install");

        let secret = [9u8; SECRET_LEN];
        let req = request(0xaaaa, 0xbbbb, &secret);
        send_to(client_fd, &server_path, &req);

        handle_request(
            server_fd,
            tx_slot.as_ref() as *const KeySlot as *mut KeySlot,
            rx_slot.as_ref() as *const KeySlot as *mut KeySlot,
        );

        assert!(tx_slot.is_pending());
        assert!(rx_slot.is_pending());

        cleanup(&[server_fd, client_fd], &[&server_path, &client_path]);
    }

    #[test]
    fn handle_request_ignores_a_malformed_request_and_leaves_slots_empty() {
        let tx_slot = fresh_slot();
        let rx_slot = fresh_slot();
        let (server_fd, client_fd, server_path, client_path) = bound_pair("malformed");

        let garbage = [0u8; 5];
        send_to(client_fd, &server_path, &garbage);

        handle_request(
            server_fd,
            tx_slot.as_ref() as *const KeySlot as *mut KeySlot,
            rx_slot.as_ref() as *const KeySlot as *mut KeySlot,
        );

        assert!(!tx_slot.is_pending());
        assert!(!rx_slot.is_pending());

        cleanup(&[server_fd, client_fd], &[&server_path, &client_path]);
    }
}
