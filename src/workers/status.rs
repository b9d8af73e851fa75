//! The status worker: answers operator `STATUS` queries over a local
//! control socket by reading the shared observability counters. Never
//! writes to shared memory, never touches the packet path. Ported from
//! `status.c`.

use std::os::unix::io::RawFd;

use crate::counters::Counters;
use crate::ctl::{self, StatusRequest, StatusResponse};
use crate::proc::ProcType;
use crate::signal;
use crate::state::{self, State};

pub fn entry(state: &mut State) -> ! {
    state.shed_for(ProcType::Status);

    signal::trap(libc::SIGQUIT);
    signal::ignore(libc::SIGINT);

    let counters: &Counters = state::require(&state.counters);

    let fd = match bind_path(ctl::STATUS_SOCK_PATH) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!("failed to bind status socket: {err}");
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
            log::error!("status poll failed: {err}");
            std::process::exit(1);
        }

        if ret > 0 && pfd.revents & libc::POLLIN != 0 {
            handle_request(fd, counters);
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

    let cpath = std::ffi::CString::new(path).expect("path has no interior NUL");
    if unsafe { libc::chmod(cpath.as_ptr(), 0o700) } == -1 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(fd)
}

pub(crate) fn handle_request(fd: RawFd, counters: &Counters) {
    let mut buf = [0u8; StatusRequest::WIRE_LEN];
    let mut peer: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    let mut socklen = std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;

    loop {
        let ret = unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut peer as *mut libc::sockaddr_un as *mut libc::sockaddr,
                &mut socklen,
            )
        };

        if ret == -1 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return,
                _ => {
                    log::error!("status recvfrom failed: {err}");
                    return;
                }
            }
        }

        let ret = ret as usize;
        let Some(req) = StatusRequest::decode(&buf[..ret]) else {
            log::info!("status received malformed request ({ret} bytes), ignoring");
            return;
        };

        if req.cmd == ctl::CMD_STATUS {
            send_status(fd, &peer, socklen, counters);
        }
        return;
    }
}

fn send_status(fd: RawFd, peer: &libc::sockaddr_un, socklen: libc::socklen_t, counters: &Counters) {
    let resp = StatusResponse {
        tx: counters.tx.snapshot(),
        rx: counters.rx.snapshot(),
    };
    let wire = resp.encode();

    let ret = unsafe {
        libc::sendto(
            fd,
            wire.as_ptr() as *const libc::c_void,
            wire.len(),
            0,
            peer as *const libc::sockaddr_un as *const libc::sockaddr,
            socklen,
        )
    };

    if ret == -1 {
        log::error!(
            "failed to send status to peer: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A server socket bound to a throwaway path (exercising the real
    /// `bind_path`, chmod included) plus an unconnected client socket
    /// bound to its own path so `recvfrom`/`sendto` have somewhere to
    /// address the reply.
    fn bound_pair(tag: &str) -> (RawFd, RawFd, std::path::PathBuf, std::path::PathBuf) {
        let mut server_path = std::env::temp_dir();
        server_path.push(format!("esptun-status-test-{tag}-{}-server.sock", std::process::id()));
        let mut client_path = std::env::temp_dir();
        client_path.push(format!("esptun-status-test-{tag}-{}-client.sock", std::process::id()));

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
    fn status_request_gets_a_response_with_live_counters() {
        let counters: Box<Counters> = unsafe { Box::new(std::mem::zeroed()) };
        counters.tx.record(0x1111, 100, 5);
        counters.rx.record(0x2222, 50, 6);

        let (server_fd, client_fd, server_path, client_path) = bound_pair("reply");

        let req = StatusRequest::status().encode();
        send_to(client_fd, &server_path, &req);

        handle_request(server_fd, &counters);

        let mut buf = [0u8; StatusResponse::WIRE_LEN];
        let received = unsafe {
            libc::recv(client_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        assert_eq!(received as usize, StatusResponse::WIRE_LEN);

        let resp = StatusResponse::decode(&buf).expect("valid status response");
        assert_eq!(resp.tx.spi, 0x1111);
        assert_eq!(resp.tx.bytes, 100);
        assert_eq!(resp.rx.spi, 0x2222);
        assert_eq!(resp.rx.bytes, 50);

        cleanup(&[server_fd, client_fd], &[&server_path, &client_path]);
    }

    #[test]
    fn malformed_request_draws_no_response() {
        let counters: Box<Counters> = unsafe { Box::new(std::mem::zeroed()) };
        let (server_fd, client_fd, server_path, client_path) = bound_pair("malformed");

        let garbage = [0u8; 5];
        send_to(client_fd, &server_path, &garbage);

        handle_request(server_fd, &counters);

        let mut buf = [0u8; StatusResponse::WIRE_LEN];
        let received = unsafe {
            libc::recv(client_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
        };
        assert_eq!(received, -1, "no reply should have been sent for a malformed request");

        cleanup(&[server_fd, client_fd], &[&server_path, &client_path]);
    }
}
