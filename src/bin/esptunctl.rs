//! Operator CLI for the running tunnel daemon. Ported from `skyctl.c`:
//! a small `AF_UNIX` datagram client that sends a single command to the
//! status worker's control socket and prints the reply.

use std::os::unix::io::RawFd;

use esptun::counters::IfstatSnapshot;
use esptun::ctl::{self, StatusRequest, StatusResponse};

fn usage() -> ! {
    eprintln!("esptunctl [command]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  status   Show tx/rx packet and byte counters.");
    std::process::exit(1);
}

fn main() {
    let mut args = std::env::args().skip(1);
    let cmd = match args.next() {
        Some(cmd) => cmd,
        None => usage(),
    };

    if args.next().is_some() {
        usage();
    }

    match cmd.as_str() {
        "status" => cmd_status(),
        _ => usage(),
    }
}

fn cmd_status() {
    let fd = match local_socket(ctl::CLIENT_SOCK_PATH) {
        Ok(fd) => fd,
        Err(err) => {
            eprintln!("esptunctl: failed to create local socket: {err}");
            std::process::exit(1);
        }
    };

    let req = StatusRequest::status();
    if let Err(err) = send_to(fd, ctl::STATUS_SOCK_PATH, &req.encode()) {
        eprintln!("esptunctl: failed to reach esptund: {err}");
        std::process::exit(1);
    }

    let mut buf = [0u8; StatusResponse::WIRE_LEN];
    let n = match recv(fd, &mut buf) {
        Ok(n) => n,
        Err(err) => {
            eprintln!("esptunctl: no reply from esptund: {err}");
            std::process::exit(1);
        }
    };

    unsafe { libc::close(fd) };
    let _ = std::fs::remove_file(ctl::CLIENT_SOCK_PATH);

    let Some(resp) = StatusResponse::decode(&buf[..n]) else {
        eprintln!("esptunctl: malformed reply from esptund ({n} bytes)");
        std::process::exit(1);
    };

    dump_ifstat("tx", &resp.tx);
    dump_ifstat("rx", &resp.rx);
}

fn dump_ifstat(label: &str, stat: &IfstatSnapshot) {
    println!("{label}:");
    if stat.spi == 0 {
        println!("  spi      none");
    } else {
        println!("  spi      {:#010x}", stat.spi);
    }
    println!("  packets  {}", stat.pkt);
    println!("  bytes    {}", stat.bytes);

    if stat.last == 0 {
        println!("  last     never");
    } else {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(stat.last);
        let age = now.saturating_sub(stat.last);
        println!("  last     {age}s ago");
    }
}

/// Create and bind a local `AF_UNIX` datagram socket at `path`, so the
/// kernel has a return address to attach to datagrams we send -- a
/// connect()-less client has no peer for the server's reply to target.
fn local_socket(path: &str) -> std::io::Result<RawFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_DGRAM, 0) };
    if fd == -1 {
        return Err(std::io::Error::last_os_error());
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        unsafe { libc::close(fd) };
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

    Ok(fd)
}

fn send_to(fd: RawFd, path: &str, buf: &[u8]) -> std::io::Result<()> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.len() >= addr.sun_path.len() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "path too long"));
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
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

    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}

fn recv(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut tv = libc::timeval { tv_sec: 2, tv_usec: 0 };
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &mut tv as *mut libc::timeval as *mut libc::c_void,
            std::mem::size_of::<libc::timeval>() as libc::socklen_t,
        );
    }

    let ret = unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
    };

    if ret == -1 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(ret as usize)
}
