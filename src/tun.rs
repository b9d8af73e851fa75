//! Linux TUN device setup, ported from `signsky_platform_tundev_create`.
//! IFF_TUN | IFF_NO_PI: raw IP packets, no protocol header prefix.

use std::io;
use std::os::unix::io::RawFd;

use crate::error::SetupError;

const IFNAMSIZ: usize = 16;
const IFF_TUN: libc::c_short = 0x0001;
const IFF_UP_FLAG: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

/// Mirrors Linux's `struct ifreq`: a 16-byte interface name followed by a
/// 16-byte union, of which only `ifr_flags` (its first two bytes) matters
/// here.
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 14],
}

/// Create (or attach to) the `esptun0` TUN interface and return its fd,
/// already set non-blocking.
pub fn create(name: &str) -> Result<RawFd, SetupError> {
    let path = std::ffi::CString::new("/dev/net/tun").unwrap();
    let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
    if fd == -1 {
        return Err(SetupError::TunDevice(io::Error::last_os_error()));
    }

    let mut ifr: IfReq = unsafe { std::mem::zeroed() };
    if name.len() >= IFNAMSIZ {
        return Err(SetupError::TunDevice(io::Error::new(
            io::ErrorKind::InvalidInput,
            "tun interface name too long",
        )));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes()) {
        *dst = src as libc::c_char;
    }
    ifr.ifr_flags = IFF_TUN | IFF_NO_PI | IFF_UP_FLAG;

    if unsafe { libc::ioctl(fd, TUNSETIFF, &mut ifr) } == -1 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(SetupError::TunDevice(err));
    }

    set_nonblocking(fd)?;
    Ok(fd)
}

fn set_nonblocking(fd: RawFd) -> Result<(), SetupError> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags == -1 {
            return Err(SetupError::TunDevice(io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) == -1 {
            return Err(SetupError::TunDevice(io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Read one packet off the tun device into `buf`, returning the byte
/// count, or `None` on EAGAIN/EWOULDBLOCK. A genuine zero-byte result
/// (`Ok(Some(0))`) means EOF -- the device has been closed or removed
/// out from under us -- and is never returned for `EINTR`, which is
/// retried internally instead so callers can treat the two as distinct.
pub fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<Option<usize>> {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret == -1 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) => return Ok(None),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
        return Ok(Some(ret as usize));
    }
}

/// Write one packet to the tun device, returning `false` if the write
/// would block (and should simply be dropped, matching the original's
/// `EAGAIN`/`EWOULDBLOCK`/`EIO` handling).
pub fn write(fd: RawFd, buf: &[u8]) -> io::Result<bool> {
    let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if ret == -1 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EWOULDBLOCK) | Some(libc::EIO) => Ok(false),
            _ => Err(err),
        };
    }
    Ok(true)
}
