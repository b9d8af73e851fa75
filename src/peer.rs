//! The peer address cell: a single shared `SocketAddrV4` the crypto
//! worker sends to and keying/config can update.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU32, Ordering};

#[repr(C)]
pub struct PeerCell {
    ip: AtomicU32,
    port: AtomicU32,
}

impl PeerCell {
    /// # Safety
    /// `cell` must point at a zero-initialized, appropriately aligned
    /// `PeerCell`.
    pub unsafe fn init(_cell: *mut PeerCell) {}

    pub fn set(&self, addr: SocketAddrV4) {
        self.ip.store(u32::from(*addr.ip()), Ordering::SeqCst);
        self.port.store(addr.port() as u32, Ordering::SeqCst);
    }

    pub fn get(&self) -> SocketAddrV4 {
        let ip = self.ip.load(Ordering::SeqCst);
        let port = self.port.load(Ordering::SeqCst) as u16;
        SocketAddrV4::new(ip.into(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_address() {
        let cell: Box<PeerCell> = unsafe { Box::new(std::mem::zeroed()) };
        let addr: SocketAddrV4 = "203.0.113.5:4500".parse().unwrap();
        cell.set(addr);
        assert_eq!(cell.get(), addr);
    }
}
