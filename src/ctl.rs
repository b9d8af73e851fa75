//! Wire protocol and socket paths for the operator control channel
//! between `esptunctl` and the status worker, ported from
//! `signsky_ctl.h`/`skyctl.c`'s single-command datagram protocol.

use crate::counters::IfstatSnapshot;

pub const STATUS_SOCK_PATH: &str = "/tmp/esptun-status.sock";
pub const CLIENT_SOCK_PATH: &str = "/tmp/esptunctl.sock";

pub const CMD_STATUS: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRequest {
    pub cmd: u8,
}

impl StatusRequest {
    pub const WIRE_LEN: usize = 1;

    pub fn status() -> Self {
        Self { cmd: CMD_STATUS }
    }

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        [self.cmd]
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::WIRE_LEN {
            return None;
        }
        Some(Self { cmd: buf[0] })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusResponse {
    pub tx: IfstatSnapshot,
    pub rx: IfstatSnapshot,
}

impl StatusResponse {
    pub const WIRE_LEN: usize = IfstatSnapshot::WIRE_LEN * 2;

    pub fn encode(&self) -> [u8; Self::WIRE_LEN] {
        let mut buf = [0u8; Self::WIRE_LEN];
        self.tx.encode(&mut buf[0..IfstatSnapshot::WIRE_LEN]);
        self.rx.encode(&mut buf[IfstatSnapshot::WIRE_LEN..]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() != Self::WIRE_LEN {
            return None;
        }
        let tx = IfstatSnapshot::decode(&buf[0..IfstatSnapshot::WIRE_LEN])?;
        let rx = IfstatSnapshot::decode(&buf[IfstatSnapshot::WIRE_LEN..])?;
        Some(Self { tx, rx })
    }
}
