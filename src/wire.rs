//! On-wire ESP-shaped header and trailer.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                              SPI                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Sequence (low 32 bits of pn)               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! |                       Packet number (pn)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ~                      ciphertext payload                       ~
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |      pad(0)   |  next (IPPROTO_IPV4) | authentication tag...  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! `spi`, `seq` and `pn` travel big-endian. `seq` is always the low 32
//! bits of `pn`, carried as a separate field for wire compatibility.

pub const HEADER_LEN: usize = 16;
pub const TRAIL_LEN: usize = 2;
pub const NEXT_IPV4: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub spi: u32,
    pub seq: u32,
    pub pn: u64,
}

impl Header {
    pub fn new(spi: u32, pn: u64) -> Self {
        Self {
            spi,
            seq: (pn & 0xffff_ffff) as u32,
            pn,
        }
    }

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= HEADER_LEN);
        out[0..4].copy_from_slice(&self.spi.to_be_bytes());
        out[4..8].copy_from_slice(&self.seq.to_be_bytes());
        out[8..16].copy_from_slice(&self.pn.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let spi = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let seq = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let pn = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Some(Self { spi, seq, pn })
    }

    /// The sequence field must always match the low 32 bits of the packet
    /// number; a mismatch means the header was tampered with or corrupt.
    pub fn seq_consistent(&self) -> bool {
        self.seq == (self.pn & 0xffff_ffff) as u32
    }

    /// nonce = 4-byte salt || 8-byte packet number (12 bytes, GCM standard).
    pub fn nonce(salt: u32, pn: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[0..4].copy_from_slice(&salt.to_be_bytes());
        nonce[4..12].copy_from_slice(&pn.to_be_bytes());
        nonce
    }

    /// aad = 4-byte SPI || 8-byte packet number (12 bytes).
    pub fn aad(spi: u32, pn: u64) -> [u8; 12] {
        let mut aad = [0u8; 12];
        aad[0..4].copy_from_slice(&spi.to_be_bytes());
        aad[4..12].copy_from_slice(&pn.to_be_bytes());
        aad
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub pad: u8,
    pub next: u8,
}

impl Trailer {
    pub const IPV4: Self = Self {
        pad: 0,
        next: NEXT_IPV4,
    };

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= TRAIL_LEN);
        out[0] = self.pad;
        out[1] = self.next;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < TRAIL_LEN {
            return None;
        }
        Some(Self {
            pad: buf[0],
            next: buf[1],
        })
    }

    pub fn is_valid(&self) -> bool {
        self.pad == 0 && self.next == NEXT_IPV4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let hdr = Header::new(0xdead_beef, 0x0001_0203_0405_0607);
        let mut buf = [0u8; HEADER_LEN];
        hdr.encode(&mut buf);
        let decoded = Header::decode(&buf).unwrap();
        assert_eq!(hdr, decoded);
        assert!(decoded.seq_consistent());
    }

    #[test]
    fn seq_mismatch_detected() {
        let mut hdr = Header::new(1, 42);
        hdr.seq = 41;
        assert!(!hdr.seq_consistent());
    }

    #[test]
    fn trailer_validates_ipv4_next() {
        assert!(Trailer::IPV4.is_valid());
        assert!(!Trailer { pad: 1, next: NEXT_IPV4 }.is_valid());
        assert!(!Trailer { pad: 0, next: 41 }.is_valid());
    }
}
