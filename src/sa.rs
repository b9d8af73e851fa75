//! Security associations: the live key + packet-number state each
//! direction's worker holds locally once it has installed a key from its
//! [`crate::keyslot::KeySlot`].

use crate::cipher::Cipher;

/// Packet count at which a TX association should start logging rekey
/// warnings -- well before the hard ceiling, so an operator (or a
/// keying peer that is watching logs) has time to act.
pub const PN_REKEY_WARNING: u64 = 1 << 48;

/// Packet count past which continuing to encrypt under the same key is
/// refused outright: the GCM nonce space for a single key must never be
/// allowed to approach exhaustion.
pub const PN_ABORT: u64 = 1 << 63;

pub struct Sa {
    pub spi: u32,
    pub salt: u32,
    pub seqnr: u64,
    pub cipher: Option<Cipher>,
    warned: bool,
}

impl Default for Sa {
    fn default() -> Self {
        Self {
            spi: 0,
            salt: 0,
            seqnr: 0,
            cipher: None,
            warned: false,
        }
    }
}

impl Sa {
    pub fn is_installed(&self) -> bool {
        self.cipher.is_some()
    }

    /// `start_pn` is `1` for a TX association and `0` for RX -- packet
    /// numbers start at 1 and never wrap; RX tracks the last *accepted*
    /// packet number instead, via the anti-replay window, so `0` is just
    /// an unused placeholder there.
    pub fn install(&mut self, spi: u32, salt: u32, cipher: Cipher, start_pn: u64) {
        self.spi = spi;
        self.salt = salt;
        self.seqnr = start_pn;
        self.warned = false;
        self.cipher = Some(cipher);
    }

    pub fn clear(&mut self) {
        self.spi = 0;
        self.salt = 0;
        self.seqnr = 0;
        self.warned = false;
        self.cipher = None;
    }

    /// Allocate the next TX packet number. `None` means the association
    /// has reached `PN_ABORT` -- the fatal invariant boundary for
    /// packet-number exhaustion. The caller must treat this as
    /// unrecoverable and abort rather than keep encrypting under a
    /// nonce space that is about to repeat.
    pub fn next_pn(&mut self) -> Option<u64> {
        if self.seqnr >= PN_ABORT {
            return None;
        }

        if self.seqnr >= PN_REKEY_WARNING && !self.warned {
            self.warned = true;
            log::warn!(
                "spi {:#010x} has sent {} packets, rekey is overdue",
                self.spi,
                self.seqnr
            );
        }

        let pn = self.seqnr;
        self.seqnr += 1;
        Some(pn)
    }
}
