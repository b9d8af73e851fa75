//! AES-256-GCM AEAD, the one cipher this tunnel speaks.
//!
//! Wraps `ring::aead` the way a privilege-separated worker wants to use
//! it: encrypt-in-place with a detached tag appended, decrypt-in-place
//! with the tag stripped and verified. Key material is wrapped in
//! `zeroize::Zeroizing` so it is wiped from the process's memory the
//! moment the cipher context (or the key bytes used to build it) is
//! dropped, not just when the process exits.

use ring::aead::{self, Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use zeroize::Zeroizing;

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = aead::MAX_TAG_LEN;

pub struct CipherError;

/// An established AES-256-GCM context bound to one direction's key.
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    pub fn new(key_bytes: &Zeroizing<[u8; KEY_LEN]>) -> Self {
        let unbound =
            UnboundKey::new(&AES_256_GCM, key_bytes.as_slice()).expect("AES-256-GCM key length");
        Self {
            key: LessSafeKey::new(unbound),
        }
    }

    /// Overhead this cipher adds to a packet: just the authentication tag.
    pub fn overhead() -> usize {
        TAG_LEN
    }

    /// Encrypt `data` in place and append the tag. `data` must have
    /// `overhead()` bytes of spare capacity past its current length.
    pub fn encrypt(&self, nonce: [u8; 12], aad: &[u8; 12], data: &mut Vec<u8>) {
        let nonce = Nonce::assume_unique_for_key(nonce);
        self.key
            .seal_in_place_append_tag(nonce, Aad::from(*aad), data)
            .expect("seal_in_place_append_tag is infallible for AES-256-GCM");
    }

    /// Decrypt and verify `data` in place (tag included at the tail).
    /// Returns the plaintext length on success, `Err` on an auth failure.
    pub fn decrypt(
        &self,
        nonce: [u8; 12],
        aad: &[u8; 12],
        data: &mut [u8],
    ) -> Result<usize, CipherError> {
        let nonce = Nonce::assume_unique_for_key(nonce);
        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(*aad), data)
            .map_err(|_| CipherError)?;
        Ok(plaintext.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> Zeroizing<[u8; KEY_LEN]> {
        Zeroizing::new([byte; KEY_LEN])
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let cipher = Cipher::new(&key(7));
        let nonce = [1u8; 12];
        let aad = [2u8; 12];

        let mut buf = b"hello tunnel".to_vec();
        cipher.encrypt(nonce, &aad, &mut buf);
        assert_eq!(buf.len(), b"hello tunnel".len() + Cipher::overhead());

        let len = cipher.decrypt(nonce, &aad, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello tunnel");
    }

    #[test]
    fn tampered_ciphertext_fails_to_verify() {
        let cipher = Cipher::new(&key(7));
        let nonce = [1u8; 12];
        let aad = [2u8; 12];

        let mut buf = b"hello tunnel".to_vec();
        cipher.encrypt(nonce, &aad, &mut buf);
        buf[0] ^= 0xff;

        assert!(cipher.decrypt(nonce, &aad, &mut buf).is_err());
    }

    #[test]
    fn wrong_aad_fails_to_verify() {
        let cipher = Cipher::new(&key(7));
        let nonce = [1u8; 12];

        let mut buf = b"hello tunnel".to_vec();
        cipher.encrypt(nonce, &[2u8; 12], &mut buf);

        assert!(cipher.decrypt(nonce, &[3u8; 12], &mut buf).is_err());
    }
}
