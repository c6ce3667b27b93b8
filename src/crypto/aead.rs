//! AEAD sealing for tunnel payloads
//!
//! ChaCha20-Poly1305 with a fresh random nonce per message. Both agents share
//! one key and seal in both directions, so a counter nonce would collide.

use super::{generate_nonce, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher for sealing/opening payloads
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Bytes added to every sealed message (nonce + tag)
    pub const OVERHEAD: usize = NONCE_LEN + TAG_LEN;

    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Seal plaintext, returning `nonce || ciphertext || tag`
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;

        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut body)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }

    /// Open a message produced by [`Cipher::seal`]
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < Self::OVERHEAD {
            return Err(CryptoError::Decryption("message too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);
        let mut buffer = sealed[NONCE_LEN..].to_vec();

        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_seal_open() {
        let key = [0x42u8; KEY_LEN];
        let sealer = Cipher::new(&key).unwrap();
        let opener = Cipher::new(&key).unwrap();

        let plaintext = b"Hello, World!";
        let sealed = sealer.seal(plaintext).unwrap();

        assert_eq!(sealed.len(), plaintext.len() + Cipher::OVERHEAD);
        assert_eq!(opener.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn test_nonces_differ() {
        let cipher = Cipher::new(&[0x11u8; KEY_LEN]).unwrap();
        let a = cipher.seal(b"same").unwrap();
        let b = cipher.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = Cipher::new(&[0x42u8; KEY_LEN]).unwrap();

        let mut sealed = cipher.seal(b"Hello, World!").unwrap();
        sealed[NONCE_LEN] ^= 0xFF;

        assert!(cipher.open(&sealed).is_err());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let sealed = Cipher::new(&[1u8; KEY_LEN]).unwrap().seal(b"secret").unwrap();
        assert!(Cipher::new(&[2u8; KEY_LEN]).unwrap().open(&sealed).is_err());
    }
}
