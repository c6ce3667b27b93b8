//! Cryptographic primitives for the cipher data filter
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD sealing with random nonces
//! - HKDF-SHA256 stretching of passphrase key files
//! - Pre-shared key loading from a key file
//! - Secure random number generation

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::derive_filter_key;

use base64::Engine;
use std::path::Path;
use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Random generator failure")]
    Random,

    #[error("Key file {path}: {source}")]
    KeyFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Key file {0} is empty")]
    EmptyKeyFile(String),
}

/// Generate cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

/// Load the pre-shared key from a key file
///
/// A file holding the base64 encoding of exactly 32 bytes is used as-is;
/// any other content is treated as a passphrase and stretched with HKDF.
pub fn load_key_file<P: AsRef<Path>>(path: P) -> Result<[u8; KEY_LEN], CryptoError> {
    let path = path.as_ref();
    let content = std::fs::read(path).map_err(|source| CryptoError::KeyFile {
        path: path.display().to_string(),
        source,
    })?;

    let trimmed = content.trim_ascii();
    if trimmed.is_empty() {
        return Err(CryptoError::EmptyKeyFile(path.display().to_string()));
    }

    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(trimmed) {
        if decoded.len() == KEY_LEN {
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&decoded);
            return Ok(key);
        }
    }

    derive_filter_key(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let mut buf1 = [0u8; 32];
        let mut buf2 = [0u8; 32];
        random_bytes(&mut buf1).unwrap();
        random_bytes(&mut buf2).unwrap();
        assert_ne!(buf1, buf2);
    }

    #[test]
    fn test_load_base64_key_file() {
        let key = [0x5Au8; KEY_LEN];
        let path = std::env::temp_dir().join(format!("http-tunnel-key-{}", std::process::id()));
        std::fs::write(
            &path,
            format!("{}\n", base64::engine::general_purpose::STANDARD.encode(key)),
        )
        .unwrap();

        let loaded = load_key_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, key);
    }

    #[test]
    fn test_passphrase_key_file_is_stretched() {
        let path = std::env::temp_dir().join(format!("http-tunnel-pass-{}", std::process::id()));
        std::fs::write(&path, "correct horse battery staple").unwrap();

        let loaded = load_key_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded, derive_filter_key(b"correct horse battery staple").unwrap());
    }

    #[test]
    fn test_missing_key_file() {
        let result = load_key_file("/nonexistent/http-tunnel.key");
        assert!(matches!(result, Err(CryptoError::KeyFile { .. })));
    }
}
