//! Filter key derivation
//!
//! Key files that do not hold a raw base64 key are treated as passphrases
//! and stretched with HKDF-SHA256.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{KeyType, Salt, HKDF_SHA256};

const FILTER_KEY_SALT: &[u8] = b"http_tunnel_filter_salt";
const FILTER_KEY_INFO: &[u8] = b"http_tunnel_filter_key";

/// Output length marker for `ring`'s expand step
struct FilterKeyLen;

impl KeyType for FilterKeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Stretch an arbitrary shared secret into the filter's cipher key
pub fn derive_filter_key(secret: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    let prk = Salt::new(HKDF_SHA256, FILTER_KEY_SALT).extract(secret);
    let info = [FILTER_KEY_INFO];

    let mut key = [0u8; KEY_LEN];
    prk.expand(&info, FilterKeyLen)
        .and_then(|okm| okm.fill(&mut key))
        .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;
    Ok(key)
}
