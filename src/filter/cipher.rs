//! Cipher-backed data filter
//!
//! Sealed frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |        Sealed Length (4B, BE)     |
//! +--------+--------+--------+--------+
//! |            Nonce (12B)            |
//! +--------+--------+--------+--------+
//! |       Ciphertext + Tag (16B)      |
//! +--------+--------+--------+--------+
//! ```
//!
//! HTTP intermediaries and socket reads may split or merge frames, so the
//! send side keeps a reassembly buffer and only opens complete frames.

use super::{DataFilter, FilterError};
use crate::crypto::{Cipher, KEY_LEN};
use crate::BLOCK_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix
const LENGTH_PREFIX: usize = 4;

/// Bytes a sealed frame adds on top of its plaintext
pub const FRAME_OVERHEAD: usize = LENGTH_PREFIX + Cipher::OVERHEAD;

/// AEAD filter with a pre-shared key
pub struct CipherFilter {
    cipher: Cipher,
    pending: BytesMut,
}

impl CipherFilter {
    /// Create a filter from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, FilterError> {
        Ok(Self {
            cipher: Cipher::new(key)?,
            pending: BytesMut::new(),
        })
    }

    /// Number of buffered bytes belonging to an incomplete frame
    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl DataFilter for CipherFilter {
    fn on_receive(&mut self, block: Bytes) -> Result<Bytes, FilterError> {
        let sealed = self.cipher.seal(&block)?;

        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX + sealed.len());
        frame.put_u32(sealed.len() as u32);
        frame.put_slice(&sealed);
        Ok(frame.freeze())
    }

    fn on_send(&mut self, block: Bytes) -> Result<Bytes, FilterError> {
        self.pending.extend_from_slice(&block);

        let mut plaintext = BytesMut::new();
        while self.pending.len() >= LENGTH_PREFIX {
            let sealed_len = u32::from_be_bytes([
                self.pending[0],
                self.pending[1],
                self.pending[2],
                self.pending[3],
            ]) as usize;

            if sealed_len > BLOCK_SIZE {
                return Err(FilterError::FrameTooLarge(sealed_len, BLOCK_SIZE));
            }
            if self.pending.len() < LENGTH_PREFIX + sealed_len {
                break;
            }

            self.pending.advance(LENGTH_PREFIX);
            let sealed = self.pending.split_to(sealed_len);
            plaintext.extend_from_slice(&self.cipher.open(&sealed)?);
        }

        Ok(plaintext.freeze())
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE - FRAME_OVERHEAD
    }
}
