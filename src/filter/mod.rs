//! Data filters applied where bytes enter or leave a raw socket
//!
//! A [`SocketPump`](crate::pump::SocketPump) passes every block it reads
//! through [`DataFilter::on_receive`] and every block it is about to write
//! through [`DataFilter::on_send`]. Both agents install the same filter kind,
//! so whatever one side's receive transform produces, the other side's send
//! transform undoes before the bytes reach a real socket.

mod cipher;

pub use cipher::{CipherFilter, FRAME_OVERHEAD};

use crate::crypto::{self, CryptoError, KEY_LEN};
use crate::BLOCK_SIZE;
use bytes::Bytes;
use thiserror::Error;

/// Filter errors
#[derive(Debug, Error)]
pub enum FilterError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),
}

/// Transform applied to data blocks on socket ingress/egress
pub trait DataFilter: Send {
    /// Transform a block just read from the socket
    fn on_receive(&mut self, block: Bytes) -> Result<Bytes, FilterError>;

    /// Transform a block about to be written to the socket
    ///
    /// May return an empty block when the input only completes part of a frame.
    fn on_send(&mut self, block: Bytes) -> Result<Bytes, FilterError>;

    /// Read buffer size the transform expects
    fn block_size(&self) -> usize;
}

/// Pass-through filter
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityFilter;

impl DataFilter for IdentityFilter {
    fn on_receive(&mut self, block: Bytes) -> Result<Bytes, FilterError> {
        Ok(block)
    }

    fn on_send(&mut self, block: Bytes) -> Result<Bytes, FilterError> {
        Ok(block)
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }
}

/// Filter selection, made once from configuration
#[derive(Clone, Default)]
pub enum FilterKind {
    /// No transform
    #[default]
    Identity,
    /// AEAD sealing with a pre-shared key
    Cipher([u8; KEY_LEN]),
}

impl FilterKind {
    /// Select the filter for an optional key file
    pub fn from_key_file(path: Option<&str>) -> Result<Self, FilterError> {
        match path {
            Some(path) => Ok(Self::Cipher(crypto::load_key_file(path)?)),
            None => Ok(Self::Identity),
        }
    }

    /// Build a fresh filter instance for one pump
    pub fn build(&self) -> Result<Box<dyn DataFilter>, FilterError> {
        match self {
            Self::Identity => Ok(Box::new(IdentityFilter)),
            Self::Cipher(key) => Ok(Box::new(CipherFilter::new(key)?)),
        }
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Cipher(_) => "cipher",
        }
    }
}

impl std::fmt::Debug for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
