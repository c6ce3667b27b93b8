//! Tunnel layer - the client-side HTTP leg
//!
//! Provides:
//! - The [`Packet`] marker shared by every block queue
//! - [`TunnelLink`], which turns a stream of blocks into sequenced HTTP
//!   exchanges with the server agent

mod link;

pub use link::{http_client, HttpClient, LinkSettings, TunnelLink};

use bytes::Bytes;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Queue closed")]
    Closed,

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Server answered {0}")]
    BadStatus(hyper::StatusCode),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}

/// One entry of a block queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// A block of payload bytes
    Data(Bytes),
    /// No more blocks will follow
    End,
}

impl Packet {
    /// Payload of a data packet
    pub fn into_data(self) -> Option<Bytes> {
        match self {
            Packet::Data(data) => Some(data),
            Packet::End => None,
        }
    }
}
