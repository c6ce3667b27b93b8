//! Destination dialing
//!
//! The server agent opens one raw TCP socket per tunneled connection. Dialing
//! goes through the [`Dialer`] trait so the registry can be exercised with
//! instrumented dialers.

mod tcp;

pub use tcp::TcpDialer;

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::net::TcpStream;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection to {addr} failed: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Connection to {0} timed out")]
    Timeout(String),
}

/// Opens TCP connections to destinations
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `addr` (`host:port`)
    async fn dial(&self, addr: &str) -> Result<TcpStream, TransportError>;
}

/// Dialing options
#[derive(Debug, Clone)]
pub(crate) struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm on dialed sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            nodelay: true,
        }
    }
}
