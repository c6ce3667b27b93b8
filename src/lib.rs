//! # HTTP Tunnel
//!
//! Carries arbitrary TCP byte streams across networks that only let HTTP
//! through. Each tunneled TCP connection becomes a sequence of HTTP
//! request/response exchanges between a client agent (next to the
//! application) and a server agent (next to the real destination).
//!
//! ## Architecture
//!
//! ```text
//!  local app                                              destination
//!      │                                                       ▲
//!      ▼                                                       │
//! ┌────────────┐   ┌────────────┐  HTTP  ┌──────────────────┐ ┌────────────┐
//! │ SocketPump │──▶│ TunnelLink │───────▶│ConnectionRegistry│▶│ SocketPump │
//! │  (client)  │◀──│  (client)  │◀───────│ TunnelConnection │◀│  (server)  │
//! └────────────┘   └────────────┘        └──────────────────┘ └────────────┘
//!        ▲ BridgeServer                          server agent
//! ```
//!
//! Every exchange is identified by a connection key (`c`), and data
//! exchanges carry a sequence number (`s`) that the server agent enforces
//! strictly, so independent HTTP round trips still deliver bytes in order.

pub mod client;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod debug;
pub mod filter;
pub mod protocol;
pub mod pump;
pub mod server;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a single data block (64 KB)
pub const BLOCK_SIZE: usize = 65536;

/// Capacity of every bounded block/request queue
pub const QUEUE_DEPTH: usize = 100;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Filter error: {0}")]
    Filter(#[from] filter::FilterError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}
