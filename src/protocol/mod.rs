//! Wire protocol definitions
//!
//! Every tunnel exchange is a plain HTTP request:
//!
//! ```text
//! POST /d?c=<key>&a=<destination>&s=<sequence>   body = outbound chunk
//! GET  /k?c=<key>                                 keep-alive, empty body
//! ```
//!
//! `a` is only needed on the first contact for a key, `s` only on data
//! exchanges. The server answers 200 on success and 502 otherwise.

use hyper::Uri;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

/// Query key carrying the connection key
pub const QK_CONN_KEY: &str = "c";

/// Query key carrying the destination address
pub const QK_ADDR: &str = "a";

/// Query key carrying the sequence number
pub const QK_SEQ: &str = "s";

/// Path of a data exchange
pub const PATH_DATA: &str = "d";

/// Path of a keep-alive exchange
pub const PATH_KEEPALIVE: &str = "k";

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Missing query parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("Invalid query parameter '{name}': {value}")]
    InvalidParameter { name: &'static str, value: String },

    #[error("Unknown path: {0}")]
    UnknownPath(String),

    #[error("Invalid server address: {0}")]
    InvalidServerAddress(String),

    #[error("Sequence mismatch: expected {expected}, got {actual}")]
    SequenceMismatch { expected: u64, actual: u64 },

    #[error("Connection not found: {0}")]
    UnknownConnection(ConnectionKey),

    #[error("Connection is still dialing: {0}")]
    ConnectionDialing(ConnectionKey),

    #[error("Connection closed: {0}")]
    ConnectionClosed(ConnectionKey),
}

/// Microseconds since the Unix epoch
pub fn timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Identifies one tunneled TCP connection across all of its HTTP exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionKey(pub u64);

impl ConnectionKey {
    /// Allocate a fresh key from a strictly monotonic microsecond clock
    pub fn next() -> Self {
        static LAST: AtomicU64 = AtomicU64::new(0);

        let now = timestamp_micros();
        let mut last = LAST.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match LAST.compare_exchange_weak(last, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Self(candidate),
                Err(actual) => last = actual,
            }
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ConnectionKey {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| ProtocolError::InvalidParameter {
                name: QK_CONN_KEY,
                value: s.to_string(),
            })
    }
}

/// Kind of exchange a request represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Data exchange carrying the given sequence number
    Data { seq: u64 },
    /// Keep-alive, exempt from sequencing
    KeepAlive,
}

/// Decoded tunnel request line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    /// Connection key
    pub key: ConnectionKey,
    /// Destination address, present on first contact
    pub destination: Option<String>,
    /// Exchange kind
    pub kind: RequestKind,
}

impl TunnelRequest {
    /// Build a data exchange
    pub fn data(key: ConnectionKey, seq: u64, destination: Option<String>) -> Self {
        Self {
            key,
            destination,
            kind: RequestKind::Data { seq },
        }
    }

    /// Build a keep-alive exchange
    pub fn keep_alive(key: ConnectionKey) -> Self {
        Self {
            key,
            destination: None,
            kind: RequestKind::KeepAlive,
        }
    }

    /// Decode a request from its URI
    pub fn from_uri(uri: &Uri) -> Result<Self, ProtocolError> {
        let mut key = None;
        let mut destination = None;
        let mut seq = None;

        if let Some(query) = uri.query() {
            for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
                match name.as_ref() {
                    QK_CONN_KEY => key = Some(value.parse::<ConnectionKey>()?),
                    QK_ADDR if !value.is_empty() => destination = Some(value.into_owned()),
                    QK_SEQ => {
                        seq = Some(value.parse::<u64>().map_err(|_| {
                            ProtocolError::InvalidParameter {
                                name: QK_SEQ,
                                value: value.to_string(),
                            }
                        })?)
                    }
                    _ => {}
                }
            }
        }

        let key = key.ok_or(ProtocolError::MissingParameter(QK_CONN_KEY))?;

        let kind = match uri.path().trim_start_matches('/') {
            PATH_DATA => RequestKind::Data {
                seq: seq.ok_or(ProtocolError::MissingParameter(QK_SEQ))?,
            },
            PATH_KEEPALIVE => RequestKind::KeepAlive,
            other => return Err(ProtocolError::UnknownPath(other.to_string())),
        };

        Ok(Self {
            key,
            destination,
            kind,
        })
    }

    /// Encode the request as an absolute `http://` URI aimed at `server`
    pub fn to_uri(&self, server: &str) -> Result<Uri, ProtocolError> {
        let path = match self.kind {
            RequestKind::Data { .. } => PATH_DATA,
            RequestKind::KeepAlive => PATH_KEEPALIVE,
        };

        let mut url = Url::parse(&format!("http://{}/{}", server, path))
            .map_err(|_| ProtocolError::InvalidServerAddress(server.to_string()))?;

        {
            let mut query = url.query_pairs_mut();
            query.append_pair(QK_CONN_KEY, &self.key.to_string());
            if let Some(destination) = &self.destination {
                query.append_pair(QK_ADDR, destination);
            }
            if let RequestKind::Data { seq } = self.kind {
                query.append_pair(QK_SEQ, &seq.to_string());
            }
        }

        url.as_str()
            .parse::<Uri>()
            .map_err(|_| ProtocolError::InvalidServerAddress(server.to_string()))
    }
}
