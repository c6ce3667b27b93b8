//! Connection registry
//!
//! Maps connection keys to live [`TunnelConnection`]s and routes every
//! inbound HTTP exchange to the right one. First contact for a key reserves
//! a `Dialing` slot before the destination is dialed, so concurrent first
//! contacts never dial twice.

use super::accessor::{BoxError, RequestAccessor, TunnelBody};
use super::connection::{PendingRequest, TunnelConnection};
use crate::filter::FilterKind;
use crate::protocol::{ConnectionKey, ProtocolError, RequestKind, TunnelRequest};
use crate::transport::Dialer;
use bytes::Bytes;
use hyper::body::{Body, Incoming};
use hyper::{Request, Response, StatusCode, Uri};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings shared by every connection of a registry
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Idle time after which a connection is reaped
    pub idle_timeout: Duration,
    /// Filter installed on destination pumps
    pub filter: FilterKind,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(100),
            filter: FilterKind::Identity,
        }
    }
}

/// Point-in-time view of one live connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub key: ConnectionKey,
    pub destination: String,
    pub sequence: u64,
    pub idle: Duration,
}

enum Slot {
    Dialing,
    Live(Arc<TunnelConnection>),
}

struct Shared {
    table: RwLock<HashMap<ConnectionKey, Slot>>,
    dialer: Arc<dyn Dialer>,
    settings: RegistrySettings,
    next_id: AtomicU64,
}

impl Shared {
    /// Drop the entry for `key` if it still belongs to generation `id`
    fn remove(&self, key: ConnectionKey, id: u64) {
        let mut table = self.table.write();
        if let Some(Slot::Live(conn)) = table.get(&key) {
            if conn.id() == id {
                table.remove(&key);
                debug!("Unregistered {} ({} left)", key, table.len());
            }
        }
    }
}

/// Releases a `Dialing` slot if the dial never completes
struct DialReservation<'a> {
    shared: &'a Shared,
    key: ConnectionKey,
}

impl Drop for DialReservation<'_> {
    fn drop(&mut self) {
        let mut table = self.shared.table.write();
        if matches!(table.get(&self.key), Some(Slot::Dialing)) {
            table.remove(&self.key);
        }
    }
}

/// Server-side table of tunneled connections
#[derive(Clone)]
pub struct ConnectionRegistry {
    shared: Arc<Shared>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new(dialer: Arc<dyn Dialer>, settings: RegistrySettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                table: RwLock::new(HashMap::new()),
                dialer,
                settings,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// hyper service entry point
    pub async fn handle(&self, request: Request<Incoming>) -> Result<Response<TunnelBody>, Infallible> {
        let (parts, body) = request.into_parts();
        Ok(self.dispatch(&parts.uri, body).await)
    }

    /// Route one exchange; every failure becomes a 502
    pub async fn dispatch<B>(&self, uri: &Uri, body: B) -> Response<TunnelBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        match self.route(uri, body).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Rejected {}: {}", uri, e);
                status_only(StatusCode::BAD_GATEWAY)
            }
        }
    }

    async fn route<B>(&self, uri: &Uri, body: B) -> crate::Result<Response<TunnelBody>>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let request = TunnelRequest::from_uri(uri)?;

        match request.kind {
            RequestKind::KeepAlive => {
                self.lookup(request.key)?.keep_alive();
                Ok(status_only(StatusCode::OK))
            }
            RequestKind::Data { seq } => {
                let conn = self.resolve(&request).await?;
                let (accessor, handle) = RequestAccessor::new(uri.clone(), body);
                conn.accept_request(PendingRequest { seq, accessor }).await?;
                Ok(handle.into_response().await)
            }
        }
    }

    fn lookup(&self, key: ConnectionKey) -> Result<Arc<TunnelConnection>, ProtocolError> {
        match self.shared.table.read().get(&key) {
            Some(Slot::Live(conn)) => Ok(Arc::clone(conn)),
            Some(Slot::Dialing) => Err(ProtocolError::ConnectionDialing(key)),
            None => Err(ProtocolError::UnknownConnection(key)),
        }
    }

    /// Find the connection for a data exchange, dialing on first contact
    async fn resolve(&self, request: &TunnelRequest) -> crate::Result<Arc<TunnelConnection>> {
        let key = request.key;
        match self.lookup(key) {
            Err(ProtocolError::UnknownConnection(_)) => {}
            found => return Ok(found?),
        }

        let Some(destination) = request.destination.clone() else {
            return Err(ProtocolError::UnknownConnection(key).into());
        };

        {
            let mut table = self.shared.table.write();
            match table.get(&key) {
                Some(Slot::Live(conn)) => return Ok(Arc::clone(conn)),
                Some(Slot::Dialing) => return Err(ProtocolError::ConnectionDialing(key).into()),
                None => {
                    table.insert(key, Slot::Dialing);
                }
            }
        }
        let _reservation = DialReservation {
            shared: &self.shared,
            key,
        };

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let registry: Weak<Shared> = Arc::downgrade(&self.shared);
        let on_destroy = Box::new(move |key: ConnectionKey, id: u64| {
            if let Some(shared) = registry.upgrade() {
                shared.remove(key, id);
            }
        });

        info!("Dialing {} for {}", destination, key);
        let conn = TunnelConnection::open(
            key,
            destination,
            self.shared.dialer.as_ref(),
            &self.shared.settings,
            id,
            on_destroy,
        )
        .await?;

        {
            let mut table = self.shared.table.write();
            if conn.is_destroyed() {
                table.remove(&key);
                return Err(ProtocolError::ConnectionClosed(key).into());
            }
            table.insert(key, Slot::Live(Arc::clone(&conn)));
        }

        Ok(conn)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.shared
            .table
            .read()
            .values()
            .filter(|slot| matches!(slot, Slot::Live(_)))
            .count()
    }

    /// True when no connection is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live connection for `key`
    pub fn get(&self, key: ConnectionKey) -> Option<Arc<TunnelConnection>> {
        self.lookup(key).ok()
    }

    /// Describe every live connection, ordered by key
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .shared
            .table
            .read()
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(conn) => Some(ConnectionInfo {
                    key: conn.key(),
                    destination: conn.destination().to_string(),
                    sequence: conn.sequence(),
                    idle: conn.idle_for(),
                }),
                Slot::Dialing => None,
            })
            .collect();
        infos.sort_by_key(|info| info.key);
        infos
    }
}

fn status_only(status: StatusCode) -> Response<TunnelBody> {
    let mut response = Response::new(TunnelBody::empty());
    *response.status_mut() = status;
    response
}
