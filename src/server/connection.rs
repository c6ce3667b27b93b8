//! Server-side tunneled connection
//!
//! One [`TunnelConnection`] exists per connection key. It owns the pump to
//! the destination and three loops:
//!
//! - processing: drains each accepted request body into the destination
//! - response: answers each request with whatever the destination sent,
//!   keeping only the newest request parked while the destination is quiet
//! - reaper: destroys the connection when idle or when the destination is gone

use super::accessor::RequestAccessor;
use super::registry::RegistrySettings;
use crate::protocol::{timestamp_micros, ConnectionKey, ProtocolError};
use crate::pump::{SocketPump, Wait};
use crate::transport::Dialer;
use crate::tunnel::{Packet, TunnelError};
use crate::QUEUE_DEPTH;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Called once when a connection is destroyed, with its key and generation id
pub type DestroyCallback = Box<dyn Fn(ConnectionKey, u64) + Send + Sync>;

/// A data exchange accepted for a connection
pub struct PendingRequest {
    /// Sequence number carried by the request
    pub seq: u64,
    /// Request/response accessor
    pub accessor: RequestAccessor,
}

/// A tunneled TCP connection on the server agent
pub struct TunnelConnection {
    key: ConnectionKey,
    destination: String,
    id: u64,
    /// Serializes sequence checks and enqueueing
    requests: Mutex<mpsc::Sender<PendingRequest>>,
    seq: AtomicU64,
    last_active: AtomicU64,
    pump: Arc<SocketPump>,
    shutdown: watch::Sender<bool>,
    destroyed: AtomicBool,
    idle_timeout: Duration,
    on_destroy: DestroyCallback,
}

impl TunnelConnection {
    /// Dial `destination` and start the connection loops
    pub async fn open(
        key: ConnectionKey,
        destination: String,
        dialer: &dyn Dialer,
        settings: &RegistrySettings,
        id: u64,
        on_destroy: DestroyCallback,
    ) -> crate::Result<Arc<Self>> {
        let stream = dialer.dial(&destination).await?;
        let pump = Arc::new(SocketPump::new(stream, settings.filter.build()?));

        let (requests_tx, requests_rx) = mpsc::channel(QUEUE_DEPTH);
        let (responses_tx, responses_rx) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);

        let conn = Arc::new(Self {
            key,
            destination,
            id,
            requests: Mutex::new(requests_tx),
            seq: AtomicU64::new(0),
            last_active: AtomicU64::new(timestamp_micros()),
            pump: Arc::clone(&pump),
            shutdown,
            destroyed: AtomicBool::new(false),
            idle_timeout: settings.idle_timeout,
            on_destroy,
        });

        tokio::spawn(processing_loop(
            key,
            Arc::clone(&pump),
            requests_rx,
            responses_tx,
            conn.shutdown.subscribe(),
        ));
        tokio::spawn(response_loop(
            key,
            pump,
            responses_rx,
            conn.shutdown.subscribe(),
        ));
        tokio::spawn(reaper_loop(Arc::downgrade(&conn), conn.shutdown.subscribe()));

        info!("Connection opened: {}", conn);
        Ok(conn)
    }

    /// Accept a data exchange if it carries the next sequence number
    ///
    /// On mismatch the exchange is failed and the connection is left untouched.
    pub async fn accept_request(&self, mut pending: PendingRequest) -> Result<(), ProtocolError> {
        let requests = self.requests.lock().await;

        let expected = self.seq.load(Ordering::Acquire) + 1;
        if pending.seq != expected {
            warn!(
                "Sequence mismatch on {}: expected {}, got {}",
                self.key, expected, pending.seq
            );
            pending.accessor.set_error_happened();
            return Err(ProtocolError::SequenceMismatch {
                expected,
                actual: pending.seq,
            });
        }

        if let Err(mpsc::error::SendError(mut rejected)) = requests.send(pending).await {
            rejected.accessor.set_error_happened();
            return Err(ProtocolError::ConnectionClosed(self.key));
        }

        self.seq.store(expected, Ordering::Release);
        self.last_active.store(timestamp_micros(), Ordering::Release);
        debug!("Accepted request {} on {}", expected, self.key);
        Ok(())
    }

    /// Refresh the activity timestamp
    pub fn keep_alive(&self) {
        self.last_active.store(timestamp_micros(), Ordering::Release);
        debug!("Keep-alive on {}", self.key);
    }

    /// Connection key
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Destination address
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Generation id, distinguishing reuses of the same key
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Last accepted sequence number
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Last activity, in microseconds since the Unix epoch
    pub fn last_activity(&self) -> u64 {
        self.last_active.load(Ordering::Acquire)
    }

    /// Time since the last activity
    pub fn idle_for(&self) -> Duration {
        Duration::from_micros(timestamp_micros().saturating_sub(self.last_activity()))
    }

    /// True once [`destroy`](Self::destroy) ran
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Tear the connection down; later calls do nothing
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        info!("Destroying connection: {}", self);
        (self.on_destroy)(self.key, self.id);
        self.shutdown.send_replace(true);
        self.pump.destroy();
    }
}

impl fmt::Display for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key={} dest={} seq={} {}",
            self.key,
            self.destination,
            self.sequence(),
            self.pump
        )
    }
}

async fn processing_loop(
    key: ConnectionKey,
    pump: Arc<SocketPump>,
    mut requests: mpsc::Receiver<PendingRequest>,
    responses: mpsc::Sender<RequestAccessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let mut pending = tokio::select! {
            _ = shutdown.changed() => break,
            pending = requests.recv() => match pending {
                Some(pending) => pending,
                None => break,
            },
        };

        let mut delivered = true;
        while let Some(chunk) = pending.accessor.pop_data().await {
            if let Err(e) = pump.push(chunk).await {
                warn!("Forwarding request {} on {} failed: {}", pending.seq, key, e);
                delivered = false;
                break;
            }
        }

        if !delivered || pending.accessor.body_failed() {
            pending.accessor.set_error_happened();
            continue;
        }

        pending.accessor.start_response();
        if responses.send(pending.accessor).await.is_err() {
            break;
        }
    }

    debug!("Processing loop for {} stopped", key);
}

async fn response_loop(
    key: ConnectionKey,
    pump: Arc<SocketPump>,
    mut responses: mpsc::Receiver<RequestAccessor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next: Option<RequestAccessor> = None;

    loop {
        let mut accessor = match next.take() {
            Some(accessor) => accessor,
            None => tokio::select! {
                _ = shutdown.changed() => break,
                accessor = responses.recv() => match accessor {
                    Some(accessor) => accessor,
                    None => break,
                },
            },
        };

        // Only the newest exchange stays parked waiting for the destination
        let first = tokio::select! {
            _ = shutdown.changed() => {
                accessor.set_error_happened();
                break;
            }
            block = pump.pop(Wait::Block) => block,
            later = responses.recv() => {
                let Some(later) = later else {
                    accessor.set_error_happened();
                    break;
                };
                debug!("Response on {} handed over to a later exchange", key);
                next = Some(later);
                if let Err(e) = write_response(&mut accessor, &pump, None).await {
                    debug!("Response on {} abandoned: {}", key, e);
                }
                continue;
            }
        };

        let Some(first) = first else {
            warn!("Destination of {} closed with a response pending", key);
            accessor.set_error_happened();
            continue;
        };

        if let Err(e) = write_response(&mut accessor, &pump, Some(first)).await {
            debug!("Response on {} abandoned: {}", key, e);
        }
    }

    debug!("Response loop for {} stopped", key);
}

/// Write `first` plus everything already queued, then end the response
async fn write_response(
    accessor: &mut RequestAccessor,
    pump: &SocketPump,
    first: Option<Bytes>,
) -> Result<(), TunnelError> {
    if let Some(first) = first {
        accessor.push_data(Packet::Data(first)).await?;
    }
    while let Some(block) = pump.pop(Wait::Try).await {
        accessor.push_data(Packet::Data(block)).await?;
    }
    accessor.push_data(Packet::End).await
}

async fn reaper_loop(conn: Weak<TunnelConnection>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(conn) = conn.upgrade() else {
            break;
        };

        if conn.idle_for() > conn.idle_timeout {
            info!("Connection {} idle for {:?}", conn.key, conn.idle_for());
            conn.destroy();
            break;
        }
        if !conn.pump.is_alive() {
            info!("Destination of {} is gone", conn.key);
            conn.destroy();
            break;
        }
    }
}
