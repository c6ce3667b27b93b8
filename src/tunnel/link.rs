//! Client-side tunnel link
//!
//! A [`TunnelLink`] carries one tunneled connection over HTTP. Blocks pushed
//! with [`TunnelLink::push_request`] become sequenced data exchanges; the
//! bodies of their responses come back, in order, through
//! [`TunnelLink::pop_response`]. One data exchange is always outstanding,
//! empty if need be, so the server can answer whenever the destination
//! speaks. Idle periods are covered by keep-alives.

use super::{Packet, TunnelError};
use crate::protocol::{ConnectionKey, TunnelRequest};
use crate::{BLOCK_SIZE, QUEUE_DEPTH};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// Upper bound on the body of one data exchange
const MAX_EXCHANGE_BYTES: usize = 16 * BLOCK_SIZE;

/// HTTP client shared by every link of a client agent
pub type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Build the shared HTTP client
pub fn http_client() -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_nodelay(true);
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Where and how a link talks to the server agent
#[derive(Debug, Clone)]
pub struct LinkSettings {
    /// Server agent address (`host:port`)
    pub server_address: String,
    /// Destination the server agent should dial
    pub destination: String,
    /// Quiet period after which a keep-alive is sent
    pub keep_alive: Duration,
}

/// One tunneled connection, client side
pub struct TunnelLink {
    key: ConnectionKey,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    alive: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
}

impl TunnelLink {
    /// Start the send and response loops for `key`
    pub fn open(settings: &LinkSettings, client: HttpClient, key: ConnectionKey) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (responses_tx, responses_rx) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);
        let alive = Arc::new(AtomicBool::new(true));
        let pending = Arc::new(InFlight::default());

        let sender = Sender {
            key,
            settings: settings.clone(),
            client,
            alive: Arc::clone(&alive),
            pending: Arc::clone(&pending),
            seq: 0,
        };
        tokio::spawn(sender.run(outbound_rx, responses_tx, shutdown.subscribe()));
        tokio::spawn(response_loop(
            key,
            responses_rx,
            inbound_tx,
            Arc::clone(&alive),
            pending,
            shutdown.subscribe(),
        ));

        info!("Link {} opened towards {}", key, settings.destination);
        Self {
            key,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            alive,
            shutdown,
        }
    }

    /// Connection key of this link
    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// Queue a block to be sent with the next data exchange
    pub async fn push_request(&self, block: Bytes) -> Result<(), TunnelError> {
        if !self.is_alive() {
            return Err(TunnelError::Closed);
        }
        self.outbound
            .send(block)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    /// Next block received from the server agent, `None` once the link is dead
    pub async fn pop_response(&self) -> Option<Bytes> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .and_then(Packet::into_data)
    }

    /// True until an exchange fails or the link is destroyed
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop both loops
    pub fn destroy(&self) {
        info!("Destroying link {}", self.key);
        self.alive.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
    }
}

impl Drop for TunnelLink {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

/// Data exchanges whose response body has not ended yet
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn started(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn finished(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        self.drained.notify_one();
    }

    fn is_idle(&self) -> bool {
        self.count.load(Ordering::Acquire) == 0
    }
}

/// Owns the sequence counter and issues every exchange of one link
struct Sender {
    key: ConnectionKey,
    settings: LinkSettings,
    client: HttpClient,
    alive: Arc<AtomicBool>,
    pending: Arc<InFlight>,
    seq: u64,
}

impl Sender {
    async fn run(
        mut self,
        mut outbound: mpsc::Receiver<Bytes>,
        responses: mpsc::Sender<Response<Incoming>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // Empty first contact so the server dials before any local data
        if let Err(e) = self.send_data(Bytes::new(), &responses).await {
            warn!("First contact for {} failed: {}", self.key, e);
            self.alive.store(false, Ordering::Release);
            return;
        }

        let pending = Arc::clone(&self.pending);
        loop {
            if *shutdown.borrow() {
                break;
            }

            // Keep one exchange outstanding so destination output always has
            // a response to travel back in
            if pending.is_idle() {
                let body = match outbound.try_recv() {
                    Ok(block) => coalesce(block, &mut outbound),
                    Err(mpsc::error::TryRecvError::Empty) => Bytes::new(),
                    Err(mpsc::error::TryRecvError::Disconnected) => break,
                };
                if let Err(e) = self.send_data(body, &responses).await {
                    warn!("Exchange on {} failed: {}", self.key, e);
                    break;
                }
                continue;
            }

            let result = tokio::select! {
                _ = shutdown.changed() => break,
                block = outbound.recv() => match block {
                    Some(block) => self.send_data(coalesce(block, &mut outbound), &responses).await,
                    None => break,
                },
                _ = pending.drained.notified() => continue,
                _ = tokio::time::sleep(self.settings.keep_alive) => self.send_keep_alive().await,
            };

            if let Err(e) = result {
                warn!("Exchange on {} failed: {}", self.key, e);
                break;
            }
        }

        self.alive.store(false, Ordering::Release);
        debug!("Send loop for {} stopped at seq {}", self.key, self.seq);
    }

    async fn send_data(
        &mut self,
        block: Bytes,
        responses: &mpsc::Sender<Response<Incoming>>,
    ) -> Result<(), TunnelError> {
        self.seq += 1;
        let destination = (self.seq == 1).then(|| self.settings.destination.clone());
        let request = TunnelRequest::data(self.key, self.seq, destination);

        debug!("Data exchange {} on {} with {} bytes", self.seq, self.key, block.len());
        self.pending.started();
        let response = match self.exchange(Method::POST, &request, block).await {
            Ok(response) => response,
            Err(e) => {
                self.pending.finished();
                return Err(e);
            }
        };
        responses
            .send(response)
            .await
            .map_err(|_| TunnelError::Closed)
    }

    async fn send_keep_alive(&self) -> Result<(), TunnelError> {
        let request = TunnelRequest::keep_alive(self.key);
        debug!("Keep-alive on {}", self.key);
        self.exchange(Method::GET, &request, Bytes::new()).await?;
        Ok(())
    }

    async fn exchange(
        &self,
        method: Method,
        request: &TunnelRequest,
        body: Bytes,
    ) -> Result<Response<Incoming>, TunnelError> {
        let uri = request.to_uri(&self.settings.server_address)?;
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Full::new(body))
            .map_err(|e| TunnelError::Http(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| TunnelError::Http(e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(TunnelError::BadStatus(response.status()));
        }
        Ok(response)
    }
}

/// Append whatever else is already queued behind `first`, up to the exchange cap
fn coalesce(first: Bytes, outbound: &mut mpsc::Receiver<Bytes>) -> Bytes {
    let Ok(second) = outbound.try_recv() else {
        return first;
    };

    let mut body = BytesMut::with_capacity(first.len() + second.len());
    body.extend_from_slice(&first);
    body.extend_from_slice(&second);
    while body.len() < MAX_EXCHANGE_BYTES {
        match outbound.try_recv() {
            Ok(block) => body.extend_from_slice(&block),
            Err(_) => break,
        }
    }
    body.freeze()
}

async fn response_loop(
    key: ConnectionKey,
    mut responses: mpsc::Receiver<Response<Incoming>>,
    inbound: mpsc::Sender<Packet>,
    alive: Arc<AtomicBool>,
    pending: Arc<InFlight>,
    mut shutdown: watch::Receiver<bool>,
) {
    'responses: loop {
        let response = tokio::select! {
            _ = shutdown.changed() => break,
            response = responses.recv() => match response {
                Some(response) => response,
                None => break,
            },
        };

        let mut body = response.into_body();
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break 'responses,
                frame = body.frame() => frame,
            };

            match frame {
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        continue;
                    };
                    if data.is_empty() {
                        continue;
                    }
                    debug!("Received {} bytes on {}", data.len(), key);
                    if inbound.send(Packet::Data(data)).await.is_err() {
                        break 'responses;
                    }
                }
                Some(Err(e)) => {
                    warn!("Response body on {} failed: {}", key, e);
                    break 'responses;
                }
                None => break,
            }
        }
        pending.finished();
    }

    alive.store(false, Ordering::Release);
    let _ = inbound.try_send(Packet::End);
    debug!("Response loop for {} stopped", key);
}
