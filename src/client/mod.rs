//! Client agent
//!
//! Listens for local TCP clients and bridges each accepted socket to the
//! server agent through its own [`TunnelLink`]:
//!
//! ```text
//! local socket ─▶ SocketPump ─(uplink)─▶ TunnelLink ─▶ server agent
//! local socket ◀─ SocketPump ◀─(downlink)─ TunnelLink ◀─ server agent
//! ```

use crate::filter::FilterKind;
use crate::protocol::ConnectionKey;
use crate::pump::{SocketPump, Wait};
use crate::tunnel::{http_client, HttpClient, LinkSettings, TunnelLink};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// How long a closing bridge keeps delivering data already received
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Client agent settings
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Local listen address
    pub bind_address: String,
    /// Server agent address
    pub server_address: String,
    /// Destination every bridged connection is tunneled to
    pub destination: String,
    /// Keep-alive period of each link
    pub keep_alive: Duration,
    /// Filter installed on local pumps
    pub filter: FilterKind,
}

/// Accepts local connections and tunnels them
pub struct BridgeServer {
    settings: Arc<BridgeSettings>,
    client: HttpClient,
}

impl BridgeServer {
    /// Create a bridge server
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            client: http_client(),
        }
    }

    /// Bind the configured address and serve forever
    pub async fn start(&self) -> crate::Result<()> {
        let listener = TcpListener::bind(&self.settings.bind_address).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`
    pub async fn serve(&self, listener: TcpListener) -> crate::Result<()> {
        info!(
            "Bridging {} to {} via {}",
            listener.local_addr()?,
            self.settings.destination,
            self.settings.server_address
        );

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Accept error: {}", e);
                    continue;
                }
            };
            debug!("Local connection from {}", peer_addr);

            let settings = Arc::clone(&self.settings);
            let client = self.client.clone();
            tokio::spawn(async move {
                if let Err(e) = bridge(stream, &settings, client).await {
                    debug!("Bridge for {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Run one local socket through its own link until either side dies
async fn bridge(stream: TcpStream, settings: &BridgeSettings, client: HttpClient) -> crate::Result<()> {
    stream.set_nodelay(true).ok();

    let key = ConnectionKey::next();
    let pump = Arc::new(SocketPump::new(stream, settings.filter.build()?));
    let link = Arc::new(TunnelLink::open(
        &LinkSettings {
            server_address: settings.server_address.clone(),
            destination: settings.destination.clone(),
            keep_alive: settings.keep_alive,
        },
        client,
        key,
    ));
    info!("Bridging {} as {}", pump, key);

    let mut uplink = tokio::spawn({
        let pump = Arc::clone(&pump);
        let link = Arc::clone(&link);
        async move {
            while let Some(block) = pump.pop(Wait::Block).await {
                if link.push_request(block).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut downlink = tokio::spawn({
        let pump = Arc::clone(&pump);
        let link = Arc::clone(&link);
        async move {
            while let Some(block) = link.pop_response().await {
                if pump.push(block).await.is_err() {
                    break;
                }
            }
        }
    });

    let mut ticker = interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut uplink_done = false;
    let mut downlink_done = false;

    loop {
        tokio::select! {
            _ = &mut uplink, if !uplink_done => uplink_done = true,
            _ = &mut downlink => {
                downlink_done = true;
                break;
            }
            _ = ticker.tick() => {
                if !pump.is_alive() || !link.is_alive() {
                    break;
                }
            }
        }
    }

    // The server side ended first: hand the local client what already arrived
    if downlink_done || !link.is_alive() {
        if !downlink_done {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, &mut downlink).await;
        }
        if tokio::time::timeout(DRAIN_TIMEOUT, pump.flush()).await.is_err() {
            debug!("Bridge {} closed with unwritten data", key);
        }
    }

    info!("Closing bridge {}", key);
    link.destroy();
    pump.destroy();
    uplink.abort();
    downlink.abort();
    Ok(())
}
