//! Server agent
//!
//! Accepts tunnel exchanges over HTTP/1.1 and relays them to destinations:
//! - [`ConnectionRegistry`]: key → connection table and request routing
//! - [`TunnelConnection`]: sequencing, destination pump and idle reaping
//! - [`RequestAccessor`]: one HTTP exchange as seen by the connection loops

mod accessor;
mod connection;
mod registry;

pub use accessor::{BoxError, RequestAccessor, ResponseHandle, TunnelBody};
pub use connection::{DestroyCallback, PendingRequest, TunnelConnection};
pub use registry::{ConnectionInfo, ConnectionRegistry, RegistrySettings};

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Serve tunnel exchanges from `listener` until the task is dropped
pub async fn serve(listener: TcpListener, registry: ConnectionRegistry) -> crate::Result<()> {
    info!("Tunnel server listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };
        debug!("New HTTP connection from {}", peer_addr);
        stream.set_nodelay(true).ok();

        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request| {
                let registry = registry.clone();
                async move { registry.handle(request).await }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("HTTP connection from {} ended: {}", peer_addr, e);
            }
        });
    }
}
