//! Status endpoint of the server agent
//!
//! Plain-text answers for operators:
//! - `GET /status`: version and live connection count
//! - `GET /connections`: one line per live connection

use crate::server::ConnectionRegistry;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

/// Answer one status request
pub fn render(registry: &ConnectionRegistry, method: &Method, path: &str) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        return text(StatusCode::METHOD_NOT_ALLOWED, String::new());
    }

    match path {
        "/status" => text(
            StatusCode::OK,
            format!(
                "version={}\nconnections={}\n",
                crate::VERSION,
                registry.len()
            ),
        ),
        "/connections" => {
            let mut body = String::new();
            for info in registry.snapshot() {
                let _ = writeln!(
                    body,
                    "key={} dest={} seq={} idle_ms={}",
                    info.key,
                    info.destination,
                    info.sequence,
                    info.idle.as_millis()
                );
            }
            text(StatusCode::OK, body)
        }
        _ => text(StatusCode::NOT_FOUND, String::new()),
    }
}

fn text(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
}

/// Serve the status endpoint from `listener`
pub async fn serve(listener: TcpListener, registry: ConnectionRegistry) -> crate::Result<()> {
    info!("Status endpoint listening on {}", listener.local_addr()?);

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("Accept error: {}", e);
                continue;
            }
        };

        let registry = registry.clone();
        tokio::spawn(async move {
            let service = service_fn(move |request: Request<Incoming>| {
                let response = render(&registry, request.method(), request.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!("Status connection from {} ended: {}", peer_addr, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RegistrySettings;
    use crate::transport::TcpDialer;
    use http_body_util::BodyExt;
    use std::sync::Arc;

    fn empty_registry() -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(TcpDialer::default()), RegistrySettings::default())
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_status_reports_count() {
        let response = render(&empty_registry(), &Method::GET, "/status");
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.contains("connections=0"));
        assert!(body.contains(crate::VERSION));
    }

    #[tokio::test]
    async fn test_connections_empty() {
        let response = render(&empty_registry(), &Method::GET, "/connections");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.is_empty());
    }

    #[test]
    fn test_unknown_path_and_method() {
        let registry = empty_registry();
        assert_eq!(
            render(&registry, &Method::GET, "/metrics").status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            render(&registry, &Method::POST, "/status").status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
    }
}
