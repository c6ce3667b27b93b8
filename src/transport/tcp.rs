//! Plain TCP dialer

use super::{Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dials destinations with a connect timeout
#[derive(Debug, Clone, Default)]
pub struct TcpDialer {
    config: TransportConfig,
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> Result<TcpStream, TransportError> {
        let timeout = Duration::from_secs(self.config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout(addr.to_string()))?
            .map_err(|source| TransportError::ConnectionFailed {
                addr: addr.to_string(),
                source,
            })?;

        if self.config.nodelay {
            stream.set_nodelay(true).ok();
        }

        debug!("Dialed {}", addr);
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let mut stream = TcpDialer::default().dial(&addr.to_string()).await.unwrap();
        stream.write_all(b"Hello, TCP!").await.unwrap();

        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"Hello, TCP!");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nobody listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = TcpDialer::default().dial(&addr.to_string()).await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed { .. })));
    }
}
