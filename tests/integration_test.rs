//! Integration tests for HTTP Tunnel
//!
//! Runs both agents on loopback ports and checks the full path:
//! - local client → client agent → HTTP → server agent → destination
//! - keep-alives holding an idle connection open
//! - the cipher filter on both legs
//! - the status endpoint

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use http_tunnel::client::{BridgeServer, BridgeSettings};
use http_tunnel::filter::FilterKind;
use http_tunnel::server::{self, ConnectionRegistry, RegistrySettings};
use http_tunnel::transport::TcpDialer;
use http_tunnel::tunnel::http_client;
use http_tunnel::debug;
use hyper::{Request, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Running pair of agents
struct Tunnel {
    local: SocketAddr,
    registry: ConnectionRegistry,
}

/// Echo server standing in for the real destination
async fn echo_destination() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

/// Destination that greets before reading anything
async fn banner_destination(banner: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                socket.write_all(banner).await.unwrap();
                let mut buf = [0u8; 64];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    addr
}

async fn start_tunnel(
    destination: SocketAddr,
    filter: FilterKind,
    idle_timeout: Duration,
    keep_alive: Duration,
) -> Tunnel {
    // Server agent
    let server_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server_listener.local_addr().unwrap();
    let registry = ConnectionRegistry::new(
        Arc::new(TcpDialer::default()),
        RegistrySettings {
            idle_timeout,
            filter: filter.clone(),
        },
    );
    tokio::spawn(server::serve(server_listener, registry.clone()));

    // Client agent
    let local_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = local_listener.local_addr().unwrap();
    let bridge = BridgeServer::new(BridgeSettings {
        bind_address: local.to_string(),
        server_address: server_addr.to_string(),
        destination: destination.to_string(),
        keep_alive,
        filter,
    });
    tokio::spawn(async move { bridge.serve(local_listener).await });

    Tunnel { local, registry }
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    tokio::time::timeout(Duration::from_secs(10), stream.read_exact(&mut buf))
        .await
        .expect("Timed out reading through the tunnel")
        .unwrap();
    buf
}

/// Test a short message round trip through both agents
#[tokio::test]
async fn test_ping_through_tunnel() {
    let destination = echo_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    client.write_all(b"PING").await.unwrap();

    let reply = read_exactly(&mut client, 4).await;
    assert_eq!(&reply, b"PING");
    assert_eq!(tunnel.registry.len(), 1);
}

/// Test several exchanges on one connection keep their order
#[tokio::test]
async fn test_sequential_messages() {
    let destination = echo_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    for i in 0..5 {
        let message = format!("message-{}", i);
        client.write_all(message.as_bytes()).await.unwrap();
        let reply = read_exactly(&mut client, message.len()).await;
        assert_eq!(reply, message.as_bytes());
    }

    let info = tunnel.registry.snapshot();
    assert_eq!(info.len(), 1);
    assert!(info[0].sequence >= 6);
}

/// Test a payload spanning many blocks
#[tokio::test]
async fn test_large_payload() {
    let destination = echo_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let payload: Vec<u8> = (0..300_000).map(|i| (i % 251) as u8).collect();
    let client = TcpStream::connect(tunnel.local).await.unwrap();
    let (mut reader, mut writer) = client.into_split();

    let expected = payload.clone();
    let writer_task = tokio::spawn(async move {
        writer.write_all(&payload).await.unwrap();
        writer
    });

    let mut received = vec![0u8; expected.len()];
    tokio::time::timeout(Duration::from_secs(30), reader.read_exact(&mut received))
        .await
        .expect("Timed out reading large payload")
        .unwrap();
    assert_eq!(received, expected);

    let _writer = writer_task.await.unwrap();
}

/// Test a destination that speaks before the client sends anything
#[tokio::test]
async fn test_destination_speaks_first() {
    let destination = banner_destination(b"220 ready\r\n").await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    let banner = read_exactly(&mut client, 11).await;
    assert_eq!(&banner, b"220 ready\r\n");
}

/// Test keep-alives preventing the idle reaper from closing a quiet connection
#[tokio::test]
async fn test_keep_alive_holds_connection() {
    let destination = echo_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(2),
        Duration::from_millis(500),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    client.write_all(b"before").await.unwrap();
    assert_eq!(read_exactly(&mut client, 6).await, b"before");

    tokio::time::sleep(Duration::from_millis(4000)).await;
    assert_eq!(tunnel.registry.len(), 1);

    client.write_all(b"after").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"after");
}

/// Test the cipher filter on both legs
#[tokio::test]
async fn test_cipher_filter_round_trip() {
    let destination = echo_destination().await;
    let key = [0x24u8; 32];
    let tunnel = start_tunnel(
        destination,
        FilterKind::Cipher(key),
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    client.write_all(b"sealed hello").await.unwrap();
    assert_eq!(read_exactly(&mut client, 12).await, b"sealed hello");
}

/// Test independent connections sharing the agents
#[tokio::test]
async fn test_concurrent_connections() {
    let destination = echo_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..4 {
        let local = tunnel.local;
        tasks.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(local).await.unwrap();
            let message = format!("client-{}", i);
            client.write_all(message.as_bytes()).await.unwrap();
            let reply = read_exactly(&mut client, message.len()).await;
            assert_eq!(reply, message.as_bytes());
            client
        }));
    }

    let mut clients = Vec::new();
    for task in tasks {
        clients.push(task.await.unwrap());
    }
    assert_eq!(tunnel.registry.len(), 4);
}

/// Test the status endpoint reporting a live connection
#[tokio::test]
async fn test_status_endpoint() {
    let destination = echo_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let status_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let status_addr = status_listener.local_addr().unwrap();
    tokio::spawn(debug::serve(status_listener, tunnel.registry.clone()));

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    client.write_all(b"PING").await.unwrap();
    assert_eq!(read_exactly(&mut client, 4).await, b"PING");

    let http = http_client();
    let request = Request::get(format!("http://{}/connections", status_addr))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = http.request(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert_eq!(text.lines().count(), 1);
    assert!(text.contains(&format!("dest={}", destination)));
}

/// Destination that sends `one`, then `two` a second later
async fn slow_talker_destination() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                socket.write_all(b"one").await.unwrap();
                tokio::time::sleep(Duration::from_secs(1)).await;
                socket.write_all(b"two").await.unwrap();
                let mut buf = [0u8; 64];
                while let Ok(n) = socket.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    addr
}

/// Destination that writes `reply` and closes
async fn bulk_destination(reply: Vec<u8>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let reply = Arc::clone(&reply);
            tokio::spawn(async move {
                socket.write_all(&reply).await.unwrap();
                socket.shutdown().await.unwrap();
            });
        }
    });

    addr
}

/// Destination that reads `expected` bytes before answering `OK`
async fn sink_destination(expected: usize) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                let mut total = 0;
                while total < expected {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => total += n,
                    }
                }
                socket.write_all(b"OK").await.unwrap();
                let _ = socket.read(&mut buf).await;
            });
        }
    });

    addr
}

/// Test destination output arriving after the previous response finished
#[tokio::test]
async fn test_unsolicited_destination_data_delivered() {
    let destination = slow_talker_destination().await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_millis(500),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    assert_eq!(read_exactly(&mut client, 3).await, b"one");

    let mut buf = [0u8; 3];
    tokio::time::timeout(Duration::from_secs(6), client.read_exact(&mut buf))
        .await
        .expect("second write never crossed the tunnel")
        .unwrap();
    assert_eq!(&buf, b"two");
}

/// Test a large reply followed by the destination closing
#[tokio::test]
async fn test_large_reply_then_close() {
    let reply: Vec<u8> = (0..4 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    let destination = bulk_destination(reply.clone()).await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let mut client = TcpStream::connect(tunnel.local).await.unwrap();
    let mut received = Vec::new();
    tokio::time::timeout(Duration::from_secs(30), client.read_to_end(&mut received))
        .await
        .expect("Timed out reading the reply")
        .unwrap();

    assert_eq!(received.len(), reply.len());
    assert_eq!(received, reply);
}

/// Test a long upload to a destination that only answers at the end
#[tokio::test]
async fn test_long_upload_before_reply() {
    let size = 20 * 1024 * 1024;
    let destination = sink_destination(size).await;
    let tunnel = start_tunnel(
        destination,
        FilterKind::Identity,
        Duration::from_secs(30),
        Duration::from_secs(30),
    )
    .await;

    let client = TcpStream::connect(tunnel.local).await.unwrap();
    let (mut reader, mut writer) = client.into_split();
    let writer_task = tokio::spawn(async move {
        let chunk = vec![0x5au8; 64 * 1024];
        for _ in 0..size / chunk.len() {
            writer.write_all(&chunk).await.unwrap();
        }
        writer
    });

    let mut reply = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(60), reader.read_exact(&mut reply))
        .await
        .expect("reply never arrived")
        .unwrap();
    assert_eq!(&reply, b"OK");

    let _writer = writer_task.await.unwrap();
}
