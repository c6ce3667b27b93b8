//! Socket pump - one raw TCP socket behind a pair of block queues
//!
//! A pump owns its socket and runs two independent tasks:
//!
//! ```text
//!   push() ──▶ [outbound queue] ──▶ send loop ──▶ on_send ──▶ socket
//!   pop()  ◀── [inbound queue]  ◀── on_receive ◀── recv loop ◀── socket
//! ```
//!
//! Both queues are bounded, so a slow socket throttles its producer.

use crate::filter::DataFilter;
use crate::tunnel::{Packet, TunnelError};
use crate::QUEUE_DEPTH;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tracing::{debug, info, warn};

/// How long [`SocketPump::pop`] may wait for a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Return immediately
    Try,
    /// Wait at most the given duration
    Timeout(Duration),
    /// Wait until a block arrives or the pump dies
    Block,
}

/// State shared between the pump handle and its loops
struct PumpState {
    conn_alive: AtomicBool,
    /// Data blocks sitting in the inbound queue
    queued: AtomicUsize,
    /// Pushed blocks not yet written to the socket
    unsent: AtomicUsize,
    send_open: AtomicBool,
    flushed: Notify,
    peer: String,
    local: String,
}

/// A raw TCP socket exposed as push/pop block queues
pub struct SocketPump {
    state: Arc<PumpState>,
    outbound: mpsc::Sender<Bytes>,
    inbound: Mutex<mpsc::Receiver<Packet>>,
    shutdown: watch::Sender<bool>,
}

impl SocketPump {
    /// Wrap `stream` and start its send and receive loops
    pub fn new(stream: TcpStream, filter: Box<dyn DataFilter>) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        let local = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());

        let state = Arc::new(PumpState {
            conn_alive: AtomicBool::new(true),
            queued: AtomicUsize::new(0),
            unsent: AtomicUsize::new(0),
            send_open: AtomicBool::new(true),
            flushed: Notify::new(),
            peer,
            local,
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(QUEUE_DEPTH);
        let (shutdown, _) = watch::channel(false);

        let block_size = filter.block_size();
        let filter = Arc::new(Mutex::new(filter));
        let (reader, writer) = stream.into_split();

        tokio::spawn(send_loop(
            writer,
            outbound_rx,
            Arc::clone(&filter),
            Arc::clone(&state),
            shutdown.subscribe(),
        ));
        tokio::spawn(recv_loop(
            reader,
            inbound_tx,
            filter,
            block_size,
            Arc::clone(&state),
            shutdown.subscribe(),
        ));

        Self {
            state,
            outbound: outbound_tx,
            inbound: Mutex::new(inbound_rx),
            shutdown,
        }
    }

    /// Queue a block for writing, waiting while the outbound queue is full
    pub async fn push(&self, block: Bytes) -> Result<(), TunnelError> {
        self.state.unsent.fetch_add(1, Ordering::AcqRel);
        self.outbound.send(block).await.map_err(|_| {
            self.state.block_written();
            TunnelError::Closed
        })
    }

    /// Wait until every pushed block is written, or the send loop is gone
    pub async fn flush(&self) {
        loop {
            let flushed = self.state.flushed.notified();
            if self.state.unsent.load(Ordering::Acquire) == 0
                || !self.state.send_open.load(Ordering::Acquire)
            {
                return;
            }
            flushed.await;
        }
    }

    /// Take the next block read from the socket
    ///
    /// Returns `None` when nothing arrived within `wait`, or when the pump
    /// has died and every queued block has been drained.
    pub async fn pop(&self, wait: Wait) -> Option<Bytes> {
        let mut inbound = self.inbound.lock().await;

        let packet = match inbound.try_recv() {
            Ok(packet) => Some(packet),
            Err(mpsc::error::TryRecvError::Disconnected) => None,
            Err(mpsc::error::TryRecvError::Empty) => match wait {
                Wait::Try => None,
                Wait::Timeout(limit) => tokio::time::timeout(limit, inbound.recv())
                    .await
                    .ok()
                    .flatten(),
                Wait::Block => inbound.recv().await,
            },
        };

        let data = packet.and_then(Packet::into_data);
        if data.is_some() {
            self.state.queued.fetch_sub(1, Ordering::AcqRel);
        }
        data
    }

    /// True while the socket is open or read data is still queued
    pub fn is_alive(&self) -> bool {
        self.is_conn_alive() || self.state.queued.load(Ordering::Acquire) > 0
    }

    /// True while the socket itself is open
    pub fn is_conn_alive(&self) -> bool {
        self.state.conn_alive.load(Ordering::Acquire)
    }

    /// Number of blocks waiting in the inbound queue
    pub fn queued(&self) -> usize {
        self.state.queued.load(Ordering::Acquire)
    }

    /// Stop both loops, close the socket and wake any parked consumer
    pub fn destroy(&self) {
        info!("Destroying pump: {}", self);
        self.state.conn_alive.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
    }
}

impl PumpState {
    fn block_written(&self) {
        let _ = self
            .unsent
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        self.flushed.notify_waiters();
    }

    /// Blocks left in a stopped send loop will never be written
    fn close_send(&self) {
        self.send_open.store(false, Ordering::Release);
        self.flushed.notify_waiters();
    }
}

impl Drop for SocketPump {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

impl fmt::Display for SocketPump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "remote=[{}] local=[{}] alive={} recv_queued={}",
            self.state.peer,
            self.state.local,
            self.is_conn_alive(),
            self.queued()
        )
    }
}

async fn send_loop(
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    filter: Arc<Mutex<Box<dyn DataFilter>>>,
    state: Arc<PumpState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let block = tokio::select! {
            _ = shutdown.changed() => break,
            block = outbound.recv() => match block {
                Some(block) => block,
                None => break,
            },
        };

        let data = match filter.lock().await.on_send(block) {
            Ok(data) => data,
            Err(e) => {
                warn!("Send filter failed, peer={}: {}", state.peer, e);
                break;
            }
        };
        if data.is_empty() {
            state.block_written();
            continue;
        }

        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = writer.write_all(&data) => result,
        };
        match result {
            Ok(()) => {
                debug!("Sent {} bytes to {}", data.len(), state.peer);
                state.block_written();
            }
            Err(e) => {
                warn!("Write to {} failed: {}", state.peer, e);
                break;
            }
        }
    }

    state.conn_alive.store(false, Ordering::Release);
    state.close_send();
    let _ = writer.shutdown().await;
}

async fn recv_loop(
    mut reader: OwnedReadHalf,
    inbound: mpsc::Sender<Packet>,
    filter: Arc<Mutex<Box<dyn DataFilter>>>,
    block_size: usize,
    state: Arc<PumpState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; block_size];

    loop {
        let result = tokio::select! {
            _ = shutdown.changed() => break,
            result = reader.read(&mut buf) => result,
        };

        let n = match result {
            Ok(0) => {
                info!("Connection closed by {}", state.peer);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("Read from {} failed: {}", state.peer, e);
                break;
            }
        };

        let block = match filter
            .lock()
            .await
            .on_receive(Bytes::copy_from_slice(&buf[..n]))
        {
            Ok(block) => block,
            Err(e) => {
                warn!("Receive filter failed, peer={}: {}", state.peer, e);
                break;
            }
        };
        debug!("Received {} bytes from {}", n, state.peer);

        state.queued.fetch_add(1, Ordering::AcqRel);
        let sent = tokio::select! {
            _ = shutdown.changed() => false,
            sent = inbound.send(Packet::Data(block)) => sent.is_ok(),
        };
        if !sent {
            state.queued.fetch_sub(1, Ordering::AcqRel);
            break;
        }
    }

    state.conn_alive.store(false, Ordering::Release);
    let _ = inbound.try_send(Packet::End);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::IdentityFilter;
    use crate::BLOCK_SIZE;
    use tokio::net::TcpListener;

    /// Connected (pump side, peer side) socket pair
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_push_reaches_peer() {
        let (local, mut peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        pump.push(Bytes::from_static(b"hello")).await.unwrap();

        let mut buf = [0u8; 16];
        let n = peer.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_pop_wait_modes() {
        let (local, mut peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        assert_eq!(pump.pop(Wait::Try).await, None);
        assert_eq!(pump.pop(Wait::Timeout(Duration::from_millis(50))).await, None);

        peer.write_all(b"world").await.unwrap();
        let block = pump.pop(Wait::Block).await.unwrap();
        assert_eq!(&block[..], b"world");
        assert!(pump.is_alive());
    }

    #[tokio::test]
    async fn test_large_payload_fidelity() {
        let (local, mut peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        let payload: Vec<u8> = (0..BLOCK_SIZE + 1).map(|i| (i % 251) as u8).collect();
        peer.write_all(&payload).await.unwrap();

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let block = pump.pop(Wait::Block).await.unwrap();
            assert!(block.len() <= BLOCK_SIZE);
            received.extend_from_slice(&block);
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_queued_data_outlives_socket() {
        let (local, mut peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        peer.write_all(b"last words").await.unwrap();
        drop(peer);

        // Wait for the receive loop to observe EOF
        while pump.is_conn_alive() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(pump.is_alive());
        assert_eq!(&pump.pop(Wait::Try).await.unwrap()[..], b"last words");
        assert!(!pump.is_alive());
        assert_eq!(pump.pop(Wait::Block).await, None);
    }

    #[tokio::test]
    async fn test_destroy_unblocks_consumer() {
        let (local, _peer) = socket_pair().await;
        let pump = Arc::new(SocketPump::new(local, Box::new(IdentityFilter)));

        let waiter = {
            let pump = Arc::clone(&pump);
            tokio::spawn(async move { pump.pop(Wait::Block).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        pump.destroy();

        let popped = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("consumer stayed blocked")
            .unwrap();
        assert_eq!(popped, None);
        assert!(!pump.is_alive());
    }

    #[tokio::test]
    async fn test_destroy_closes_socket() {
        let (local, mut peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        pump.destroy();

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(2), peer.read(&mut buf))
            .await
            .expect("peer never saw close")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_flush_waits_for_queued_writes() {
        let (local, mut peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        for _ in 0..10 {
            pump.push(Bytes::from(vec![7u8; 1000])).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(2), pump.flush())
            .await
            .expect("flush never completed");
        pump.destroy();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 10_000);
    }

    #[tokio::test]
    async fn test_flush_returns_once_send_loop_stops() {
        let (local, _peer) = socket_pair().await;
        let pump = SocketPump::new(local, Box::new(IdentityFilter));

        pump.destroy();
        let _ = pump.push(Bytes::from_static(b"late")).await;

        tokio::time::timeout(Duration::from_secs(2), pump.flush())
            .await
            .expect("flush stayed blocked on a stopped pump");
    }
}
