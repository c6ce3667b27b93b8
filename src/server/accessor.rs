//! Per-request accessor
//!
//! Splits one inbound HTTP exchange into the two halves the connection
//! loops work with: a [`RequestAccessor`] that reads the request body and
//! produces the response, and a [`ResponseHandle`] the HTTP handler awaits
//! to obtain the `hyper::Response`.

use crate::tunnel::{Packet, TunnelError};
use crate::{BLOCK_SIZE, QUEUE_DEPTH};
use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt};
use hyper::body::{Body, Frame, SizeHint};
use hyper::{Response, StatusCode, Uri};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Boxed error accepted from request bodies
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

type ChunkSender = mpsc::Sender<Result<Bytes, io::Error>>;
type ChunkReceiver = mpsc::Receiver<Result<Bytes, io::Error>>;

/// Server-side view of one HTTP exchange
pub struct RequestAccessor {
    uri: Uri,
    body: UnsyncBoxBody<Bytes, BoxError>,
    leftover: Bytes,
    body_failed: bool,
    status: Option<oneshot::Sender<StatusCode>>,
    committed: bool,
    chunks: Option<ChunkSender>,
}

/// Handler-side half of a [`RequestAccessor`]
pub struct ResponseHandle {
    status: oneshot::Receiver<StatusCode>,
    chunks: ChunkReceiver,
}

impl RequestAccessor {
    /// Wrap a request body
    pub fn new<B>(uri: Uri, body: B) -> (Self, ResponseHandle)
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let (status_tx, status_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(QUEUE_DEPTH);

        let accessor = Self {
            uri,
            body: body.map_err(Into::<BoxError>::into).boxed_unsync(),
            leftover: Bytes::new(),
            body_failed: false,
            status: Some(status_tx),
            committed: false,
            chunks: Some(chunk_tx),
        };
        let handle = ResponseHandle {
            status: status_rx,
            chunks: chunk_rx,
        };
        (accessor, handle)
    }

    /// Request URI
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Next chunk of the request body, at most [`BLOCK_SIZE`] bytes
    ///
    /// Returns `None` at end of body or when the body failed to read.
    pub async fn pop_data(&mut self) -> Option<Bytes> {
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(BLOCK_SIZE);
                return Some(self.leftover.split_to(n));
            }

            match self.body.frame().await {
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        self.leftover = data;
                    }
                }
                Some(Err(e)) => {
                    warn!("Reading body of {} failed: {}", self.uri, e);
                    self.body_failed = true;
                    return None;
                }
                None => return None,
            }
        }
    }

    /// True if the request body ended with an error
    pub fn body_failed(&self) -> bool {
        self.body_failed
    }

    /// Commit a 200 response; chunks pushed afterwards stream as its body
    pub fn start_response(&mut self) {
        if let Some(status) = self.status.take() {
            let _ = status.send(StatusCode::OK);
            self.committed = true;
        }
    }

    /// Stream one packet into the response body
    pub async fn push_data(&mut self, packet: Packet) -> Result<(), TunnelError> {
        match packet {
            Packet::Data(data) => {
                let chunks = self.chunks.as_ref().ok_or(TunnelError::Closed)?;
                debug!("Response chunk of {} bytes for {}", data.len(), self.uri);
                chunks.send(Ok(data)).await.map_err(|_| TunnelError::Closed)
            }
            Packet::End => {
                self.chunks = None;
                Ok(())
            }
        }
    }

    /// Fail the exchange
    ///
    /// Answers 502 when no status was committed yet, otherwise aborts the
    /// response body so the peer sees a broken exchange instead of a short one.
    pub fn set_error_happened(&mut self) {
        if let Some(status) = self.status.take() {
            let _ = status.send(StatusCode::BAD_GATEWAY);
        }
        if let Some(chunks) = self.chunks.take() {
            if self.committed {
                let _ = chunks.try_send(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "destination leg failed",
                )));
            }
        }
    }
}

impl Drop for RequestAccessor {
    fn drop(&mut self) {
        if self.status.is_some() || self.chunks.is_some() {
            self.set_error_happened();
        }
    }
}

impl ResponseHandle {
    /// Wait for the committed status and build the response
    pub async fn into_response(self) -> Response<TunnelBody> {
        let status = self.status.await.unwrap_or(StatusCode::BAD_GATEWAY);
        let body = if status == StatusCode::OK {
            TunnelBody::streaming(self.chunks)
        } else {
            TunnelBody::empty()
        };

        let mut response = Response::new(body);
        *response.status_mut() = status;
        response
    }
}

/// Response body fed chunk by chunk from a [`RequestAccessor`]
pub struct TunnelBody {
    chunks: Option<ChunkReceiver>,
}

impl TunnelBody {
    /// Body with no content
    pub fn empty() -> Self {
        Self { chunks: None }
    }

    fn streaming(chunks: ChunkReceiver) -> Self {
        Self {
            chunks: Some(chunks),
        }
    }
}

impl Body for TunnelBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        let Some(chunks) = self.chunks.as_mut() else {
            return Poll::Ready(None);
        };

        match chunks.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => Poll::Ready(Some(chunk.map(Frame::data))),
            Poll::Ready(None) => {
                self.chunks = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.chunks.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        match self.chunks {
            Some(_) => SizeHint::default(),
            None => SizeHint::with_exact(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::Full;

    fn accessor_for(payload: Vec<u8>) -> (RequestAccessor, ResponseHandle) {
        RequestAccessor::new("/d?c=1&s=1".parse().unwrap(), Full::new(Bytes::from(payload)))
    }

    #[tokio::test]
    async fn test_full_block_is_one_chunk() {
        let payload = vec![0x5Au8; BLOCK_SIZE];
        let (mut accessor, _handle) = accessor_for(payload.clone());

        let chunk = accessor.pop_data().await.unwrap();
        assert_eq!(chunk.len(), BLOCK_SIZE);
        assert_eq!(&chunk[..], &payload[..]);
        assert!(accessor.pop_data().await.is_none());
        assert!(!accessor.body_failed());
    }

    #[tokio::test]
    async fn test_oversized_body_is_split() {
        let payload: Vec<u8> = (0..BLOCK_SIZE + 1).map(|i| (i % 13) as u8).collect();
        let (mut accessor, _handle) = accessor_for(payload.clone());

        let mut chunks = Vec::new();
        while let Some(chunk) = accessor.pop_data().await {
            assert!(chunk.len() <= BLOCK_SIZE);
            chunks.push(chunk);
        }

        assert!(chunks.len() >= 2);
        assert_eq!(chunks.concat(), payload);
    }

    #[tokio::test]
    async fn test_streamed_response() {
        let (mut accessor, handle) = accessor_for(Vec::new());

        accessor.start_response();
        accessor.push_data(Packet::Data(Bytes::from_static(b"one "))).await.unwrap();
        accessor.push_data(Packet::Data(Bytes::from_static(b"two"))).await.unwrap();
        accessor.push_data(Packet::End).await.unwrap();

        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"one two");
    }

    #[tokio::test]
    async fn test_error_before_start_is_bad_gateway() {
        let (mut accessor, handle) = accessor_for(Vec::new());
        accessor.set_error_happened();

        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_dropped_accessor_is_bad_gateway() {
        let (accessor, handle) = accessor_for(Vec::new());
        drop(accessor);

        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_error_after_start_aborts_body() {
        let (mut accessor, handle) = accessor_for(Vec::new());

        accessor.start_response();
        accessor.push_data(Packet::Data(Bytes::from_static(b"partial"))).await.unwrap();
        accessor.set_error_happened();

        let response = handle.into_response().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.into_body().collect().await.is_err());
    }
}
