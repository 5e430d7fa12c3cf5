//! A single HTTP/1.1 connection to an origin.
//!
//! The connection wraps hyper's `SendRequest` handle and the task which drives
//! the underlying byte stream. It has exactly one owner at a time: the pool
//! while idle, or a single request while active.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::FutureExt as _;
use http_body::{Body as HttpBody, Frame, SizeHint};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

use crate::client::pool::{OriginKey, PoolableConnection};
use crate::{Body, BoxError, BoxFuture};

/// Process-unique identifier of a connection, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Idle,
    Active,
    Closed,
}

/// Sending a request over a connection failed.
#[derive(Debug)]
pub(crate) enum SendError {
    /// The request was never handed to the connection.
    NotSent(hyper::Error),

    /// The request was dispatched, the exchange failed part way.
    Failed(hyper::Error),
}

impl SendError {
    pub(crate) fn was_sent(&self) -> bool {
        matches!(self, SendError::Failed(_))
    }

    pub(crate) fn into_inner(self) -> hyper::Error {
        match self {
            SendError::NotSent(error) | SendError::Failed(error) => error,
        }
    }
}

impl From<hyper::client::conn::TrySendError<http::Request<SendBody>>> for SendError {
    fn from(mut error: hyper::client::conn::TrySendError<http::Request<SendBody>>) -> Self {
        if error.take_message().is_some() {
            SendError::NotSent(error.into_error())
        } else {
            SendError::Failed(error.into_error())
        }
    }
}

pub(crate) struct Connection {
    id: ConnectionId,
    key: OriginKey,
    sender: SendRequest<SendBody>,
    driver: JoinHandle<()>,
    state: State,
    created_at: Instant,
    requests: usize,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state)
            .field("requests", &self.requests)
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        key: OriginKey,
        sender: SendRequest<SendBody>,
        driver: JoinHandle<()>,
    ) -> Self {
        Self {
            id,
            key,
            sender,
            driver,
            state: State::Idle,
            created_at: Instant::now(),
            requests: 0,
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn key(&self) -> &OriginKey {
        &self.key
    }

    /// How long this connection has existed.
    pub(crate) fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Number of requests sent on this connection.
    pub(crate) fn requests(&self) -> usize {
        self.requests
    }

    /// Wait until the connection can accept a request.
    pub(crate) async fn ready(&mut self) -> Result<(), SendError> {
        self.sender.ready().await.map_err(SendError::NotSent)
    }

    /// Dispatch a request.
    ///
    /// The request head and body are written by the connection task. The returned
    /// [`InFlight`] tracks when the body has been written and when the response
    /// head arrives.
    pub(crate) fn send(&mut self, request: http::Request<Body>) -> InFlight {
        self.state = State::Active;
        self.requests += 1;

        let (request, written) = SendBody::wrap(request);
        trace!(id = %self.id, requests = self.requests, "dispatching request");
        let response = self
            .sender
            .try_send_request(request)
            .map(|result| result.map_err(SendError::from))
            .boxed();

        InFlight {
            response,
            written: Some(written),
        }
    }

    /// Mark this connection as idle, after its response was fully read.
    pub(crate) fn finish(&mut self) {
        if self.state == State::Active {
            self.state = State::Idle;
        }
    }
}

impl PoolableConnection for Connection {
    fn is_open(&self) -> bool {
        self.state != State::Closed && !self.sender.is_closed() && !self.driver.is_finished()
    }

    fn close(&mut self) {
        if self.state != State::Closed {
            trace!(id = %self.id, requests = self.requests, "closing connection");
            self.state = State::Closed;
            self.driver.abort();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// A request dispatched on a connection.
pub(crate) struct InFlight {
    response: BoxFuture<'static, Result<http::Response<Incoming>, SendError>>,
    written: Option<oneshot::Receiver<()>>,
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("written", &self.written.is_none())
            .finish()
    }
}

enum Written {
    Body,
    Head(Result<http::Response<Incoming>, SendError>),
}

impl InFlight {
    /// Wait until the request body has been written.
    ///
    /// Servers may answer before reading the whole request. When the response
    /// head arrives first, it is returned here.
    pub(crate) async fn written(
        &mut self,
    ) -> Result<Option<http::Response<Incoming>>, SendError> {
        let Some(written) = self.written.as_mut() else {
            return Ok(None);
        };

        let outcome = tokio::select! {
            biased;
            result = &mut self.response => Written::Head(result),
            _ = written => Written::Body,
        };
        self.written = None;

        match outcome {
            Written::Body => Ok(None),
            Written::Head(result) => result.map(Some),
        }
    }

    /// Wait for the response head.
    pub(crate) async fn head(self) -> Result<http::Response<Incoming>, SendError> {
        self.response.await
    }
}

/// Request body which signals once it has been fully written, or abandoned.
#[pin_project::pin_project(PinnedDrop)]
pub(crate) struct SendBody {
    #[pin]
    inner: Body,
    written: Option<oneshot::Sender<()>>,
}

impl SendBody {
    fn wrap(request: http::Request<Body>) -> (http::Request<SendBody>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let request = request.map(|inner| SendBody {
            inner,
            written: Some(tx),
        });
        (request, rx)
    }
}

impl fmt::Debug for SendBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SendBody").field(&self.inner).finish()
    }
}

impl HttpBody for SendBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        let frame = ready!(this.inner.poll_frame(cx));
        if frame.is_none() {
            if let Some(tx) = this.written.take() {
                let _ = tx.send(());
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[pin_project::pinned_drop]
impl PinnedDrop for SendBody {
    fn drop(self: Pin<&mut Self>) {
        if let Some(tx) = self.project().written.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use http_body_util::BodyExt as _;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Connection: Send);
    assert_impl_all!(InFlight: Send);
    assert_impl_all!(SendBody: Send);

    #[test]
    fn connection_ids_are_unique() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        assert_ne!(first, second);
        assert!(first.to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn send_body_signals_when_finished() {
        let request = http::Request::new(Body::from("hello"));
        let (request, mut written) = SendBody::wrap(request);
        assert!(written.try_recv().is_err());

        let body = request.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        assert_eq!(bytes, "hello");
        written.await.unwrap();
    }

    #[tokio::test]
    async fn send_body_signals_when_dropped() {
        let request = http::Request::new(Body::from("hello"));
        let (request, written) = SendBody::wrap(request);
        drop(request);
        assert!(written.await.is_ok());
    }
}
