//! Request bodies.
//!
//! A [`Body`] is one of three shapes: empty, a fixed buffer of bytes, or a
//! stream of byte chunks produced on demand. Fixed bodies can always be sent
//! again (for example when a `307` redirect asks for the same request at a new
//! location). Streaming bodies can only be sent again when they were built with
//! [`Body::restartable`], which provides a factory for a fresh stream.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt as _, TryStreamExt as _};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::Full;

use crate::BoxError;

type ChunkStream = BoxStream<'static, Result<Bytes, BoxError>>;
type Restart = Arc<dyn Fn() -> ChunkStream + Send + Sync + 'static>;

/// The body of an outgoing request.
///
/// Bodies can be created from [`Bytes`], [`String`], [`Vec<u8>`] or
/// `&'static str` using [`From`] implementations.
///
/// Fixed-length bodies are sent with a `Content-Length` header, streaming
/// bodies are sent with chunked transfer encoding.
#[pin_project::pin_project]
pub struct Body {
    #[pin]
    inner: InnerBody,
    restart: Option<Restart>,
}

#[pin_project::pin_project(project = InnerBodyProj)]
enum InnerBody {
    Empty,
    Full(#[pin] Full<Bytes>),
    Stream(ChunkStream),
}

impl Body {
    /// Create a new empty body.
    pub fn empty() -> Self {
        Self {
            inner: InnerBody::Empty,
            restart: None,
        }
    }

    /// Create a new body from something which can be converted into [`Bytes`].
    pub fn full<D>(data: D) -> Self
    where
        D: Into<Bytes>,
    {
        let data = data.into();
        if data.is_empty() {
            return Self::empty();
        }

        Self {
            inner: InnerBody::Full(Full::new(data)),
            restart: None,
        }
    }

    /// Create a streaming body which can only be sent once.
    ///
    /// A redirect which requires the body to be sent again (`307` or `308`)
    /// will fail with [`Error::NonRestartableRedirectBody`](crate::Error::NonRestartableRedirectBody).
    pub fn stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self {
            inner: InnerBody::Stream(stream.map_err(Into::into).boxed()),
            restart: None,
        }
    }

    /// Create a streaming body from a factory which produces a fresh stream
    /// each time the body must be sent.
    pub fn restartable<F, S, E>(factory: F) -> Self
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let restart: Restart = Arc::new(move || factory().map_err(Into::into).boxed());
        Self {
            inner: InnerBody::Stream(restart()),
            restart: Some(restart),
        }
    }

    /// Is this body produced by a stream of unknown length?
    pub fn is_streaming(&self) -> bool {
        matches!(self.inner, InnerBody::Stream(_))
    }

    /// Can this body be sent again from the start?
    pub fn is_restartable(&self) -> bool {
        match self.inner {
            InnerBody::Empty | InnerBody::Full(_) => true,
            InnerBody::Stream(_) => self.restart.is_some(),
        }
    }

    /// Try to clone this body, rewinding restartable streams.
    ///
    /// Returns `None` for streams which can't be restarted.
    pub fn try_clone(&self) -> Option<Self> {
        match &self.inner {
            InnerBody::Empty => Some(Self::empty()),
            InnerBody::Full(body) => Some(Self {
                inner: InnerBody::Full(body.clone()),
                restart: None,
            }),
            InnerBody::Stream(_) => self.restart.as_ref().map(|restart| Self {
                inner: InnerBody::Stream(restart()),
                restart: Some(restart.clone()),
            }),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(body: Bytes) -> Self {
        Self::full(body)
    }
}

impl From<String> for Body {
    fn from(body: String) -> Self {
        Self::full(body)
    }
}

impl From<&'static str> for Body {
    fn from(body: &'static str) -> Self {
        Self::full(body)
    }
}

impl From<Vec<u8>> for Body {
    fn from(body: Vec<u8>) -> Self {
        Self::full(body)
    }
}

impl HttpBody for Body {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match this.inner.project() {
            InnerBodyProj::Empty => Poll::Ready(None),
            InnerBodyProj::Full(body) => body
                .poll_frame(cx)
                .map(|opt| opt.map(|res| res.map_err(|never| match never {}))),
            InnerBodyProj::Stream(stream) => stream
                .poll_next_unpin(cx)
                .map(|opt| opt.map(|res| res.map(Frame::data))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            InnerBody::Empty => true,
            InnerBody::Full(body) => body.is_end_stream(),
            InnerBody::Stream(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            InnerBody::Empty => SizeHint::with_exact(0),
            InnerBody::Full(body) => body.size_hint(),
            InnerBody::Stream(_) => SizeHint::default(),
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            InnerBody::Empty => f.debug_struct("Empty").finish(),
            InnerBody::Full(body) => f
                .debug_struct("Full")
                .field("len", &body.size_hint().exact())
                .finish(),
            InnerBody::Stream(_) => f
                .debug_struct("Stream")
                .field("restartable", &self.restart.is_some())
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    use http_body_util::BodyExt as _;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Body: HttpBody, Send);

    fn chunks() -> impl Stream<Item = Result<Bytes, std::io::Error>> {
        futures_util::stream::iter(vec![Ok(Bytes::from("hello ")), Ok(Bytes::from("world"))])
    }

    #[test]
    fn check_body_from_string() {
        let body = Body::from("Hello, World!".to_string());
        assert_eq!(body.size_hint().exact(), Some(13));
        assert!(!body.is_end_stream());
        assert!(body.is_restartable());
    }

    #[test]
    fn check_body_from_empty_string() {
        let body = Body::from("".to_string());
        assert_eq!(body.size_hint().exact(), Some(0));
        assert!(body.is_end_stream());
    }

    #[test]
    fn check_body_stream_has_unknown_length() {
        let body = Body::stream(chunks());
        assert_eq!(body.size_hint().exact(), None);
        assert!(body.is_streaming());
        assert!(!body.is_restartable());
        assert!(body.try_clone().is_none());
    }

    #[tokio::test]
    async fn restartable_stream_replays_from_start() {
        let body = Body::restartable(chunks);
        assert!(body.is_restartable());

        let copy = body.try_clone().expect("restartable");
        let first = body.collect().await.unwrap().to_bytes();
        let second = copy.collect().await.unwrap().to_bytes();

        assert_eq!(first, Bytes::from("hello world"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn full_body_clones() {
        let body = Body::from(Bytes::from_static(b"payload"));
        let copy = body.try_clone().unwrap();
        assert_eq!(copy.collect().await.unwrap().to_bytes(), "payload");
    }
}
