//! Responses and streamed response bodies.

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::{StatusCode, Uri, Version};
use http_body::Body as _;
use http_body_util::BodyExt as _;
use hyper::body::Incoming;
use tracing::{debug, trace};

use super::conn::Connection;
use super::pool::Pooled;
use super::request::RequestParts;
use super::timeout::Budget;
use super::Phase;
use crate::{Error, Headers};

/// An HTTP response.
///
/// The head has been received, the body is read on demand. The connection
/// which carried the response goes back to the pool once the body has been
/// read to the end. Dropping a response (or its body) early closes the
/// connection instead.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: Headers,
    url: Uri,
    request: RequestParts,
    body: ResponseBody,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .finish()
    }
}

impl Response {
    pub(crate) fn new(
        head: http::response::Parts,
        request: RequestParts,
        body: ResponseBody,
    ) -> Self {
        Self {
            status: head.status,
            version: head.version,
            headers: Headers::from(head.headers),
            url: request.url().clone(),
            request,
            body,
        }
    }

    /// The response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The HTTP version of the response.
    pub fn version(&self) -> Version {
        self.version
    }

    /// The response headers, in the order they were received.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The URL which produced this response, after following redirects.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The request which produced this response.
    pub fn request(&self) -> &RequestParts {
        &self.request
    }

    /// The `Content-Length` of the response, if announced.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(http::header::CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .parse()
            .ok()
    }

    /// Fail with [`Error::Status`] for `4xx` and `5xx` statuses.
    ///
    /// The error keeps the status, URL and headers. The body is dropped
    /// (closing its connection) on error.
    pub fn error_for_status(self) -> Result<Self, Error> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::Status {
                status: self.status,
                url: self.url,
                headers: Box::new(self.headers),
            })
        } else {
            Ok(self)
        }
    }

    /// Mutable access to the response body.
    pub fn body_mut(&mut self) -> &mut ResponseBody {
        &mut self.body
    }

    /// Take the response body.
    pub fn into_body(self) -> ResponseBody {
        self.body
    }

    /// Read the next chunk of the body. See [`ResponseBody::chunk`].
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        self.body.chunk().await
    }

    /// Read the whole body. See [`ResponseBody::bytes`].
    pub async fn bytes(self) -> Result<Bytes, Error> {
        self.body.bytes().await
    }

    /// Read the whole body as text.
    ///
    /// Invalid UTF-8 sequences are replaced with `U+FFFD`.
    pub async fn text(self) -> Result<String, Error> {
        let bytes = self.body.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read the whole body and deserialize it as JSON.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(self) -> Result<T, Error> {
        let bytes = self.body.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Abandon the body, closing the connection.
    pub fn discard(self) {
        self.body.discard()
    }
}

enum State {
    Streaming {
        incoming: Incoming,
        connection: Pooled<Connection>,
        reusable: bool,
    },
    Done,
    Failed,
}

/// The body of a [`Response`], read chunk by chunk.
///
/// Each chunk must arrive within the body chunk timeout, and the whole body
/// within the request's total timeout.
pub struct ResponseBody {
    state: State,
    budget: Budget,
    max_size: usize,
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Streaming { .. } => "streaming",
            State::Done => "done",
            State::Failed => "failed",
        };
        f.debug_struct("ResponseBody")
            .field("state", &state)
            .field("max_size", &self.max_size)
            .finish()
    }
}

impl ResponseBody {
    pub(crate) fn new(
        incoming: Incoming,
        connection: Pooled<Connection>,
        reusable: bool,
        budget: Budget,
        max_size: usize,
    ) -> Self {
        let mut body = Self {
            state: State::Streaming {
                incoming,
                connection,
                reusable,
            },
            budget,
            max_size,
        };
        body.finish_if_complete();
        body
    }

    /// Has the body been read to the end?
    pub fn is_complete(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Read the next chunk of the body.
    ///
    /// Returns `Ok(None)` once the body is complete, at which point the
    /// connection has gone back to the pool. Trailers are skipped. After an
    /// error the connection is closed, and further calls return `Ok(None)`.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, Error> {
        loop {
            let State::Streaming { incoming, .. } = &mut self.state else {
                return Ok(None);
            };

            let limit = self.budget.timeouts().body_chunk;
            let frame = match self
                .budget
                .run(Phase::StreamingBody, limit, incoming.frame())
                .await
            {
                Ok(frame) => frame,
                Err(error) => {
                    self.fail(&error);
                    return Err(error);
                }
            };

            match frame {
                None => {
                    self.finish();
                    return Ok(None);
                }
                Some(Err(error)) => {
                    let error = Error::from_hyper(error);
                    self.fail(&error);
                    return Err(error);
                }
                Some(Ok(frame)) => {
                    let Ok(data) = frame.into_data() else {
                        trace!("skipping trailers");
                        continue;
                    };
                    self.finish_if_complete();
                    if data.is_empty() {
                        continue;
                    }
                    return Ok(Some(data));
                }
            }
        }
    }

    /// Read the rest of the body into memory.
    ///
    /// Fails with [`Error::BodyTooLarge`] (closing the connection) once more
    /// than the session's maximum body size has been read.
    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            if buffer.len() + chunk.len() > self.max_size {
                let error = Error::BodyTooLarge {
                    limit: self.max_size,
                };
                self.fail(&error);
                return Err(error);
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// Turn the body into a stream of chunks.
    pub fn into_stream(self) -> impl Stream<Item = Result<Bytes, Error>> + Send + 'static {
        futures_util::stream::unfold(self, |mut body| async move {
            match body.chunk().await {
                Ok(Some(chunk)) => Some((Ok(chunk), body)),
                Ok(None) => None,
                Err(error) => Some((Err(error), body)),
            }
        })
    }

    /// Abandon the body, closing the connection.
    pub fn discard(mut self) {
        if matches!(self.state, State::Streaming { .. }) {
            trace!("response body discarded");
            self.state = State::Failed;
        }
    }

    /// Read and drop up to `limit` bytes of the body, so the connection can be reused.
    ///
    /// The connection is closed if the body is longer than `limit`.
    pub(crate) async fn drain(mut self, limit: usize) {
        let mut read = 0;
        loop {
            match self.chunk().await {
                Ok(Some(chunk)) => {
                    read += chunk.len();
                    if read > limit {
                        trace!(limit, "body too long to drain, closing connection");
                        return;
                    }
                }
                Ok(None) | Err(_) => return,
            }
        }
    }

    fn finish_if_complete(&mut self) {
        if let State::Streaming { incoming, .. } = &self.state {
            if incoming.is_end_stream() {
                self.finish();
            }
        }
    }

    fn finish(&mut self) {
        if let State::Streaming {
            mut connection,
            reusable,
            ..
        } = std::mem::replace(&mut self.state, State::Done)
        {
            connection.finish();
            trace!(
                id = %connection.id(),
                origin = %connection.key(),
                age = ?connection.age(),
                requests = connection.requests(),
                reusable,
                "response complete, releasing connection"
            );
            connection.release(reusable);
        }
    }

    fn fail(&mut self, error: &Error) {
        if let State::Streaming { connection, .. } = std::mem::replace(&mut self.state, State::Failed) {
            debug!(id = %connection.id(), %error, "response body failed, closing connection");
        }
    }
}
