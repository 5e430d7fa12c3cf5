//! Executes a single request/response exchange over a pooled connection.
//!
//! One exchange moves through a fixed sequence of phases:
//!
//! ```text
//! Init -> Acquiring -> Sending -> AwaitingHead -> StreamingBody -> Done
//!            \            \             \               \
//!             `------------`-------------`---------------`--> Failed
//! ```
//!
//! `StreamingBody` and `Done` belong to the returned [`Response`]: the
//! executor hands the connection to the response body, which releases it to
//! the pool once the body has been read.

use std::fmt;

use http::header::{HeaderValue, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Uri, Version};
use hyper::body::Incoming;
use tracing::{debug, trace};

use super::conn::{Connection, SendError};
use super::pool::{self, OriginKey, Pooled, UrlError};
use super::request::{Request, RequestParts};
use super::response::{Response, ResponseBody};
use super::timeout::Budget;
use super::SessionRef;
use crate::{Body, Error, Headers};

/// The phases of a request exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Phase {
    /// Preparing the request.
    Init,

    /// Waiting for a connection from the pool, or connecting a new one.
    Acquiring,

    /// Writing the request head and body.
    Sending,

    /// Waiting for the response head.
    AwaitingHead,

    /// Reading the response body.
    StreamingBody,

    /// The response body was read to the end.
    Done,

    /// The exchange failed.
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "preparing request",
            Phase::Acquiring => "acquiring connection",
            Phase::Sending => "sending request",
            Phase::AwaitingHead => "awaiting response head",
            Phase::StreamingBody => "streaming response body",
            Phase::Done => "done",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why an attempt failed, and whether it may be tried again.
#[derive(Debug)]
enum Retry {
    /// Don't retry.
    No,

    /// A new connection could not be established. The body was never
    /// handed out, and is given back.
    Connect(Body),

    /// A reused connection failed before the response head arrived.
    Stale,
}

#[derive(Debug)]
struct Failure {
    error: Error,
    retry: Retry,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Failure {
            error,
            retry: Retry::No,
        }
    }
}

/// A single exchange, without redirects.
struct Exchange<'a> {
    session: &'a SessionRef,
    budget: &'a Budget,
    key: OriginKey,
    parts: RequestParts,
    method: Method,
    target: Uri,
    headers: HeaderMap,
    phase: Phase,
}

impl fmt::Debug for Exchange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("origin", &self.key)
            .field("method", &self.method)
            .field("phase", &self.phase)
            .finish()
    }
}

/// Execute `request` once, following no redirects.
///
/// Fresh connection failures are retried once for idempotent methods. A
/// reused connection which turns out to be dead before the response head
/// arrives is replaced by a new connection once, when the body can be sent
/// again and either nothing was sent or the method is idempotent. Timeouts
/// and cancellation are never retried.
#[tracing::instrument(
    skip_all,
    fields(method = %request.method, url = %request.url),
    level = "debug"
)]
pub(crate) async fn execute(
    session: &SessionRef,
    request: Request,
    budget: &Budget,
) -> Result<Response, Error> {
    let key = OriginKey::try_from(&request.url)?;
    let parts = request.parts();
    let Request {
        method,
        url,
        mut headers,
        body,
        ..
    } = request;

    headers.merge_defaults(&session.default_headers);
    if !headers.contains(HOST) {
        let host = HeaderValue::try_from(key.authority())
            .map_err(|error| Error::InvalidHeader(error.into()))?;
        headers.append(HOST, host);
    }
    if !session.config.keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    let target = url
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .parse::<Uri>()
        .map_err(UrlError::from)?;

    let mut exchange = Exchange {
        session,
        budget,
        key,
        parts,
        method,
        target,
        headers: headers.to_header_map(),
        phase: Phase::Init,
    };
    exchange.run(body).await
}

impl Exchange<'_> {
    fn enter(&mut self, phase: Phase) {
        trace!(from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }

    /// The request in origin form, as written on the wire.
    fn request(&self, body: Body) -> http::Request<Body> {
        let mut request = http::Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.target.clone();
        *request.version_mut() = Version::HTTP_11;
        *request.headers_mut() = self.headers.clone();
        request
    }

    fn is_retryable_method(&self) -> bool {
        self.session.config.retry_methods.contains(&self.method)
    }

    async fn run(&mut self, body: Body) -> Result<Response, Error> {
        let mut replay = body.try_clone();
        let mut body = body;
        let mut fresh = false;
        let mut retried = false;

        loop {
            let failure = match self.attempt(body, fresh).await {
                Ok(response) => return Ok(response),
                Err(failure) => failure,
            };

            let next = match failure.retry {
                _ if retried => None,
                Retry::Connect(body) if self.is_retryable_method() => {
                    debug!(error = %failure.error, "connect failed, retrying");
                    Some((body, false))
                }
                Retry::Stale => match replay.take() {
                    Some(body) => {
                        debug!(error = %failure.error, "reused connection failed, retrying on a new connection");
                        Some((body, true))
                    }
                    None => None,
                },
                _ => None,
            };

            match next {
                Some((next_body, next_fresh)) => {
                    retried = true;
                    body = next_body;
                    fresh = next_fresh;
                }
                None => {
                    self.enter(Phase::Failed);
                    return Err(failure.error);
                }
            }
        }
    }

    async fn attempt(&mut self, body: Body, fresh: bool) -> Result<Response, Failure> {
        self.enter(Phase::Acquiring);
        let mut connection = match self.acquire(fresh).await {
            Ok(connection) => connection,
            Err(error @ Error::Connect { .. }) => {
                return Err(Failure {
                    error,
                    retry: Retry::Connect(body),
                })
            }
            Err(error) => return Err(error.into()),
        };
        let reused = connection.is_reused();
        trace!(id = %connection.id(), reused, "connection acquired");

        self.enter(Phase::Sending);
        let write_timeout = self.budget.timeouts().write;
        if let Err(error) = self
            .budget
            .run(Phase::Sending, write_timeout, connection.ready())
            .await?
        {
            return Err(self.send_failure(error, reused));
        }

        let mut in_flight = connection.send(self.request(body));
        let early = match self
            .budget
            .run(Phase::Sending, write_timeout, in_flight.written())
            .await?
        {
            Ok(early) => early,
            Err(error) => return Err(self.send_failure(error, reused)),
        };

        self.enter(Phase::AwaitingHead);
        let response = match early {
            Some(response) => {
                trace!("response head arrived before request body was written");
                response
            }
            None => {
                let head_timeout = self.budget.timeouts().head;
                match self
                    .budget
                    .run(Phase::AwaitingHead, head_timeout, in_flight.head())
                    .await?
                {
                    Ok(response) => response,
                    Err(error) => return Err(self.send_failure(error, reused)),
                }
            }
        };

        self.enter(Phase::StreamingBody);
        let (head, incoming) = response.into_parts();
        let reusable = self.session.config.keep_alive && is_reusable(&self.method, &head, &incoming);
        debug!(
            status = %head.status,
            version = ?head.version,
            reusable,
            "response head received"
        );

        let body = ResponseBody::new(
            incoming,
            connection,
            reusable,
            self.budget.clone(),
            self.session.config.max_body_size,
        );
        Ok(Response::new(head, self.parts.clone(), body))
    }

    async fn acquire(&self, fresh: bool) -> Result<Pooled<Connection>, Error> {
        let key = self.key.clone();
        let connector = &self.session.connector;
        let budget = self.budget;
        let connect = || async move {
            let connect_timeout = budget.timeouts().connect;
            match budget
                .run(Phase::Acquiring, connect_timeout, connector.connect(key.clone()))
                .await
            {
                Ok(Ok(connection)) => Ok(connection),
                Ok(Err(source)) => Err(Error::Connect { origin: key, source }),
                Err(error) => Err(error),
            }
        };

        let acquired = self
            .budget
            .run(
                Phase::Acquiring,
                None,
                self.session.pool.acquire(&self.key, fresh, connect),
            )
            .await?;

        acquired.map_err(|error| match error {
            pool::Error::Connecting(error) => error,
            pool::Error::Exhausted => Error::PoolExhausted(self.key.clone()),
            pool::Error::Closed => Error::SessionClosed,
        })
    }

    /// Classify a failure of the exchange itself, after a connection was acquired.
    fn send_failure(&self, error: SendError, reused: bool) -> Failure {
        let sent = error.was_sent();
        let error = Error::from_hyper(error.into_inner());

        let stale = reused
            && matches!(error, Error::ConnectionClosed(_))
            && (!sent || self.is_retryable_method());

        Failure {
            error,
            retry: if stale { Retry::Stale } else { Retry::No },
        }
    }
}

/// Can the connection carry another request after this response?
fn is_reusable(method: &Method, head: &http::response::Parts, incoming: &Incoming) -> bool {
    use http_body::Body as _;

    let headers = Headers::from(&head.headers);
    if headers.has_token(CONNECTION, "close") {
        return false;
    }

    let persistent = if head.version == Version::HTTP_11 {
        true
    } else if head.version == Version::HTTP_10 {
        headers.has_token(CONNECTION, "keep-alive")
    } else {
        false
    };
    if !persistent {
        return false;
    }

    let bodiless = *method == Method::HEAD
        || head.status.is_informational()
        || head.status == StatusCode::NO_CONTENT
        || head.status == StatusCode::NOT_MODIFIED
        || incoming.is_end_stream();

    // Without a length or chunked framing, the body ends when the connection closes.
    bodiless || headers.contains(CONTENT_LENGTH) || headers.has_token(TRANSFER_ENCODING, "chunked")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display() {
        assert_eq!(Phase::Acquiring.to_string(), "acquiring connection");
        assert_eq!(Phase::AwaitingHead.to_string(), "awaiting response head");
        assert_eq!(Phase::StreamingBody.to_string(), "streaming response body");
    }

    #[test]
    fn failure_from_error_is_not_retried() {
        let failure = Failure::from(Error::Cancelled);
        assert!(matches!(failure.retry, Retry::No));
    }
}
