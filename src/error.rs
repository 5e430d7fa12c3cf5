use http::StatusCode;
use thiserror::Error;

use crate::client::conn::ConnectError;
use crate::client::pool::OriginKey;
use crate::client::{Phase, UrlError};
use crate::{BoxError, Headers};

/// Client error type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Resolving, connecting or handshaking with the origin failed.
    #[error("connecting to {origin}")]
    Connect {
        /// The origin which could not be reached.
        origin: OriginKey,

        /// The underlying failure.
        #[source]
        source: ConnectError,
    },

    /// The server sent a malformed response.
    #[error("protocol: {0}")]
    Protocol(#[source] BoxError),

    /// The connection was closed before the exchange completed.
    #[error("connection closed")]
    ConnectionClosed(#[source] Option<BoxError>),

    /// A phase deadline elapsed.
    #[error("{0} timed out")]
    Timeout(Phase),

    /// No connection slot became available within the pool's wait bound.
    #[error("no connection available to {0}")]
    PoolExhausted(OriginKey),

    /// The redirect chain exceeded the configured limit.
    #[error("too many redirects (limit {limit}), last location {location}")]
    TooManyRedirects {
        /// The configured redirect limit.
        limit: usize,

        /// The location the last redirect pointed at.
        location: http::Uri,
    },

    /// A redirect which keeps the method (`307`, `308`, or `301`/`302` for
    /// methods other than `POST`) requires sending a streaming body again,
    /// but the body can't be restarted.
    #[error("streaming body can't be sent again for {status} redirect")]
    NonRestartableRedirectBody {
        /// The redirect status which required the body.
        status: StatusCode,
    },

    /// The request was cancelled.
    #[error("request cancelled")]
    Cancelled,

    /// The session was closed before the request was made.
    #[error("session closed")]
    SessionClosed,

    /// The request URL can't be used.
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    /// A header name or value given to a request builder is invalid.
    #[error("invalid header")]
    InvalidHeader(#[source] http::Error),

    /// The request body stream failed.
    #[error("request body: {0}")]
    RequestBody(#[source] BoxError),

    /// The response body exceeded the configured limit.
    #[error("response body exceeds {limit} bytes")]
    BodyTooLarge {
        /// The configured limit, in bytes.
        limit: usize,
    },

    /// The response carried an error status.
    #[error("HTTP status {status} from {url}")]
    Status {
        /// The response status.
        status: StatusCode,

        /// The URL which produced the response, after redirects.
        url: http::Uri,

        /// The response headers.
        headers: Box<Headers>,
    },

    /// Encoding a form body or query string failed.
    #[error("url encoding: {0}")]
    UrlEncode(#[from] serde_urlencoded::ser::Error),

    /// JSON encoding or decoding failed.
    #[cfg(feature = "json")]
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Is this error a timeout?
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }

    /// Is this error a connection failure (before any byte was sent)?
    pub fn is_connect(&self) -> bool {
        matches!(self, Error::Connect { .. })
    }

    /// The error status, if the response carried one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// The phase that timed out, if this is a timeout.
    pub fn timeout_phase(&self) -> Option<Phase> {
        match self {
            Error::Timeout(phase) => Some(*phase),
            _ => None,
        }
    }

    /// Map a hyper error raised while exchanging a message.
    pub(crate) fn from_hyper(error: hyper::Error) -> Self {
        if error.is_parse() || error.is_parse_status() {
            Error::Protocol(error.into())
        } else if error.is_body_write_aborted() || error.is_user() {
            Error::RequestBody(error.into())
        } else if error.is_timeout() {
            Error::Timeout(Phase::AwaitingHead)
        } else {
            Error::ConnectionClosed(Some(error.into()))
        }
    }
}
