//! HTTP/1.1 client sessions.
//!
//! There are three levels of available APIs in this module:
//!
//! 1. The [`Session`] API, which keeps a pool of persistent connections,
//!    follows redirects and enforces timeouts. Requests are built with a
//!    [`RequestBuilder`], or created directly as a [`Request`].
//! 2. The session is also a `tower::Service<Request>`, so it can be wrapped
//!    by middleware compatible with the tower ecosystem.
//! 3. The [connection][self::conn] API, which provides transports and name
//!    resolution. Custom transports (for example in-memory streams for tests)
//!    are plugged in with [`Builder::with_transport`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::FutureExt as _;
use http::Method;
use tracing::debug;

use self::conn::{Connection, Connector};
use self::pool::Pool;
use crate::{BoxFuture, Error, Headers};

mod builder;
pub mod conn;
mod executor;
pub mod pool;
mod redirect;
mod request;
mod response;
mod timeout;

pub use self::builder::Builder;
pub use self::executor::Phase;
pub use self::pool::{Config as PoolConfig, OriginKey, PoolStats, Scheme, UrlError};
pub use self::redirect::RedirectConfig;
pub use self::request::{IntoUrl, Request, RequestBuilder, RequestParts};
pub use self::response::{Response, ResponseBody};
pub use self::timeout::Timeouts;

/// Request handling settings shared by every request of a session.
#[derive(Debug, Clone)]
pub(crate) struct SessionConfig {
    pub(crate) timeouts: Timeouts,
    pub(crate) redirect: RedirectConfig,
    pub(crate) retry_methods: Vec<Method>,
    pub(crate) keep_alive: bool,
    pub(crate) max_body_size: usize,
}

pub(crate) struct SessionRef {
    pub(crate) pool: Pool<Connection>,
    pub(crate) connector: Connector,
    pub(crate) default_headers: Headers,
    pub(crate) config: SessionConfig,
    pub(crate) closed: AtomicBool,
}

impl fmt::Debug for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRef")
            .field("pool", &self.pool)
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish()
    }
}

/// A pooled HTTP/1.1 client.
///
/// Sessions are cheap to clone: clones share the same connection pool and
/// configuration. Connections are kept open between requests to the same
/// origin (scheme, host and port) until they expire, the server closes them,
/// or the session is closed.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionRef>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Builder::default().build()
    }
}

impl Session {
    /// Create a session with the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new session builder.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Start building a request.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        RequestBuilder::new(self.clone(), method, url)
    }

    /// Start building a `GET` request.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Start building a `HEAD` request.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a `POST` request.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Start building a `PUT` request.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Start building a `PATCH` request.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Start building a `DELETE` request.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Start building an `OPTIONS` request.
    pub fn options<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::OPTIONS, url)
    }

    /// Start building a `TRACE` request.
    pub fn trace<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::TRACE, url)
    }

    /// Send a request, following redirects.
    ///
    /// Resolves once the response head has been received. The body is read
    /// from the returned [`Response`].
    pub async fn execute(&self, request: Request) -> Result<Response, Error> {
        if self.is_closed() {
            return Err(Error::SessionClosed);
        }
        redirect::send(&self.inner, request).await
    }

    /// Close the session.
    ///
    /// Idle connections are closed right away, requests waiting for a
    /// connection fail, and connections still in use are closed when their
    /// response completes. New requests fail with [`Error::SessionClosed`].
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!("closing session");
            self.inner.pool.drain();
        }
    }

    /// Has [`Session::close`] been called?
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Close idle connections which have outlived the idle timeout.
    ///
    /// This happens on every checkout anyway, and periodically when the
    /// session was built with [`Builder::with_reap_interval`].
    pub fn evict_expired(&self) {
        self.inner.pool.evict_expired();
    }

    /// Connection counts for `origin`.
    pub fn pool_stats(&self, origin: &OriginKey) -> PoolStats {
        self.inner.pool.stats(origin)
    }

    /// The connection pool configuration of this session.
    pub fn pool_config(&self) -> PoolConfig {
        self.inner.pool.config()
    }
}

impl tower::Service<Request> for Session {
    type Response = Response;
    type Error = Error;
    type Future = BoxFuture<'static, Result<Response, Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        if self.is_closed() {
            Poll::Ready(Err(Error::SessionClosed))
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let session = self.clone();
        async move { session.execute(request).await }.boxed()
    }
}
