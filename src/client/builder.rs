use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt as _;
use http::header::{HeaderName, HeaderValue, USER_AGENT};
use http::Method;
#[cfg(feature = "tls")]
use rustls::ClientConfig;
use tracing::warn;

use super::conn::dns::{GaiResolver, Resolve};
use super::conn::transport::{BoxIo, TcpTransport, TcpTransportConfig};
#[cfg(feature = "tls")]
use super::conn::transport::{tls::default_tls_config, TlsTransport};
use super::conn::{ConnectError, Connector, Transport};
use super::pool::{OriginKey, Pool, Scheme};
use super::{PoolConfig, RedirectConfig, Session, SessionConfig, SessionRef, Timeouts};
use crate::{BoxFuture, Headers};

/// Response bodies larger than this are rejected by [`crate::ResponseBody::bytes`].
const DEFAULT_MAX_BODY_SIZE: usize = 2 * 1024 * 1024;

#[cfg(feature = "tls")]
#[derive(Debug)]
enum Tls {
    Native,
    Config(Arc<ClientConfig>),
    Disabled,
}

/// A builder for a [`Session`].
#[derive(Debug)]
pub struct Builder {
    transport: Option<Arc<dyn Transport>>,
    resolver: Option<Arc<dyn Resolve>>,
    tcp: TcpTransportConfig,
    #[cfg(feature = "tls")]
    tls: Tls,
    http1: hyper::client::conn::http1::Builder,
    pool: PoolConfig,
    timeouts: Timeouts,
    redirect: RedirectConfig,
    retry_methods: Vec<Method>,
    keep_alive: bool,
    max_body_size: usize,
    default_headers: Headers,
    user_agent: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    /// Create a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            transport: None,
            resolver: None,
            tcp: TcpTransportConfig::default(),
            #[cfg(feature = "tls")]
            tls: Tls::Native,
            http1: hyper::client::conn::http1::Builder::new(),
            pool: PoolConfig::default(),
            timeouts: Timeouts::default(),
            redirect: RedirectConfig::default(),
            retry_methods: vec![Method::GET, Method::HEAD, Method::OPTIONS],
            keep_alive: true,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            default_headers: Headers::new(),
            user_agent: None,
        }
    }
}

impl Builder {
    /// Use the provided TCP configuration.
    pub fn with_tcp(mut self, config: TcpTransportConfig) -> Self {
        self.tcp = config;
        self
    }

    /// TCP configuration.
    pub fn tcp(&mut self) -> &mut TcpTransportConfig {
        &mut self.tcp
    }

    /// Resolve host names with `resolver` instead of the system resolver.
    pub fn with_resolver<R: Resolve>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    /// Provide a custom transport.
    ///
    /// The transport is used as-is for every origin: TCP, resolver and TLS
    /// settings of this builder no longer apply.
    pub fn with_transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }
}

#[cfg(feature = "tls")]
impl Builder {
    /// Disable TLS. Requests to `https` origins fail to connect.
    pub fn without_tls(mut self) -> Self {
        self.tls = Tls::Disabled;
        self
    }

    /// Use the provided TLS configuration.
    pub fn with_tls(mut self, config: ClientConfig) -> Self {
        self.tls = Tls::Config(Arc::new(config));
        self
    }

    /// Use the default TLS configuration with native root certificates.
    pub fn with_default_tls(mut self) -> Self {
        self.tls = Tls::Native;
        self
    }
}

#[cfg(not(feature = "tls"))]
impl Builder {
    /// Disable TLS
    pub fn without_tls(self) -> Self {
        self
    }
}

impl Builder {
    /// Connection pool configuration.
    pub fn pool(&mut self) -> &mut PoolConfig {
        &mut self.pool
    }

    /// Use the provided connection pool configuration.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Limit the number of connections (idle and active) to a single origin.
    pub fn with_max_connections_per_origin(mut self, max: usize) -> Self {
        self.pool.max_connections_per_origin = max;
        self
    }

    /// Close connections which have been idle in the pool for longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool.idle_timeout = Some(timeout);
        self
    }

    /// Fail with [`crate::Error::PoolExhausted`] after waiting `timeout` for a connection.
    pub fn with_pool_wait_timeout(mut self, timeout: Duration) -> Self {
        self.pool.wait_timeout = Some(timeout);
        self
    }

    /// Evict expired idle connections in the background every `interval`.
    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.pool.reap_interval = Some(interval);
        self
    }

    /// HTTP/1.1 connection configuration.
    pub fn http1(&mut self) -> &mut hyper::client::conn::http1::Builder {
        &mut self.http1
    }
}

impl Builder {
    /// Set the total timeout for requests.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.total = Some(timeout);
        self
    }

    /// Disable the total request timeout. Phase timeouts still apply.
    pub fn without_timeout(mut self) -> Self {
        self.timeouts.total = None;
        self
    }

    /// Use the provided timeouts.
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Request timeouts.
    pub fn timeouts(&mut self) -> &mut Timeouts {
        &mut self.timeouts
    }
}

impl Builder {
    /// Follow at most `max` redirects per request.
    pub fn with_max_redirects(mut self, max: usize) -> Self {
        self.redirect.max_redirects = max;
        self
    }

    /// Don't follow redirects unless a request asks to.
    pub fn without_redirects(mut self) -> Self {
        self.redirect.follow = false;
        self
    }

    /// Redirect configuration.
    pub fn redirect(&mut self) -> &mut RedirectConfig {
        &mut self.redirect
    }
}

impl Builder {
    /// Methods which are retried once when connecting fails, or when a reused
    /// connection fails after the request was sent.
    ///
    /// Defaults to `GET`, `HEAD` and `OPTIONS`.
    pub fn with_retry_methods<I>(mut self, methods: I) -> Self
    where
        I: IntoIterator<Item = Method>,
    {
        self.retry_methods = methods.into_iter().collect();
        self
    }

    /// Send `Connection: close` and never reuse connections.
    pub fn without_keep_alive(mut self) -> Self {
        self.keep_alive = false;
        self
    }

    /// Limit the size of bodies read into memory with
    /// [`crate::Response::bytes`], [`crate::Response::text`] and friends.
    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    /// Add a header sent with every request, unless the request sets it.
    pub fn with_default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Set the User-Agent header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Get the user agent currently configured
    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }
}

impl Builder {
    fn build_transport(&mut self) -> Arc<dyn Transport> {
        if let Some(transport) = self.transport.take() {
            return transport;
        }

        let resolver = self
            .resolver
            .take()
            .unwrap_or_else(|| Arc::new(GaiResolver::new()) as Arc<dyn Resolve>);
        let tcp = TcpTransport::new(resolver).with_config(self.tcp.clone());

        #[cfg(feature = "tls")]
        match std::mem::replace(&mut self.tls, Tls::Disabled) {
            Tls::Native => return Arc::new(TlsTransport::new(tcp, Arc::new(default_tls_config()))),
            Tls::Config(config) => return Arc::new(TlsTransport::new(tcp, config)),
            Tls::Disabled => {}
        }

        Arc::new(PlainTransport(tcp))
    }

    /// Build the session.
    ///
    /// The pool's background reaper (if configured) is spawned on the current
    /// tokio runtime, when there is one.
    pub fn build(mut self) -> Session {
        let transport = self.build_transport();

        let user_agent = match self.user_agent.take().map(HeaderValue::try_from) {
            Some(Ok(value)) => value,
            Some(Err(error)) => {
                warn!(%error, "invalid user agent, using the default");
                default_user_agent()
            }
            None => default_user_agent(),
        };
        if !self.default_headers.contains(USER_AGENT) {
            self.default_headers.insert(USER_AGENT, user_agent);
        }

        let pool = Pool::new(self.pool);
        let connector = Connector::new(transport, self.http1, pool.shutdown_token());

        Session {
            inner: Arc::new(SessionRef {
                pool,
                connector,
                default_headers: self.default_headers,
                config: SessionConfig {
                    timeouts: self.timeouts,
                    redirect: self.redirect,
                    retry_methods: self.retry_methods,
                    keep_alive: self.keep_alive,
                    max_body_size: self.max_body_size,
                },
                closed: AtomicBool::new(false),
            }),
        }
    }
}

fn default_user_agent() -> HeaderValue {
    HeaderValue::from_static(concat!("courier/", env!("CARGO_PKG_VERSION")))
}

/// TCP without TLS, refusing `https` origins.
struct PlainTransport(TcpTransport);

impl fmt::Debug for PlainTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PlainTransport").field(&self.0).finish()
    }
}

impl Transport for PlainTransport {
    fn connect(&self, origin: &OriginKey) -> BoxFuture<'static, Result<BoxIo, ConnectError>> {
        if origin.scheme() == Scheme::Https {
            return std::future::ready(Err(ConnectError::UnsupportedScheme(Scheme::Https))).boxed();
        }
        self.0.connect(origin)
    }
}
