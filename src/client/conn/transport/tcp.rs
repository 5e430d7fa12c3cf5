//! TCP transport implementation for client connections.
//!
//! This module contains the [`TcpTransport`] type, which connects to origins
//! using TCP. It also contains the [`TcpTransportConfig`] type, which is used to
//! configure TCP connections.
//!
//! Normally, you will not need to use this module directly: a
//! [`Session`][crate::Session] uses the [`TcpTransport`] by default.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt as _;
use parking_lot::Mutex;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{trace, warn, Instrument as _};

use super::{BoxIo, ConnectError, Transport};
use crate::client::conn::dns::{GaiResolver, Resolve, SocketAddrs};
use crate::client::pool::OriginKey;
use crate::happy_eyeballs::{EyeballSet, HappyEyeballsError};
use crate::BoxFuture;

/// Origins whose last good address is remembered, at most.
const MAX_REMEMBERED_ORIGINS: usize = 1024;

/// Configuration for TCP connections.
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// The timeout for a single connection attempt to one address.
    pub connect_timeout: Option<Duration>,

    /// How long an attempt may stall before the next address is tried
    /// alongside it. `None` tries addresses strictly one at a time.
    pub happy_eyeballs_delay: Option<Duration>,

    /// Idle time before the OS starts sending TCP keep-alive packets.
    pub keep_alive_timeout: Option<Duration>,

    /// Whether to disable Nagle's algorithm.
    pub nodelay: bool,

    /// Whether to reuse the local address.
    pub reuse_address: bool,

    /// The size of the send buffer.
    pub send_buffer_size: Option<usize>,

    /// The size of the receive buffer.
    pub recv_buffer_size: Option<usize>,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(10)),
            happy_eyeballs_delay: Some(Duration::from_millis(250)),
            keep_alive_timeout: Some(Duration::from_secs(90)),
            nodelay: true,
            reuse_address: true,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

/// A TCP connector for client connections.
///
/// Host names are resolved with a [`Resolve`] implementation, by default
/// [`GaiResolver`]. Resolved addresses are raced with the happy eyeballs
/// algorithm (RFC 8305): address families are interleaved, and an attempt
/// which stalls for [`TcpTransportConfig::happy_eyeballs_delay`] gets the
/// next address started alongside it. Each attempt is bounded by
/// [`TcpTransportConfig::connect_timeout`].
///
/// The address which won the last race for an origin is tried first next
/// time. It is forgotten when no address for the origin connects.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    config: Arc<TcpTransportConfig>,
    resolver: Arc<dyn Resolve>,
    last_good: Arc<Mutex<HashMap<OriginKey, SocketAddr>>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new(GaiResolver::new())
    }
}

impl TcpTransport {
    /// Create a TCP transport using `resolver`.
    pub fn new<R: Resolve>(resolver: R) -> Self {
        Self {
            config: Arc::new(TcpTransportConfig::default()),
            resolver: Arc::new(resolver),
            last_good: Default::default(),
        }
    }

    /// Set the TCP connection configuration.
    pub fn with_config(mut self, config: TcpTransportConfig) -> Self {
        self.config = Arc::new(config);
        self
    }

    /// Get the configuration for the TCP connector.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    async fn connect_to(self, origin: OriginKey) -> Result<TcpStream, ConnectError> {
        let host = origin.hostname();
        let mut addrs = self
            .resolver
            .resolve(host, origin.port())
            .await
            .map_err(|source| ConnectError::Resolving {
                host: host.into(),
                source,
            })?;

        if addrs.is_empty() {
            return Err(ConnectError::NoAddresses(host.into()));
        }

        addrs.interleave_families();
        let preferred = self.last_good.lock().get(&origin).copied();
        if let Some(addr) = &preferred {
            addrs.prefer(addr);
        }

        match self.race(addrs).await {
            Ok((addr, stream)) => {
                trace!(peer.addr = %addr, "tcp connected");
                self.remember(origin, addr);
                Ok(stream)
            }
            Err(error) => {
                if preferred.is_some() {
                    self.last_good.lock().remove(&origin);
                }
                Err(error)
            }
        }
    }

    /// Race connection attempts to `addrs`, returning the first to connect.
    async fn race(&self, addrs: SocketAddrs) -> Result<(SocketAddr, TcpStream), ConnectError> {
        let mut attempts = EyeballSet::new(self.config.happy_eyeballs_delay);
        for addr in addrs {
            let config = self.config.clone();
            let span = tracing::trace_span!("connect", remote.addr = %addr);
            attempts.push(
                async move {
                    match connect(&addr, &config).await {
                        Ok(stream) => Ok((addr, stream)),
                        Err(error) => {
                            trace!(%error, "connection attempt failed");
                            Err(error)
                        }
                    }
                }
                .instrument(span),
            );
        }

        attempts.finish().await.map_err(|error| match error {
            HappyEyeballsError::Error(error) => ConnectError::Tcp(error),
            HappyEyeballsError::NoProgress => ConnectError::Tcp(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no address to connect to",
            )),
        })
    }

    fn remember(&self, origin: OriginKey, addr: SocketAddr) {
        let mut last_good = self.last_good.lock();
        if last_good.len() >= MAX_REMEMBERED_ORIGINS && !last_good.contains_key(&origin) {
            if let Some(evicted) = last_good.keys().next().cloned() {
                last_good.remove(&evicted);
            }
        }
        last_good.insert(origin, addr);
    }
}

impl Transport for TcpTransport {
    fn connect(&self, origin: &OriginKey) -> BoxFuture<'static, Result<BoxIo, ConnectError>> {
        let span = tracing::trace_span!("tcp", host = %origin.host(), port = %origin.port());
        let transport = self.clone();
        let origin = origin.clone();
        async move {
            let stream = transport.connect_to(origin).await?;
            Ok(Box::new(stream) as BoxIo)
        }
        .instrument(span)
        .boxed()
    }
}

async fn connect(addr: &SocketAddr, config: &TcpTransportConfig) -> io::Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };

    if config.reuse_address {
        if let Err(e) = socket.set_reuseaddr(true) {
            warn!("tcp set_reuse_address error: {}", e);
        }
    }

    if let Some(size) = config.send_buffer_size {
        if let Err(e) = socket.set_send_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_buffer_size error: {}", e);
        }
    }

    if let Some(size) = config.recv_buffer_size {
        if let Err(e) = socket.set_recv_buffer_size(size.try_into().unwrap_or(u32::MAX)) {
            warn!("tcp set_recv_buffer_size error: {}", e);
        }
    }

    let connect = socket.connect(*addr);
    let stream = match config.connect_timeout {
        Some(dur) => match tokio::time::timeout(dur, connect).await {
            Ok(result) => result?,
            Err(elapsed) => {
                trace!(timeout = ?dur, "connection timed out");
                return Err(io::Error::new(io::ErrorKind::TimedOut, elapsed));
            }
        },
        None => connect.await?,
    };

    if config.nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("tcp set_nodelay error: {}", e);
        }
    }

    if let Some(dur) = config.keep_alive_timeout {
        let keepalive = socket2::TcpKeepalive::new().with_time(dur);
        if let Err(e) = socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            warn!("tcp set_keepalive error: {}", e);
        }
    }

    Ok(stream)
}

#[cfg(test)]
mod test {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::net::TcpListener;

    use super::*;

    #[derive(Debug, Clone)]
    struct Resolver(Vec<SocketAddr>);

    impl Resolve for Resolver {
        fn resolve(&self, _host: &str, _port: u16) -> BoxFuture<'static, io::Result<SocketAddrs>> {
            std::future::ready(Ok(SocketAddrs::from(self.0.clone()))).boxed()
        }
    }

    #[tokio::test]
    async fn connects_to_listener() {
        let _ = tracing_subscriber::fmt::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = TcpTransport::new(Resolver(vec![addr]));

        let origin: OriginKey = format!("http://example.com:{}", addr.port()).parse().unwrap();
        let (stream, accepted) = tokio::join!(transport.connect(&origin), listener.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_ok());
        assert_eq!(transport.last_good.lock().get(&origin), Some(&addr));
    }

    #[tokio::test]
    async fn falls_through_to_working_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Bind and drop to find a port which refuses connections.
        let refused = {
            let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
            closed.local_addr().unwrap()
        };

        let transport = TcpTransport::new(Resolver(vec![refused, addr]));
        let origin: OriginKey = format!("http://example.com:{}", addr.port()).parse().unwrap();
        let (stream, _) = tokio::join!(transport.connect(&origin), listener.accept());
        assert!(stream.is_ok());
    }

    #[tokio::test]
    async fn reports_no_addresses() {
        let transport = TcpTransport::new(Resolver(Vec::new()));
        let origin: OriginKey = "http://example.com".parse().unwrap();
        let result = transport.connect(&origin).await;
        assert!(matches!(result, Err(ConnectError::NoAddresses(_))));
    }

    #[tokio::test]
    async fn reports_refused_connection() {
        let refused = {
            let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
            closed.local_addr().unwrap()
        };
        let transport = TcpTransport::new(Resolver(vec![SocketAddr::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            refused.port(),
        )]));
        let origin: OriginKey = "http://example.com".parse().unwrap();
        let result = transport.connect(&origin).await;
        assert!(matches!(result, Err(ConnectError::Tcp(_))));
    }

    #[tokio::test]
    async fn stalled_address_is_raced_and_winner_remembered() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A non-routable address which either hangs or fails quickly.
        let blackhole: SocketAddr = "10.255.255.1:9".parse().unwrap();

        let transport = TcpTransport::new(Resolver(vec![blackhole, addr])).with_config(
            TcpTransportConfig {
                happy_eyeballs_delay: Some(Duration::from_millis(50)),
                ..Default::default()
            },
        );
        let origin: OriginKey = format!("http://example.com:{}", addr.port()).parse().unwrap();

        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(transport.connect(&origin), listener.accept())
        })
        .await
        .expect("racing should not wait for the stalled address");
        assert!(stream.is_ok());
        assert_eq!(transport.last_good.lock().get(&origin), Some(&addr));
    }

    #[tokio::test]
    async fn forgets_last_good_address_when_nothing_connects() {
        let refused = {
            let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
            closed.local_addr().unwrap()
        };
        let transport = TcpTransport::new(Resolver(vec![refused]));
        let origin: OriginKey = "http://example.com".parse().unwrap();
        transport.last_good.lock().insert(origin.clone(), refused);

        let result = transport.connect(&origin).await;
        assert!(matches!(result, Err(ConnectError::Tcp(_))));
        assert!(transport.last_good.lock().get(&origin).is_none());
    }

    #[test]
    fn remembered_origins_are_bounded() {
        let transport = TcpTransport::new(Resolver(Vec::new()));
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();

        for n in 0..MAX_REMEMBERED_ORIGINS + 10 {
            let origin: OriginKey = format!("http://host{n}.example.com").parse().unwrap();
            transport.remember(origin, addr);
        }
        assert_eq!(transport.last_good.lock().len(), MAX_REMEMBERED_ORIGINS);

        let last: OriginKey = format!("http://host{}.example.com", MAX_REMEMBERED_ORIGINS + 9)
            .parse()
            .unwrap();
        assert!(transport.last_good.lock().contains_key(&last));
    }
}
