//! Connections to remote origins.
//!
//! A [`Transport`] produces a byte stream to an origin (plain TCP, TLS, or an
//! in-memory duplex stream). The [`Connector`] runs the HTTP/1.1 handshake over
//! that stream and spawns the task which drives the connection, producing a
//! [`Connection`] which the pool can manage.

use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, Instrument as _};

use crate::bridge::io::TokioIo;
use crate::client::pool::OriginKey;

pub(crate) mod connection;
pub mod dns;
pub mod transport;

pub(crate) use self::connection::{Connection, ConnectionId, SendError};
pub use self::transport::Transport;

/// Errors which occur while establishing a connection.
///
/// Nothing has been sent to the origin when one of these errors occurs.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConnectError {
    /// Name resolution failed.
    #[error("resolving {host}")]
    Resolving {
        /// The host which could not be resolved.
        host: Box<str>,

        /// The underlying failure.
        #[source]
        source: io::Error,
    },

    /// Name resolution succeeded, but produced no addresses.
    #[error("no addresses found for {0}")]
    NoAddresses(Box<str>),

    /// Every TCP connection attempt failed; this is the first failure.
    #[error("tcp connect")]
    Tcp(#[source] io::Error),

    /// The origin's host is not a valid TLS server name.
    #[error("invalid domain name for tls: {0}")]
    InvalidDomain(String),

    /// The TLS handshake failed.
    #[error("tls handshake")]
    Tls(#[source] io::Error),

    /// The transport can't connect to origins using this scheme.
    #[error("unsupported scheme for this transport: {0}")]
    UnsupportedScheme(crate::client::pool::Scheme),

    /// The HTTP/1.1 handshake failed.
    #[error("http handshake")]
    Handshake(#[source] hyper::Error),

    /// A custom transport failed.
    #[error("transport: {0}")]
    Transport(#[source] crate::BoxError),
}

impl ConnectError {
    /// Create an error from a custom transport failure.
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<crate::BoxError>,
    {
        ConnectError::Transport(error.into())
    }
}

/// Creates [`Connection`]s by connecting a transport and running the HTTP/1.1 handshake.
#[derive(Clone)]
pub(crate) struct Connector {
    transport: Arc<dyn Transport>,
    builder: hyper::client::conn::http1::Builder,
    shutdown: CancellationToken,
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("transport", &self.transport)
            .finish()
    }
}

impl Connector {
    /// Create a connector. Connection driver tasks stop once `shutdown` is cancelled.
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        builder: hyper::client::conn::http1::Builder,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            transport,
            builder,
            shutdown,
        }
    }

    /// Connect to `key`, returning a connection ready to send a request.
    #[tracing::instrument(skip_all, fields(origin = %key), level = "debug")]
    pub(crate) async fn connect(&self, key: OriginKey) -> Result<Connection, ConnectError> {
        let io = self.transport.connect(&key).await?;
        trace!("transport connected");

        let (sender, conn) = self
            .builder
            .handshake(TokioIo::new(io))
            .await
            .map_err(ConnectError::Handshake)?;

        let id = ConnectionId::next();
        let shutdown = self.shutdown.clone();
        let span = tracing::debug_span!("connection", %id, origin = %key);
        let driver = tokio::spawn(
            async move {
                tokio::select! {
                    result = conn => match result {
                        Ok(()) => trace!("connection finished"),
                        Err(error) => debug!(%error, "connection error"),
                    },
                    _ = shutdown.cancelled() => trace!("connection stopped by pool shutdown"),
                }
            }
            .instrument(span),
        );

        debug!(%id, "connection established");
        Ok(Connection::new(id, key, sender, driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use static_assertions::assert_impl_all;

    use crate::client::conn::transport::duplex::DuplexTransport;

    assert_impl_all!(ConnectError: std::error::Error, Send, Sync);
    assert_impl_all!(Connector: Send, Sync, Clone);

    #[tokio::test]
    async fn connect_over_duplex() {
        let _ = tracing_subscriber::fmt::try_init();

        let (transport, mut incoming) = DuplexTransport::new(1024);
        let connector = Connector::new(
            Arc::new(transport),
            hyper::client::conn::http1::Builder::new(),
            CancellationToken::new(),
        );

        let key: OriginKey = "http://example.com".parse().unwrap();
        let (conn, accepted) = tokio::join!(connector.connect(key.clone()), incoming.accept());

        let conn = conn.unwrap();
        let (origin, _stream) = accepted.unwrap();
        assert_eq!(origin, key);
        assert_eq!(conn.key(), &key);
    }

    #[tokio::test]
    async fn shutdown_stops_driver() {
        let (transport, mut incoming) = DuplexTransport::new(1024);
        let shutdown = CancellationToken::new();
        let connector = Connector::new(
            Arc::new(transport),
            hyper::client::conn::http1::Builder::new(),
            shutdown.clone(),
        );

        let key: OriginKey = "http://example.com".parse().unwrap();
        let (conn, accepted) = tokio::join!(connector.connect(key), incoming.accept());
        let conn = conn.unwrap();
        let _stream = accepted.unwrap();

        assert!(crate::client::pool::PoolableConnection::is_open(&conn));
        shutdown.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while crate::client::pool::PoolableConnection::is_open(&conn) {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("driver stops after shutdown");
    }
}
