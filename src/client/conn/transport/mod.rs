//! Transport streams for connecting to remote servers.
//!
//! Transports are responsible for establishing a byte stream to an origin. The
//! HTTP/1.1 protocol is then run over that stream by the connector.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use super::ConnectError;
use crate::client::pool::OriginKey;
use crate::BoxFuture;

pub mod duplex;
pub mod tcp;
#[cfg(feature = "tls")]
pub mod tls;

pub use self::duplex::{DuplexIncoming, DuplexTransport};
pub use self::tcp::{TcpTransport, TcpTransportConfig};
#[cfg(feature = "tls")]
pub use self::tls::TlsTransport;

/// A bidirectional byte stream produced by a [`Transport`].
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed transport stream.
pub type BoxIo = Box<dyn Io>;

/// Connects to origins.
///
/// Implementations should not retry internally beyond trying each resolved
/// address once; the client decides when to retry.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Open a byte stream to `origin`.
    fn connect(&self, origin: &OriginKey) -> BoxFuture<'static, Result<BoxIo, ConnectError>>;
}

impl<T> Transport for std::sync::Arc<T>
where
    T: Transport + ?Sized,
{
    fn connect(&self, origin: &OriginKey) -> BoxFuture<'static, Result<BoxIo, ConnectError>> {
        (**self).connect(origin)
    }
}
