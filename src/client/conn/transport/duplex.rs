//! In-memory transport.
//!
//! Each connection is a [`tokio::io::DuplexStream`] pair: the client keeps one
//! half, the other half is delivered to a [`DuplexIncoming`], where a server can
//! accept it. Useful for tests and for embedding a server in the same process.

use futures_util::FutureExt as _;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tracing::trace;

use super::{BoxIo, ConnectError, Transport};
use crate::client::pool::OriginKey;
use crate::BoxFuture;

/// Transport via in-memory duplex streams.
#[derive(Debug, Clone)]
pub struct DuplexTransport {
    max_buf_size: usize,
    sender: mpsc::UnboundedSender<(OriginKey, DuplexStream)>,
}

impl DuplexTransport {
    /// Create a transport and the receiving end for its server halves.
    ///
    /// `max_buf_size` bounds the bytes buffered in each direction.
    pub fn new(max_buf_size: usize) -> (Self, DuplexIncoming) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                max_buf_size,
                sender,
            },
            DuplexIncoming { receiver },
        )
    }
}

impl Transport for DuplexTransport {
    fn connect(&self, origin: &OriginKey) -> BoxFuture<'static, Result<BoxIo, ConnectError>> {
        let (client, server) = tokio::io::duplex(self.max_buf_size);
        let result = self
            .sender
            .send((origin.clone(), server))
            .map(|_| {
                trace!(%origin, "duplex connected");
                Box::new(client) as BoxIo
            })
            .map_err(|_| ConnectError::transport("duplex listener closed"));
        std::future::ready(result).boxed()
    }
}

/// Server side of a [`DuplexTransport`].
#[derive(Debug)]
pub struct DuplexIncoming {
    receiver: mpsc::UnboundedReceiver<(OriginKey, DuplexStream)>,
}

impl DuplexIncoming {
    /// Wait for the next connection, returning the origin the client asked for.
    ///
    /// Returns `None` once every transport has been dropped.
    pub async fn accept(&mut self) -> Option<(OriginKey, DuplexStream)> {
        self.receiver.recv().await
    }
}
