//! TLS transport, wrapping another transport.

use std::sync::Arc;

use futures_util::FutureExt as _;
use rustls::pki_types::ServerName;
use rustls::ClientConfig as TlsClientConfig;
use tokio_rustls::TlsConnector;
use tracing::{trace, Instrument as _};

use super::{BoxIo, ConnectError, Transport};
use crate::client::pool::{OriginKey, Scheme};
use crate::BoxFuture;

/// Transport via TLS.
///
/// Origins with the `https` scheme are connected through the inner transport
/// and then wrapped in a TLS session. Plain `http` origins pass straight
/// through to the inner transport.
#[derive(Debug, Clone)]
pub struct TlsTransport<T> {
    transport: T,
    config: Arc<TlsClientConfig>,
}

impl<T> TlsTransport<T> {
    /// Create a new `TlsTransport`
    pub fn new(transport: T, config: Arc<TlsClientConfig>) -> Self {
        Self { transport, config }
    }

    /// Returns a reference to the inner transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a reference to the TLS configuration.
    pub fn config(&self) -> &Arc<TlsClientConfig> {
        &self.config
    }
}

impl<T> Transport for TlsTransport<T>
where
    T: Transport,
{
    fn connect(&self, origin: &OriginKey) -> BoxFuture<'static, Result<BoxIo, ConnectError>> {
        if origin.scheme() == Scheme::Http {
            return self.transport.connect(origin);
        }

        let domain = match ServerName::try_from(origin.hostname().to_owned()) {
            Ok(domain) => domain,
            Err(_) => {
                let error = ConnectError::InvalidDomain(origin.hostname().to_owned());
                return std::future::ready(Err(error)).boxed();
            }
        };

        let connecting = self.transport.connect(origin);
        let connector = TlsConnector::from(self.config.clone());
        let span = tracing::trace_span!("tls", host = %origin.host());
        async move {
            let io = connecting.await?;
            let stream = connector
                .connect(domain, io)
                .await
                .map_err(ConnectError::Tls)?;
            trace!("tls handshake complete");
            Ok(Box::new(stream) as BoxIo)
        }
        .instrument(span)
        .boxed()
    }
}

/// Get a default TLS client configuration by loading the platform's native certificates.
///
/// Certificates which fail to load or parse are skipped.
pub fn default_tls_config() -> TlsClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for error in &native.errors {
        tracing::warn!(%error, "could not load platform certificate");
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    trace!(added, ignored, "loaded platform certificates");

    let mut cfg = TlsClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    cfg.alpn_protocols.push(b"http/1.1".to_vec());
    cfg
}

#[cfg(all(test, feature = "tls-ring", not(feature = "tls-aws-lc")))]
mod tests {
    use super::*;

    use crate::client::conn::transport::DuplexTransport;

    fn config() -> Arc<TlsClientConfig> {
        Arc::new(
            TlsClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    #[tokio::test]
    async fn plain_http_passes_through() {
        let (duplex, mut incoming) = DuplexTransport::new(64);
        let transport = TlsTransport::new(duplex, config());

        let origin: OriginKey = "http://example.com".parse().unwrap();
        let (stream, accepted) = tokio::join!(transport.connect(&origin), incoming.accept());
        assert!(stream.is_ok());
        assert!(accepted.is_some());
    }

    #[tokio::test]
    async fn handshake_failure_is_reported() {
        let (duplex, mut incoming) = DuplexTransport::new(64);
        let transport = TlsTransport::new(duplex, config());

        let origin: OriginKey = "https://example.com".parse().unwrap();
        let server = tokio::spawn(async move {
            // Accept and hang up without speaking TLS.
            let accepted = incoming.accept().await;
            drop(accepted);
        });

        let result = transport.connect(&origin).await;
        assert!(matches!(result, Err(ConnectError::Tls(_))));
        server.await.unwrap();
    }
}
