//! An HTTP/1.1 test server behind an in-memory duplex transport.

#![allow(dead_code)]

use std::convert::Infallible;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use courier::bridge::io::TokioIo;
use courier::client::conn::transport::{DuplexIncoming, DuplexTransport};
use courier::client::{Builder, OriginKey};
use courier::Session;
use http::{HeaderMap, Method, StatusCode, Uri};
use http_body_util::{BodyExt as _, Full};
use hyper::body::Incoming;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A request as seen by the test server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub connection: usize,
    pub origin: OriginKey,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct TestServer {
    connections: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    max_open: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Recorded>>>,
}

impl TestServer {
    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Connections currently open on the server side.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// The most connections which were open at once.
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    /// Every request received, in order.
    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serve every connection from `incoming` with `handler`.
pub fn serve<H, Fut>(mut incoming: DuplexIncoming, handler: H) -> TestServer
where
    H: Fn(Recorded) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Full<Bytes>>> + Send + 'static,
{
    let server = TestServer::default();
    let state = server.clone();

    tokio::spawn(async move {
        while let Some((origin, stream)) = incoming.accept().await {
            let id = state.connections.fetch_add(1, Ordering::SeqCst) + 1;
            let open = state.open.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_open.fetch_max(open, Ordering::SeqCst);
            let guard = OpenGuard(state.open.clone());

            let handler = handler.clone();
            let requests = state.requests.clone();
            tokio::spawn(async move {
                let _guard = guard;
                let service = hyper::service::service_fn(move |request: http::Request<Incoming>| {
                    let handler = handler.clone();
                    let requests = requests.clone();
                    let origin = origin.clone();
                    async move {
                        let (parts, body) = request.into_parts();
                        let body = body
                            .collect()
                            .await
                            .map(|collected| collected.to_bytes())
                            .unwrap_or_default();
                        let recorded = Recorded {
                            connection: id,
                            origin,
                            method: parts.method,
                            uri: parts.uri,
                            headers: parts.headers,
                            body,
                        };
                        requests.lock().unwrap().push(recorded.clone());
                        Ok::<_, Infallible>(handler(recorded).await)
                    }
                });

                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    server
}

/// A session connected to a test server running `handler`.
pub fn setup<H, Fut>(configure: impl FnOnce(Builder) -> Builder, handler: H) -> (Session, TestServer)
where
    H: Fn(Recorded) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Full<Bytes>>> + Send + 'static,
{
    let _ = tracing_subscriber::fmt::try_init();

    let (transport, incoming) = DuplexTransport::new(64 * 1024);
    let server = serve(incoming, handler);
    let session = configure(Session::builder().with_transport(transport)).build();
    (session, server)
}

pub fn respond(status: StatusCode, body: impl Into<Bytes>) -> http::Response<Full<Bytes>> {
    let mut response = http::Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

pub fn ok(body: impl Into<Bytes>) -> http::Response<Full<Bytes>> {
    respond(StatusCode::OK, body)
}

pub fn redirect(status: StatusCode, location: &str) -> http::Response<Full<Bytes>> {
    let mut response = respond(status, "redirecting");
    response.headers_mut().insert(
        http::header::LOCATION,
        http::HeaderValue::from_str(location).unwrap(),
    );
    response
}

pub fn origin(url: &str) -> OriginKey {
    url.parse().unwrap()
}
