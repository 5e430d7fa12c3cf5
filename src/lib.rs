//! Courier
//!
//! A pooled HTTP/1.1 client for [tokio], built on top of [hyper].
//!
//! Courier keeps persistent connections per origin, streams request and response
//! bodies without buffering them, follows redirects, and enforces per-phase
//! timeouts and cancellation. The entry point is the [`Session`] type.
//!
//! ```no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let session = courier::Session::builder().build();
//! let response = session.get("http://example.com/").send().await?;
//! println!("{}", response.text().await?);
//! session.close();
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

use std::fmt;

pub mod body;
pub use body::Body;
pub mod bridge;
pub mod client;
pub use client::{Builder, Request, RequestBuilder, Response, ResponseBody, Session};
mod error;
pub use error::Error;
pub(crate) mod happy_eyeballs;
pub mod headers;
pub use headers::Headers;
#[cfg(feature = "multipart")]
pub mod multipart;

/// Boxed error type used for opaque error sources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Boxed future type used at the trait seams of the client.
pub type BoxFuture<'a, T> = futures_util::future::BoxFuture<'a, T>;

#[allow(unused)]
pub(crate) struct DebugLiteral<T: fmt::Display>(T);

impl<T: fmt::Display> fmt::Debug for DebugLiteral<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
