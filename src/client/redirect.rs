//! Redirect handling.
//!
//! A request is sent, and while the response is a redirect with a `Location`
//! header, the next request is derived from the previous one:
//!
//! - `303 See Other` turns every method but `HEAD` into a bodiless `GET`.
//! - `301` and `302` turn `POST` into a bodiless `GET`.
//! - Otherwise the method is kept and the body is sent again, which requires
//!   a body that can be restarted.
//!
//! `Authorization` is dropped once a redirect leaves the origin of the first
//! request.

use std::time::Duration;

use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, LOCATION, TRANSFER_ENCODING};
use http::{Method, StatusCode, Uri};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::executor;
use super::pool::{OriginKey, UrlError};
use super::request::Request;
use super::response::Response;
use super::timeout::Budget;
use super::SessionRef;
use crate::{Body, Error, Headers};

/// Redirect bodies up to this size are read, so their connection can be reused.
const DRAIN_LIMIT: usize = 64 * 1024;

/// How redirects are followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct RedirectConfig {
    /// Follow redirects at all. Can be changed per request.
    pub follow: bool,

    /// The number of redirects followed before failing with
    /// [`Error::TooManyRedirects`].
    pub max_redirects: usize,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            follow: true,
            max_redirects: 10,
        }
    }
}

/// Send `request`, following redirects as configured.
pub(crate) async fn send(session: &SessionRef, request: Request) -> Result<Response, Error> {
    let mut timeouts = session.config.timeouts;
    if let Some(total) = request.timeout {
        timeouts.total = Some(total);
    }
    let budget = Budget::new(timeouts, request.cancel.clone());
    let follow = request
        .follow_redirects
        .unwrap_or(session.config.redirect.follow);
    let limit = session.config.redirect.max_redirects;
    let origin = OriginKey::try_from(&request.url)?;

    let mut request = request;
    let mut followed = 0;
    loop {
        if budget.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let hop = follow.then(|| Hop::of(&request));
        let response = executor::execute(session, request, &budget).await?;

        let Some(hop) = hop else {
            return Ok(response);
        };

        let Some(location) = location(&response) else {
            return Ok(response);
        };
        let location = resolve(response.url(), location)?;

        if followed >= limit {
            debug!(limit, %location, "redirect limit reached");
            return Err(Error::TooManyRedirects { limit, location });
        }

        let status = response.status();
        request = hop.follow(status, location, &origin)?;
        response.into_body().drain(DRAIN_LIMIT).await;
        followed += 1;

        debug!(
            %status,
            method = %request.method,
            location = %request.url,
            followed,
            "following redirect"
        );
    }
}

/// The `Location` of a redirect response, if it is one.
fn location(response: &Response) -> Option<&str> {
    match response.status() {
        StatusCode::MOVED_PERMANENTLY
        | StatusCode::FOUND
        | StatusCode::SEE_OTHER
        | StatusCode::TEMPORARY_REDIRECT
        | StatusCode::PERMANENT_REDIRECT => response.headers().get(LOCATION)?.to_str().ok(),
        _ => None,
    }
}

/// What is needed from a sent request to derive the next one.
#[derive(Debug)]
struct Hop {
    method: Method,
    headers: Headers,
    body: Option<Body>,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl Hop {
    fn of(request: &Request) -> Self {
        Self {
            method: request.method.clone(),
            headers: request.headers.clone(),
            body: request.body.try_clone(),
            timeout: request.timeout,
            cancel: request.cancel.clone(),
        }
    }

    /// The request which follows a `status` redirect to `location`.
    fn follow(self, status: StatusCode, location: Uri, origin: &OriginKey) -> Result<Request, Error> {
        let target = OriginKey::try_from(&location)?;
        let mut headers = self.headers;

        let to_get = match status {
            StatusCode::SEE_OTHER => self.method != Method::HEAD,
            StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => self.method == Method::POST,
            _ => false,
        };

        let (method, body) = if to_get {
            headers.remove(CONTENT_LENGTH);
            headers.remove(CONTENT_TYPE);
            headers.remove(TRANSFER_ENCODING);
            (Method::GET, Body::empty())
        } else {
            let body = self
                .body
                .ok_or(Error::NonRestartableRedirectBody { status })?;
            (self.method, body)
        };

        headers.remove(HOST);
        if target != *origin && headers.remove(AUTHORIZATION) > 0 {
            debug!(%target, "dropping authorization for another origin");
        }

        Ok(Request {
            method,
            url: location,
            headers,
            body,
            timeout: self.timeout,
            cancel: self.cancel,
            follow_redirects: Some(true),
        })
    }
}

/// Resolve a `Location` header value against the URL which returned it.
pub(crate) fn resolve(base: &Uri, location: &str) -> Result<Uri, UrlError> {
    let invalid = || UrlError::InvalidLocation(location.to_owned());

    let location = location.trim();
    let reference = location.split('#').next().unwrap_or_default();
    if reference.is_empty() {
        return Ok(base.clone());
    }

    let scheme = base.scheme_str().ok_or_else(invalid)?;
    let authority = base.authority().ok_or_else(invalid)?;

    let resolved = if has_scheme(reference) {
        reference.to_owned()
    } else if let Some(rest) = reference.strip_prefix("//") {
        format!("{scheme}://{rest}")
    } else if reference.starts_with('/') {
        let (path, query) = split_query(reference);
        format!("{scheme}://{authority}{}{query}", remove_dot_segments(path))
    } else if reference.starts_with('?') {
        format!("{scheme}://{authority}{}{reference}", base.path())
    } else {
        let (path, query) = split_query(reference);
        let base_path = base.path();
        let directory = &base_path[..base_path.rfind('/').map_or(0, |i| i + 1)];
        let merged = if directory.is_empty() {
            format!("/{path}")
        } else {
            format!("{directory}{path}")
        };
        format!("{scheme}://{authority}{}{query}", remove_dot_segments(&merged))
    };

    let uri: Uri = resolved.parse().map_err(|_| invalid())?;
    OriginKey::try_from(&uri).map_err(|_| invalid())?;
    Ok(uri)
}

fn has_scheme(reference: &str) -> bool {
    match reference.find(':') {
        Some(colon) => {
            let scheme = &reference[..colon];
            !scheme.is_empty()
                && !scheme.contains('/')
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        }
        None => false,
    }
}

fn split_query(reference: &str) -> (&str, &str) {
    match reference.find('?') {
        Some(index) => reference.split_at(index),
        None => (reference, ""),
    }
}

/// Collapse `.` and `..` segments of an absolute path.
fn remove_dot_segments(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    let mut trailing_slash = false;
    for segment in path.split('/').skip(1) {
        trailing_slash = false;
        match segment {
            "." => trailing_slash = true,
            ".." => {
                segments.pop();
                trailing_slash = true;
            }
            segment => segments.push(segment),
        }
    }

    let mut out = String::with_capacity(path.len());
    for segment in &segments {
        out.push('/');
        out.push_str(segment);
    }
    if trailing_slash || out.is_empty() {
        out.push('/');
    }
    out
}
