//! Outgoing requests and the request builder.

use std::time::Duration;

use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::uri::PathAndQuery;
use http::{Method, Uri};
use tokio_util::sync::CancellationToken;

use super::pool::{OriginKey, UrlError};
use super::{Response, Session};
use crate::{Body, Error, Headers};

/// Something which can be turned into an absolute request URL.
pub trait IntoUrl {
    /// Parse into an absolute URL.
    fn into_url(self) -> Result<Uri, UrlError>;
}

impl IntoUrl for Uri {
    fn into_url(self) -> Result<Uri, UrlError> {
        Ok(self)
    }
}

impl IntoUrl for &Uri {
    fn into_url(self) -> Result<Uri, UrlError> {
        Ok(self.clone())
    }
}

impl IntoUrl for &str {
    fn into_url(self) -> Result<Uri, UrlError> {
        Ok(self.parse::<Uri>()?)
    }
}

impl IntoUrl for String {
    fn into_url(self) -> Result<Uri, UrlError> {
        Ok(Uri::try_from(self)?)
    }
}

impl IntoUrl for &String {
    fn into_url(self) -> Result<Uri, UrlError> {
        self.as_str().into_url()
    }
}

/// An HTTP request to be executed by a [`Session`].
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Uri,
    pub(crate) headers: Headers,
    pub(crate) body: Body,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cancel: Option<CancellationToken>,
    pub(crate) follow_redirects: Option<bool>,
}

impl Request {
    /// Create a request with an empty body.
    ///
    /// The URL must be absolute, with an `http` or `https` scheme.
    pub fn new(method: Method, url: Uri) -> Result<Self, Error> {
        OriginKey::try_from(&url)?;
        Ok(Self {
            method,
            url,
            headers: Headers::new(),
            body: Body::empty(),
            timeout: None,
            cancel: None,
            follow_redirects: None,
        })
    }

    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URL.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Mutable access to the request headers.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    /// The request body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Replace the request body.
    pub fn set_body(&mut self, body: Body) {
        self.body = body;
    }

    /// Overall timeout for this request, replacing the session's total timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the overall timeout for this request.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// Cancel this request when `token` is cancelled.
    pub fn set_cancel_token(&mut self, token: CancellationToken) {
        self.cancel = Some(token);
    }

    /// Whether redirects are followed for this request, if set per request.
    pub fn follow_redirects(&self) -> Option<bool> {
        self.follow_redirects
    }

    /// Follow (or don't follow) redirects for this request.
    pub fn set_follow_redirects(&mut self, follow: bool) {
        self.follow_redirects = Some(follow);
    }

    /// Try to clone this request.
    ///
    /// Fails when the body is a stream which can't be restarted.
    pub fn try_clone(&self) -> Option<Self> {
        Some(Self {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            body: self.body.try_clone()?,
            timeout: self.timeout,
            cancel: self.cancel.clone(),
            follow_redirects: self.follow_redirects,
        })
    }

    pub(crate) fn parts(&self) -> RequestParts {
        RequestParts {
            method: self.method.clone(),
            url: self.url.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// The method, URL and headers of the request which produced a response.
#[derive(Debug, Clone)]
pub struct RequestParts {
    method: Method,
    url: Uri,
    headers: Headers,
}

impl RequestParts {
    /// The request method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URL.
    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The request headers, as given by the caller.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// Builds a [`Request`] and sends it with the [`Session`] which created it.
///
/// Errors (an invalid URL or header) are kept until [`RequestBuilder::send`]
/// or [`RequestBuilder::build`] is called.
#[derive(Debug)]
#[must_use = "requests are only sent when `send` is awaited"]
pub struct RequestBuilder {
    session: Session,
    request: Result<Request, Error>,
}

impl RequestBuilder {
    pub(crate) fn new<U: IntoUrl>(session: Session, method: Method, url: U) -> Self {
        let request = url
            .into_url()
            .map_err(Error::from)
            .and_then(|url| Request::new(method, url));
        Self { session, request }
    }

    /// Append a header to the request.
    pub fn header<K, V>(mut self, name: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        if let Ok(request) = &mut self.request {
            let name = HeaderName::try_from(name).map_err(Into::into);
            let value = HeaderValue::try_from(value).map_err(Into::into);
            match name.and_then(|name| value.map(|value| (name, value))) {
                Ok((name, value)) => request.headers.append(name, value),
                Err(error) => self.request = Err(Error::InvalidHeader(error)),
            }
        }
        self
    }

    /// Append every header in `headers` to the request.
    pub fn headers(mut self, headers: Headers) -> Self {
        if let Ok(request) = &mut self.request {
            request.headers.extend(headers);
        }
        self
    }

    /// Set the request body.
    pub fn body<B: Into<Body>>(mut self, body: B) -> Self {
        if let Ok(request) = &mut self.request {
            request.body = body.into();
        }
        self
    }

    /// Serialize `value` as the JSON request body.
    #[cfg(feature = "json")]
    pub fn json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Self {
        if let Ok(request) = &mut self.request {
            match serde_json::to_vec(value) {
                Ok(body) => {
                    if !request.headers.contains(CONTENT_TYPE) {
                        request.headers.append(
                            CONTENT_TYPE,
                            HeaderValue::from_static("application/json"),
                        );
                    }
                    request.body = Body::from(body);
                }
                Err(error) => self.request = Err(Error::Json(error)),
            }
        }
        self
    }

    /// Add `query` to the URL's query string.
    ///
    /// Keys already present in the URL keep the URL's values.
    pub fn query<T: serde::Serialize + ?Sized>(mut self, query: &T) -> Self {
        if let Ok(request) = &mut self.request {
            match merge_query(&request.url, query) {
                Ok(url) => request.url = url,
                Err(error) => self.request = Err(error),
            }
        }
        self
    }

    /// Send `form` as an `application/x-www-form-urlencoded` body.
    pub fn form<T: serde::Serialize + ?Sized>(mut self, form: &T) -> Self {
        if let Ok(request) = &mut self.request {
            match serde_urlencoded::to_string(form) {
                Ok(body) => {
                    if !request.headers.contains(CONTENT_TYPE) {
                        request.headers.append(
                            CONTENT_TYPE,
                            HeaderValue::from_static("application/x-www-form-urlencoded"),
                        );
                    }
                    request.body = Body::from(body);
                }
                Err(error) => self.request = Err(Error::UrlEncode(error)),
            }
        }
        self
    }

    /// Send `form` as a `multipart/form-data` body.
    ///
    /// Replaces any `Content-Type` already set, since it must name the form's boundary.
    #[cfg(feature = "multipart")]
    pub fn multipart(mut self, form: crate::multipart::Form) -> Self {
        if let Ok(request) = &mut self.request {
            match HeaderValue::try_from(form.content_type()) {
                Ok(content_type) => {
                    request.headers.insert(CONTENT_TYPE, content_type);
                    request.body = form.into_body();
                }
                Err(error) => self.request = Err(Error::InvalidHeader(error.into())),
            }
        }
        self
    }

    /// Set the overall timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        if let Ok(request) = &mut self.request {
            request.timeout = Some(timeout);
        }
        self
    }

    /// Cancel the request when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        if let Ok(request) = &mut self.request {
            request.cancel = Some(token);
        }
        self
    }

    /// Follow (or don't follow) redirects for this request.
    pub fn follow_redirects(mut self, follow: bool) -> Self {
        if let Ok(request) = &mut self.request {
            request.follow_redirects = Some(follow);
        }
        self
    }

    /// Build the request without sending it.
    pub fn build(self) -> Result<Request, Error> {
        self.request
    }

    /// Send the request.
    pub async fn send(self) -> Result<Response, Error> {
        let request = self.request?;
        self.session.execute(request).await
    }
}

fn merge_query<T: serde::Serialize + ?Sized>(url: &Uri, query: &T) -> Result<Uri, Error> {
    let existing = url.query().unwrap_or_default();
    let present: Vec<(String, String)> = serde_urlencoded::from_str(existing).unwrap_or_default();
    let added: Vec<(String, String)> =
        serde_urlencoded::from_str(&serde_urlencoded::to_string(query)?).unwrap_or_default();

    let added: Vec<_> = added
        .into_iter()
        .filter(|(key, _)| !present.iter().any(|(name, _)| name == key))
        .collect();
    if added.is_empty() {
        return Ok(url.clone());
    }

    let added = serde_urlencoded::to_string(&added)?;
    let query = if existing.is_empty() {
        added
    } else {
        format!("{added}&{existing}")
    };

    let path_and_query = format!("{}?{}", url.path(), query)
        .parse::<PathAndQuery>()
        .map_err(UrlError::from)?;
    let mut parts = url.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Ok(Uri::from_parts(parts).map_err(UrlError::from)?)
}
