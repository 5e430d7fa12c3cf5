use std::{fmt, str::FromStr};

use thiserror::Error;

/// The URL used for a request can't be used to reach an origin.
///
/// Usually, this means that the URL is missing a scheme or host,
/// but it can also mean that the URL could not be parsed at all.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UrlError {
    /// The URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),

    /// The URL could not be put back together after editing it.
    #[error("invalid url: {0}")]
    InvalidUriParts(#[from] http::uri::InvalidUriParts),

    /// The URL is missing a scheme.
    #[error("missing scheme in url: {0}")]
    MissingScheme(http::Uri),

    /// The URL uses a scheme other than `http` or `https`.
    #[error("unsupported scheme in url: {0}")]
    UnsupportedScheme(http::Uri),

    /// The URL is missing a host.
    #[error("missing host in url: {0}")]
    MissingHost(http::Uri),

    /// A redirect `Location` could not be resolved into a URL.
    #[error("invalid redirect location: {0}")]
    InvalidLocation(String),
}

/// The scheme part of an origin.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Scheme {
    /// Plain-text HTTP.
    Http,

    /// HTTP over TLS.
    Https,
}

impl Scheme {
    /// The port used when a URL doesn't name one.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    /// The scheme as it appears in a URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pool key which identifies an origin: scheme, host and port.
///
/// Connections are only ever reused for requests to the same origin.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct OriginKey {
    scheme: Scheme,
    host: Box<str>,
    port: u16,
}

impl OriginKey {
    /// Create a key from its parts. The host is normalized to lowercase.
    pub fn new(scheme: Scheme, host: &str, port: u16) -> Self {
        Self {
            scheme,
            host: host.to_ascii_lowercase().into(),
            port,
        }
    }

    /// The scheme of this origin.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host of this origin, IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The host without IPv6 brackets, suitable for name resolution.
    pub fn hostname(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    /// The port of this origin.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Is the port the default one for the scheme?
    pub fn is_default_port(&self) -> bool {
        self.port == self.scheme.default_port()
    }

    /// The value of the `Host` header for requests to this origin.
    pub fn authority(&self) -> String {
        if self.is_default_port() {
            self.host.to_string()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&http::Uri> for OriginKey {
    type Error = UrlError;

    fn try_from(uri: &http::Uri) -> Result<Self, Self::Error> {
        let scheme = match uri.scheme_str() {
            Some(scheme) if scheme.eq_ignore_ascii_case("http") => Scheme::Http,
            Some(scheme) if scheme.eq_ignore_ascii_case("https") => Scheme::Https,
            Some(_) => return Err(UrlError::UnsupportedScheme(uri.clone())),
            None => return Err(UrlError::MissingScheme(uri.clone())),
        };

        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| UrlError::MissingHost(uri.clone()))?;
        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());

        Ok(Self::new(scheme, host, port))
    }
}

impl TryFrom<http::Uri> for OriginKey {
    type Error = UrlError;

    fn try_from(uri: http::Uri) -> Result<Self, Self::Error> {
        Self::try_from(&uri)
    }
}

impl FromStr for OriginKey {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = http::Uri::from_str(s)?;
        uri.try_into()
    }
}

#[cfg(test)]
pub(crate) mod test_key {
    use super::*;

    #[test]
    fn key_from_uri() {
        let uri = http::Uri::from_static("http://localhost:8080/path?q=1");
        let key: OriginKey = uri.try_into().unwrap();
        assert_eq!(key.scheme(), Scheme::Http);
        assert_eq!(key.host(), "localhost");
        assert_eq!(key.port(), 8080);
    }

    #[test]
    fn key_fills_default_port() {
        let key: OriginKey = "https://Example.COM/".parse().unwrap();
        assert_eq!(key.port(), 443);
        assert_eq!(key.host(), "example.com");
        assert_eq!(key.authority(), "example.com");
        assert_eq!(key, "https://example.com:443".parse().unwrap());
    }

    #[test]
    fn key_display() {
        let key = OriginKey::new(Scheme::Http, "localhost", 8080);
        assert_eq!(key.to_string(), "http://localhost:8080");
        assert_eq!(key.authority(), "localhost:8080");
    }

    #[test]
    fn key_ipv6_hostname() {
        let key: OriginKey = "http://[::1]:3000/".parse().unwrap();
        assert_eq!(key.host(), "[::1]");
        assert_eq!(key.hostname(), "::1");
    }

    #[test]
    fn key_rejects_other_schemes() {
        assert!(matches!(
            "ftp://example.com/".parse::<OriginKey>(),
            Err(UrlError::UnsupportedScheme(_))
        ));
        assert!(matches!(
            "/relative".parse::<OriginKey>(),
            Err(UrlError::MissingScheme(_))
        ));
    }
}
