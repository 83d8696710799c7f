//! Transfer target URLs.
//!
//! # Design
//! `TargetUrl` wraps `url::Url` and narrows it to what a transfer can use:
//! an `http` or `https` scheme and a non-empty host. The port is always
//! resolved (explicit or scheme default) so the connection layer never has
//! to consult the scheme again.

use std::fmt;

use url::{Host, Url};

use crate::error::UrlError;

/// URL scheme supported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// A validated, immutable transfer target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUrl {
    url: Url,
    scheme: Scheme,
    port: u16,
}

impl TargetUrl {
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        Self::from_url(Url::parse(input.trim())?)
    }

    fn from_url(url: Url) -> Result<Self, UrlError> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        };
        match url.host_str() {
            Some(host) if !host.is_empty() => {}
            _ => return Err(UrlError::MissingHost),
        }
        let port = url.port().unwrap_or(scheme.default_port());
        Ok(Self { url, scheme, port })
    }

    /// Resolve a `Location` header value against this URL.
    pub fn join(&self, location: &str) -> Result<Self, UrlError> {
        Self::from_url(self.url.join(location.trim())?)
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn uses_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }

    /// Host as written in the URL; IPv6 literals keep their brackets.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Host in the form the resolver expects (no IPv6 brackets).
    pub fn connect_host(&self) -> String {
        match self.url.host() {
            Some(Host::Ipv6(addr)) => addr.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Domain(domain)) => domain.to_string(),
            None => String::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    /// The request-target sent on the request line: `path[?query]`.
    pub fn request_target(&self) -> String {
        match self.url.query() {
            Some(query) => format!("{}?{query}", self.url.path()),
            None => self.url.path().to_string(),
        }
    }

    /// Value of the `Host` header: the port is omitted when it is the default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host().to_string()
        } else {
            format!("{}:{}", self.host(), self.port)
        }
    }

    /// The URL without its fragment, used to detect redirect cycles.
    pub fn without_fragment(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);
        url.into()
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }
}

impl fmt::Display for TargetUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
