//! Error types for the transfer engine.
//!
//! # Design
//! Errors are layered the way a transfer fails: the URL is rejected before
//! anything happens (`UrlError`), the socket cannot be established
//! (`ConnectError`), the established socket fails mid-exchange (`IoError`),
//! or the peer sends bytes that are not a valid HTTP/1.1 response
//! (`ParseError`). `TransferError` wraps all of them plus the failures that
//! only exist at the transfer level (redirect limits, deadlines, sink abort).
//!
//! `ParseError` is `Copy` because it is also the payload of
//! `BodyFrame::Error`, which is handed to the caller's sink.

use std::io;

use thiserror::Error;

/// A URL could not be used as a transfer target.
#[derive(Debug, Error)]
pub enum UrlError {
    #[error("invalid URL: {0}")]
    Parse(#[from] url::ParseError),

    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),

    #[error("URL has no host")]
    MissingHost,
}

/// Establishing the connection failed.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connect timed out")]
    Timeout,

    #[error("connection refused")]
    Refused,

    #[error("could not resolve host {host}")]
    DnsFailed {
        host: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("TLS handshake failed: {0}")]
    TlsHandshakeFailed(String),

    #[error("connect failed: {0}")]
    Io(#[source] io::Error),
}

/// Reading from or writing to an established connection failed.
#[derive(Debug, Error)]
pub enum IoError {
    #[error("broken pipe")]
    BrokenPipe,

    #[error("I/O timed out")]
    Timeout,

    #[error("connection reset by peer")]
    Reset,

    #[error("I/O error: {0}")]
    Other(#[source] io::Error),
}

impl From<io::Error> for IoError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe => IoError::BrokenPipe,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => IoError::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => IoError::Reset,
            _ => IoError::Other(err),
        }
    }
}

/// The response bytes violate HTTP/1.1 framing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed status line")]
    MalformedStatus,

    #[error("malformed header line")]
    MalformedHeader,

    #[error("malformed chunk size")]
    MalformedChunk,

    #[error("connection closed before the body was complete")]
    TruncatedBody,

    #[error("response body length cannot be determined")]
    AmbiguousFraming,

    #[error("response head exceeds the size limit")]
    HeadersTooLarge,

    #[error("connection closed before the response head was complete")]
    IncompleteHead,
}

/// Errors returned by `Transfer::run` and `TransferEngine::fetch`.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    /// The redirect chain hit the request cap, or revisited a URL.
    #[error("too many redirects after {requests} requests")]
    TooManyRedirects { requests: u32, cycle: bool },

    /// The total transfer deadline elapsed.
    #[error("transfer timed out")]
    Timeout,

    /// The sink asked to stop the transfer.
    #[error("transfer aborted by sink")]
    Aborted,

    #[error("TLS configuration error: {0}")]
    TlsConfig(#[from] rustls::Error),
}

impl TransferError {
    /// True for every flavor of timeout: connect, I/O, or the total deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransferError::Timeout
                | TransferError::Connect(ConnectError::Timeout)
                | TransferError::Io(IoError::Timeout)
        )
    }
}
