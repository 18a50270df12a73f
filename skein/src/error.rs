//! Error surface: configuration failures and per-request error responses.

use std::io;

/// What failed, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// DNS gave no usable address after retries.
    Resolve,
    /// TCP connect refused, unreachable, or timed out at the socket.
    Connect,
    /// TLS handshake failure, including certificate name mismatch.
    Tls,
    /// Malformed HTTP/1.1 or HTTP/2 traffic. Never retried.
    Protocol,
    /// The request deadline passed, at whatever phase.
    Timeout,
    /// The peer closed the transport mid-exchange. Retriable.
    PeerClosed,
    /// Status >= 400, surfaced through `raise_for_status`.
    Http,
}

impl ErrorKind {
    /// Whether a fresh connection may transparently retry this failure.
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::PeerClosed)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Resolve => "resolve error",
            ErrorKind::Connect => "connect error",
            ErrorKind::Tls => "tls error",
            ErrorKind::Protocol => "protocol error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::PeerClosed => "peer closed",
            ErrorKind::Http => "http error",
        };
        f.write_str(name)
    }
}

/// The error half of a request outcome.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ErrorResponse {
    kind: ErrorKind,
    message: String,
    /// HTTP status when `kind` is [`ErrorKind::Http`].
    status: Option<u16>,
    /// Connection-level retries consumed before giving up.
    retries: u32,
}

impl ErrorResponse {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retries: 0,
        }
    }

    pub fn http(status: u16) -> Self {
        Self {
            kind: ErrorKind::Http,
            message: format!("HTTP status {status}"),
            status: Some(status),
            retries: 0,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// Hard failures: bad input to the API or a broken local environment.
/// Per-request network failures travel as [`ErrorResponse`] instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("invalid option: {0}")]
    InvalidOption(String),
    #[error("body not representable: {0}")]
    Body(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("tls setup: {0}")]
    Tls(#[from] rustls::Error),
    /// A request failed; the convenience methods funnel the per-request
    /// error through here.
    #[error(transparent)]
    Request(#[from] ErrorResponse),
}
