//! Error types for the HTTP/2 framing layer.

/// Wire-level error codes carried by RST_STREAM and GOAWAY (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    Protocol = 0x1,
    Internal = 0x2,
    FlowControl = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSize = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    Compression = 0x9,
    Connect = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_wire(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::Protocol,
            0x2 => Self::Internal,
            0x3 => Self::FlowControl,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSize,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::Compression,
            0xa => Self::Connect,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // Unknown codes are treated as INTERNAL_ERROR (RFC 7540 Section 7).
            _ => Self::Internal,
        }
    }

    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// Errors produced while encoding, decoding, or driving a connection.
///
/// This crate is sans-IO and dependency-free, so the error type keeps a
/// hand-written `Display` instead of a derive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer violated the protocol; the connection must be torn down.
    Protocol(String),
    /// HPACK header block could not be decoded (or encoded).
    Compression,
    /// A flow-control window went negative or past 2^31 - 1.
    FlowControl,
    /// A frame length field was inconsistent with its type.
    FrameSize,
    /// Stream-level failure; only the stream is affected.
    Stream { id: u32, code: ErrorCode },
    /// Operation attempted on a connection that is closing or closed.
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Self::Compression => write!(f, "header compression error"),
            Self::FlowControl => write!(f, "flow control violation"),
            Self::FrameSize => write!(f, "invalid frame size"),
            Self::Stream { id, code } => write!(f, "stream {id} error: {code:?}"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }
}
