//! Error types for the upgrade layer

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Result type alias for upgrade operations
pub type Result<T> = std::result::Result<T, Error>;

/// Upgrade error types
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the underlying endpoint
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
    /// Malformed or transport-mismatched HTTP request
    #[error("Invalid HTTP: {0}")]
    InvalidHttp(&'static str),
    /// Handshake failed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(&'static str),
    /// Origin not permitted by configuration
    #[error("Origin not allowed")]
    OriginNotAllowed,
    /// An accepted value that cannot be derived from the client's offer
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The client demanded an extension the server cannot honor
    #[error("Negotiation failed: {0}")]
    Negotiation(String),
    /// No application handler for the request
    #[error("No frame handler available")]
    HandlerUnavailable,
    /// The low-level connection could not be built
    #[error("Connection build failed: {0}")]
    ConnectionBuild(String),
    /// Connection closed
    #[error("Connection closed")]
    ConnectionClosed,
    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    /// Message too large
    #[error("Message too large")]
    MessageTooLarge,
    /// Compression/decompression error
    #[error("Compression error: {0}")]
    Compression(String),
}

impl Error {
    /// HTTP status used when this error rejects a handshake before the upgrade point
    pub fn status(&self) -> StatusCode {
        match self {
            Error::InvalidHttp(_)
            | Error::HandshakeFailed(_)
            | Error::Configuration(_)
            | Error::Negotiation(_) => StatusCode::BAD_REQUEST,
            Error::OriginNotAllowed => StatusCode::FORBIDDEN,
            Error::HandlerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset => Error::ConnectionClosed,
            _ => Error::Io(e),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::ConnectionClosed => {
                io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
            }
            other => io::Error::other(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::HandshakeFailed("x").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Negotiation("bad".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(Error::OriginNotAllowed.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            Error::HandlerUnavailable.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::ConnectionBuild("no tunnel".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_io_conversion() {
        let err: Error = io::Error::new(io::ErrorKind::BrokenPipe, "gone").into();
        assert!(matches!(err, Error::ConnectionClosed));

        let err: Error = io::Error::other("boom").into();
        assert!(matches!(err, Error::Io(_)));

        let io_err: io::Error = Error::ConnectionClosed.into();
        assert_eq!(io_err.kind(), io::ErrorKind::BrokenPipe);
    }
}
