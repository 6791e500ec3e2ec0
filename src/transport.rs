//! Transport kinds for HTTP/1.1 and HTTP/2 WebSocket bootstrapping
//!
//! A WebSocket connection is established either by the RFC 6455 upgrade
//! over HTTP/1.1 or by the RFC 8441 Extended CONNECT over an HTTP/2 stream.

use std::fmt;

use http::{StatusCode, Version};

/// The transport a handshake arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// HTTP/1.1 `GET` + `Upgrade: websocket` (RFC 6455)
    Http1,
    /// HTTP/2 `CONNECT` + `:protocol = websocket` (RFC 8441)
    Http2,
}

impl TransportKind {
    /// The HTTP version a request must carry for this transport
    pub fn http_version(&self) -> Version {
        match self {
            TransportKind::Http1 => Version::HTTP_11,
            TransportKind::Http2 => Version::HTTP_2,
        }
    }

    /// Transport for an inbound HTTP version, if WebSocket can be bootstrapped over it
    pub fn from_version(version: Version) -> Option<Self> {
        match version {
            Version::HTTP_11 => Some(TransportKind::Http1),
            Version::HTTP_2 => Some(TransportKind::Http2),
            _ => None,
        }
    }

    /// Status code of a successful handshake response
    ///
    /// HTTP/1.1 switches protocols; HTTP/2 keeps the stream and answers 200.
    pub fn success_status(&self) -> StatusCode {
        match self {
            TransportKind::Http1 => StatusCode::SWITCHING_PROTOCOLS,
            TransportKind::Http2 => StatusCode::OK,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Http1 => write!(f, "HTTP/1.1"),
            TransportKind::Http2 => write!(f, "HTTP/2"),
        }
    }
}
