//! RFC 6455 handshake (HTTP/1.1 upgrade)
//!
//! The HTTP/1.1 transport variant of the handshake driver:
//! - `GET` with `Upgrade: websocket` on an HTTP/1.1 request
//! - `Sec-WebSocket-Key` answered with `Sec-WebSocket-Accept`
//! - 101 Switching Protocols, written on the byte stream ahead of the first frame

use std::sync::Arc;

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, SEC_WEBSOCKET_ACCEPT, UPGRADE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::channel::HttpChannel;
use crate::connection::{CoreSession, FrameHandler, WebSocketConnection};
use crate::error::{Error, Result};
use crate::negotiation::{Negotiation, header_has_token};
use crate::server::Handshaker;
use crate::transport::TransportKind;

/// Generate the Sec-WebSocket-Accept key
///
/// This computes: Base64(SHA-1(key + GUID))
#[inline]
pub fn generate_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let hash = hasher.finalize();
    base64::engine::general_purpose::STANDARD.encode(hash)
}

/// Serialize the head of an HTTP/1.1 response
pub fn encode_response_head(response: &Response<()>) -> Bytes {
    let mut buf = BytesMut::with_capacity(256);
    let status = response.status();

    buf.put_slice(b"HTTP/1.1 ");
    buf.put_slice(status.as_str().as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    buf.put_slice(b"\r\n");

    for (name, value) in response.headers() {
        buf.put_slice(name.as_str().as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// HTTP/1.1 upgrade handshaker
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc6455Handshaker;

impl Handshaker for Rfc6455Handshaker {
    fn transport(&self) -> TransportKind {
        TransportKind::Http1
    }

    fn validate_request(&self, request: &Request<()>) -> bool {
        request.method() == Method::GET
            && request.version() == self.transport().http_version()
            && header_has_token(request.headers(), UPGRADE, "websocket")
    }

    fn new_negotiation(&self, request: &Request<()>) -> Result<Negotiation> {
        Negotiation::new(TransportKind::Http1, request)
    }

    fn validate_frame_handler(
        &self,
        handler: Option<&Arc<dyn FrameHandler>>,
        response: &mut Response<()>,
    ) -> bool {
        if handler.is_none() {
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return false;
        }
        true
    }

    fn create_websocket_connection(
        &self,
        channel: &HttpChannel,
        session: Arc<CoreSession>,
    ) -> Result<WebSocketConnection> {
        WebSocketConnection::new(channel.endpoint(), channel.connector(), session)
    }

    fn prepare_response(
        &self,
        negotiation: &Negotiation,
        response: &mut Response<()>,
    ) -> Result<()> {
        let key = negotiation
            .key()
            .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
        let accept = HeaderValue::from_str(&generate_accept_key(key))
            .map_err(|_| Error::InvalidHttp("invalid Sec-WebSocket-Accept value"))?;

        *response.status_mut() = self.transport().success_status();
        let headers = response.headers_mut();
        headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
        Ok(())
    }
}
