//! HTTP/2 Extended CONNECT handshake (RFC 8441)
//!
//! # Protocol Differences from HTTP/1.1
//!
//! - Uses CONNECT method instead of GET
//! - `:protocol = websocket` pseudo-header indicates WebSocket upgrade
//! - No `Upgrade`, `Connection` headers (HTTP/2 doesn't use them)
//! - No `Sec-WebSocket-Key`/`Accept`
//! - Success is 200, not 101, and the connection runs over the stream tunnel

use std::sync::Arc;

use h2::ext::Protocol;
use http::{Method, Request, Response, StatusCode};

use crate::Http2Config;
use crate::channel::HttpChannel;
use crate::connection::{CoreSession, FrameHandler, WebSocketConnection};
use crate::error::{Error, Result};
use crate::negotiation::Negotiation;
use crate::server::Handshaker;
use crate::transport::TransportKind;

/// h2 server builder for the configured settings
///
/// Advertises SETTINGS_ENABLE_CONNECT_PROTOCOL unless disabled.
pub fn server_builder(config: &Http2Config) -> h2::server::Builder {
    let mut builder = h2::server::Builder::new();
    builder
        .initial_window_size(config.initial_stream_window_size)
        .initial_connection_window_size(config.initial_connection_window_size)
        .max_concurrent_streams(config.max_concurrent_streams);

    if config.enable_connect_protocol {
        builder.enable_connect_protocol();
    }
    builder
}

/// HTTP/2 extended CONNECT handshaker
#[derive(Debug, Clone, Copy, Default)]
pub struct Rfc8441Handshaker;

impl Handshaker for Rfc8441Handshaker {
    fn transport(&self) -> TransportKind {
        TransportKind::Http2
    }

    fn validate_request(&self, request: &Request<()>) -> bool {
        request.method() == Method::CONNECT
            && request.version() == self.transport().http_version()
            && request
                .extensions()
                .get::<Protocol>()
                .is_some_and(|protocol| protocol.as_str().eq_ignore_ascii_case("websocket"))
    }

    fn new_negotiation(&self, request: &Request<()>) -> Result<Negotiation> {
        Negotiation::new(TransportKind::Http2, request)
    }

    /// Sets 503 when no handler was found, but always returns `true`
    ///
    /// The stream cannot recover locally either way; the status left on the
    /// response is what rejects the handshake.
    fn validate_frame_handler(
        &self,
        handler: Option<&Arc<dyn FrameHandler>>,
        response: &mut Response<()>,
    ) -> bool {
        if handler.is_none() {
            *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        }
        true
    }

    fn create_websocket_connection(
        &self,
        channel: &HttpChannel,
        session: Arc<CoreSession>,
    ) -> Result<WebSocketConnection> {
        if !channel.endpoint().is_tunnel() {
            return Err(Error::ConnectionBuild(
                "extended CONNECT requires an HTTP/2 stream tunnel".into(),
            ));
        }
        WebSocketConnection::new(channel.endpoint(), channel.connector(), session)
    }

    fn prepare_response(
        &self,
        _negotiation: &Negotiation,
        response: &mut Response<()>,
    ) -> Result<()> {
        *response.status_mut() = self.transport().success_status();
        Ok(())
    }
}
