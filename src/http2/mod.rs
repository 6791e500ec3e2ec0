//! HTTP/2 WebSocket support (RFC 8441)
//!
//! WebSocket bootstrapping over HTTP/2 using the Extended CONNECT Protocol.
//! A server advertises SETTINGS_ENABLE_CONNECT_PROTOCOL ([`server_builder`]);
//! the client opens a stream with `CONNECT` and `:protocol = websocket`; the
//! server answers 200 and the stream becomes the WebSocket byte tunnel.
//!
//! # Server Example
//!
//! ```ignore
//! use sockudo_upgrade::http2::{server_builder, Http2Stream};
//!
//! let mut connection = server_builder(&config.http2).handshake(tls_stream).await?;
//! while let Some(accepted) = connection.accept().await {
//!     let (request, respond) = accepted?;
//!     let (parts, body) = request.into_parts();
//!     let endpoint = Arc::new(EndPoint::tunnel(Http2Stream::new(respond, body)));
//!     let channel = HttpChannel::new(connector.clone(), endpoint);
//!     let mut response = Response::new(());
//!     server.upgrade(&Request::from_parts(parts, ()), &mut response, &channel).await?;
//! }
//! ```

mod handshake;
mod stream;

pub use handshake::{Rfc8441Handshaker, server_builder};
pub use stream::Http2Stream;
