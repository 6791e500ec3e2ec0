//! # Sockudo-Upgrade: WebSocket handshake negotiation
//!
//! The connection-establishment layer of a WebSocket engine embedded in an
//! HTTP server. It turns an inbound HTTP request into a WebSocket connection:
//!
//! - **RFC 6455**: `GET` + `Upgrade: websocket` over HTTP/1.1, answered with 101
//! - **RFC 8441**: extended `CONNECT` with `:protocol = websocket` over HTTP/2, answered with 200
//!
//! Both transports run the same handshake driver ([`server::WebSocketServer`]),
//! which validates the request, negotiates subprotocol and extensions, asks the
//! application for a frame handler, builds the connection and atomically swaps
//! it onto the endpoint. Compression codecs used by the negotiated
//! `permessage-deflate` extension are lent from bounded [`pool::ResourcePool`]s.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sockudo_upgrade::prelude::*;
//!
//! let components = Arc::new(WebSocketComponents::new(Config::default()).subprotocols(["chat"]));
//! let mapping = PathMapping::new().route("/chat", Arc::new(ChatHandler));
//! let server = WebSocketServer::new(components.clone(), mapping);
//!
//! let connector = Connector::current(components.buffers().clone())?;
//! let channel = HttpChannel::new(connector, Arc::new(EndPoint::new(tcp_stream)));
//!
//! match server.upgrade(&request, &mut response, &channel).await? {
//!     HandshakeOutcome::Upgraded(connection) => {
//!         let io = connection.commit().await?;
//!         // hand `io` to the frame codec
//!     }
//!     HandshakeOutcome::Rejected { status, .. } => {
//!         // send `response` as an ordinary HTTP response
//!     }
//! }
//! ```

use std::time::Duration;

pub mod alloc;
pub mod channel;
pub mod components;
pub mod connection;
pub mod error;
pub mod extension;
pub mod handshake;
pub mod negotiation;
pub mod pool;
pub mod server;
pub mod transport;

#[cfg(feature = "permessage-deflate")]
pub mod deflate;

#[cfg(feature = "http2")]
pub mod http2;

pub use channel::{Connector, EndPoint, HttpChannel, Scheduler};
pub use components::WebSocketComponents;
pub use connection::{CoreSession, FrameHandler, WebSocketConnection};
pub use error::{CloseReason, Error, Result};
pub use negotiation::{DefaultNegotiator, Negotiation, Negotiator};
pub use pool::{PoolObjects, ResourcePool};
pub use server::{HandshakeOutcome, HandshakeState, Handshaker, WebSocketServer};
pub use transport::TransportKind;

#[cfg(feature = "permessage-deflate")]
pub use deflate::{DeflateConfig, DeflateContext};

/// WebSocket GUID for handshake
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// The only WebSocket protocol version this engine speaks
pub const WS_VERSION: &str = "13";

/// HTTP/2 configuration (RFC 8441)
#[cfg(feature = "http2")]
#[derive(Debug, Clone)]
pub struct Http2Config {
    /// Initial stream-level flow control window size (default: 1MB)
    pub initial_stream_window_size: u32,
    /// Initial connection-level flow control window size (default: 2MB)
    pub initial_connection_window_size: u32,
    /// Maximum concurrent streams per connection (default: 100)
    pub max_concurrent_streams: u32,
    /// Advertise SETTINGS_ENABLE_CONNECT_PROTOCOL (default: true)
    pub enable_connect_protocol: bool,
}

#[cfg(feature = "http2")]
impl Default for Http2Config {
    fn default() -> Self {
        Self {
            initial_stream_window_size: 1024 * 1024,         // 1MB
            initial_connection_window_size: 2 * 1024 * 1024, // 2MB
            max_concurrent_streams: 100,
            enable_connect_protocol: true,
        }
    }
}

/// Configuration for the WebSocket engine
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use sockudo_upgrade::Config;
///
/// let config = Config::builder()
///     .max_message_size(16 * 1024)
///     .idle_timeout(10)
///     .handshake_timeout(Duration::from_secs(5))
///     .allowed_origins(["https://example.com"])
///     .deflater_pool_capacity(32)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum message size (default: 64MB)
    pub max_message_size: usize,
    /// Maximum frame size (default: 16MB)
    pub max_frame_size: usize,
    /// Idle timeout in seconds (default: 120, 0 = disabled)
    pub idle_timeout: u32,
    /// Upper bound on the application handler lookup (default: 30s)
    pub handshake_timeout: Duration,
    /// Accepted `Origin` values; empty accepts any origin
    pub allowed_origins: Vec<String>,
    /// Deflate compression level, 0-9 (default: 6)
    pub compression_level: u32,
    /// Idle compressors kept for reuse (default: -1, unbounded)
    pub deflater_pool_capacity: isize,
    /// Idle decompressors kept for reuse (default: -1, unbounded)
    pub inflater_pool_capacity: isize,
    /// Size of connector read buffers (default: 4KB)
    pub buffer_size: usize,
    /// Idle read buffers kept for reuse (default: 64)
    pub buffer_pool_capacity: isize,

    /// HTTP/2 configuration (requires `http2` feature)
    #[cfg(feature = "http2")]
    pub http2: Http2Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024,
            max_frame_size: 16 * 1024 * 1024,
            idle_timeout: 120,
            handshake_timeout: Duration::from_secs(30),
            allowed_origins: Vec::new(),
            compression_level: 6,
            deflater_pool_capacity: pool::INFINITE_CAPACITY,
            inflater_pool_capacity: pool::INFINITE_CAPACITY,
            buffer_size: alloc::DEFAULT_BUFFER_SIZE,
            buffer_pool_capacity: alloc::DEFAULT_MAX_CACHED,
            #[cfg(feature = "http2")]
            http2: Http2Config::default(),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Idle timeout as a duration, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(u64::from(self.idle_timeout)))
    }

    /// Whether an `Origin` value passes the origin policy
    pub fn is_origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        origin.is_some_and(|origin| {
            self.allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
        })
    }
}

/// Builder for engine configuration
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set maximum message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set idle timeout in seconds
    /// Set to 0 to disable
    pub fn idle_timeout(mut self, seconds: u32) -> Self {
        self.config.idle_timeout = seconds;
        self
    }

    /// Bound the application handler lookup
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Only accept handshakes from these origins
    pub fn allowed_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.allowed_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    /// Set deflate compression level (clamped to 0-9)
    pub fn compression_level(mut self, level: u32) -> Self {
        self.config.compression_level = level.min(9);
        self
    }

    /// Set compressor pool capacity (0 disables pooling, negative is unbounded)
    pub fn deflater_pool_capacity(mut self, capacity: isize) -> Self {
        self.config.deflater_pool_capacity = capacity;
        self
    }

    /// Set decompressor pool capacity (0 disables pooling, negative is unbounded)
    pub fn inflater_pool_capacity(mut self, capacity: isize) -> Self {
        self.config.inflater_pool_capacity = capacity;
        self
    }

    /// Set read buffer size and how many idle buffers are kept
    pub fn buffer_pool(mut self, buffer_size: usize, capacity: isize) -> Self {
        self.config.buffer_size = buffer_size;
        self.config.buffer_pool_capacity = capacity;
        self
    }

    // ========================================================================
    // HTTP/2 Configuration Methods
    // ========================================================================

    /// Set HTTP/2 initial stream window size
    #[cfg(feature = "http2")]
    pub fn http2_stream_window_size(mut self, size: u32) -> Self {
        self.config.http2.initial_stream_window_size = size;
        self
    }

    /// Set HTTP/2 initial connection window size
    #[cfg(feature = "http2")]
    pub fn http2_connection_window_size(mut self, size: u32) -> Self {
        self.config.http2.initial_connection_window_size = size;
        self
    }

    /// Set HTTP/2 maximum concurrent streams
    #[cfg(feature = "http2")]
    pub fn http2_max_streams(mut self, count: u32) -> Self {
        self.config.http2.max_concurrent_streams = count;
        self
    }

    /// Enable or disable HTTP/2 Extended CONNECT protocol (RFC 8441)
    #[cfg(feature = "http2")]
    pub fn http2_enable_connect_protocol(mut self, enabled: bool) -> Self {
        self.config.http2.enable_connect_protocol = enabled;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::Config;
    pub use crate::channel::{Connector, EndPoint, HttpChannel};
    pub use crate::components::WebSocketComponents;
    pub use crate::connection::{FrameHandler, WebSocketConnection};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::negotiation::{Negotiation, Negotiator};
    pub use crate::server::{HandshakeOutcome, PathMapping, WebSocketServer};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.idle_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.deflater_pool_capacity, -1);
        assert_eq!(config.buffer_size, 4096);
        assert!(config.is_origin_allowed(None));
    }

    #[test]
    fn test_config_builder() {
        let config = Config::builder()
            .idle_timeout(0)
            .compression_level(42)
            .allowed_origins(["https://example.com"])
            .build();

        assert_eq!(config.idle_timeout(), None);
        assert_eq!(config.compression_level, 9);
        assert!(config.is_origin_allowed(Some("https://EXAMPLE.com")));
        assert!(!config.is_origin_allowed(Some("https://evil.example")));
        assert!(!config.is_origin_allowed(None));
    }
}
