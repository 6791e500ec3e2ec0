//! Engine-wide shared state
//!
//! `WebSocketComponents` is built once per engine from a [`Config`] and shared
//! by reference with every handshake: the extension registry, the supported
//! subprotocols, and the pools that lend compression codecs and I/O buffers.
//! Its lifecycle is the engine's: `stop` drains every pool.

use std::sync::Arc;

use tracing::debug;

use crate::Config;
use crate::alloc::ByteBufferPool;
use crate::extension::ExtensionRegistry;

#[cfg(feature = "permessage-deflate")]
use crate::deflate::{DeflaterObjects, DeflaterPool, InflaterObjects, InflaterPool};

/// Shared configuration and resources of one WebSocket engine
#[derive(Debug)]
pub struct WebSocketComponents {
    config: Config,
    extensions: ExtensionRegistry,
    subprotocols: Vec<String>,
    buffers: Arc<ByteBufferPool>,
    #[cfg(feature = "permessage-deflate")]
    deflaters: Arc<DeflaterPool>,
    #[cfg(feature = "permessage-deflate")]
    inflaters: Arc<InflaterPool>,
}

impl WebSocketComponents {
    /// Components with the default extension registry and no subprotocols
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, ExtensionRegistry::default())
    }

    /// Components with a custom extension registry
    pub fn with_registry(config: Config, extensions: ExtensionRegistry) -> Self {
        Self {
            buffers: Arc::new(ByteBufferPool::new(
                config.buffer_size,
                config.buffer_pool_capacity,
            )),
            #[cfg(feature = "permessage-deflate")]
            deflaters: Arc::new(DeflaterPool::new(
                config.deflater_pool_capacity,
                DeflaterObjects::new(config.compression_level),
            )),
            #[cfg(feature = "permessage-deflate")]
            inflaters: Arc::new(InflaterPool::new(
                config.inflater_pool_capacity,
                InflaterObjects,
            )),
            subprotocols: Vec::new(),
            extensions,
            config,
        }
    }

    /// Set the subprotocols this engine speaks, in server preference order
    pub fn subprotocols<I, S>(mut self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = subprotocols.into_iter().map(Into::into).collect();
        self
    }

    /// Engine configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Extension registry
    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Supported subprotocols
    pub fn supported_subprotocols(&self) -> &[String] {
        &self.subprotocols
    }

    /// Whether a subprotocol is supported (case-sensitive, RFC 6455 §4.1)
    pub fn supports_subprotocol(&self, name: &str) -> bool {
        self.subprotocols.iter().any(|s| s == name)
    }

    /// Default buffer pool for connectors that do not bring their own
    pub fn buffers(&self) -> &Arc<ByteBufferPool> {
        &self.buffers
    }

    /// Compressor pool
    #[cfg(feature = "permessage-deflate")]
    pub fn deflaters(&self) -> &Arc<DeflaterPool> {
        &self.deflaters
    }

    /// Decompressor pool
    #[cfg(feature = "permessage-deflate")]
    pub fn inflaters(&self) -> &Arc<InflaterPool> {
        &self.inflaters
    }

    /// Start (or restart) every pool
    pub fn start(&self) {
        self.buffers.pool().start();
        #[cfg(feature = "permessage-deflate")]
        {
            self.deflaters.start();
            self.inflaters.start();
        }
        debug!("websocket components started");
    }

    /// Drain every pool; later releases destroy their objects
    pub fn stop(&self) {
        self.buffers.pool().stop();
        #[cfg(feature = "permessage-deflate")]
        {
            self.deflaters.stop();
            self.inflaters.stop();
        }
        debug!("websocket components stopped");
    }
}

impl Default for WebSocketComponents {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_capacities_from_config() {
        let config = Config::builder()
            .deflater_pool_capacity(4)
            .inflater_pool_capacity(0)
            .buffer_pool(512, 8)
            .build();
        let components = WebSocketComponents::new(config);

        assert_eq!(components.buffers().buffer_size(), 512);
        assert_eq!(components.buffers().pool().capacity(), 8);
        #[cfg(feature = "permessage-deflate")]
        {
            assert_eq!(components.deflaters().capacity(), 4);
            assert_eq!(components.inflaters().capacity(), 0);
        }
    }

    #[test]
    fn test_subprotocols() {
        let components = WebSocketComponents::default().subprotocols(["chat", "graphql-ws"]);
        assert!(components.supports_subprotocol("chat"));
        assert!(!components.supports_subprotocol("CHAT"));
        assert_eq!(components.supported_subprotocols().len(), 2);
    }

    #[test]
    fn test_stop_drains_pools() {
        let components = WebSocketComponents::default();
        let buffer = components.buffers().get();
        components.buffers().put(buffer);
        assert_eq!(components.buffers().cached(), 1);

        components.stop();
        assert_eq!(components.buffers().cached(), 0);

        let buffer = components.buffers().get();
        components.buffers().put(buffer);
        assert_eq!(components.buffers().cached(), 0);

        components.start();
        let buffer = components.buffers().get();
        components.buffers().put(buffer);
        assert_eq!(components.buffers().cached(), 1);
    }
}
