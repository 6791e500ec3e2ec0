//! Per-Message Deflate Extension (RFC 7692)
//!
//! Parameter negotiation plus pooled compression contexts. Deflaters and
//! inflaters are borrowed from the engine-wide [`DeflaterPool`] and
//! [`InflaterPool`]: an encoder takes one on its first message, keeps it while
//! the context is carried between messages, and hands it back after every
//! message when `no_context_takeover` was negotiated, or when dropped.

use std::sync::Arc;

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::trace;

use crate::error::{Error, Result};
use crate::extension::ExtensionConfig;
use crate::pool::{PoolObjects, ResourcePool};

/// Extension token
pub const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Trailer bytes that must be removed after compression and added before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Default LZ77 window size (32KB = 2^15)
pub const DEFAULT_WINDOW_BITS: u8 = 15;

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Smallest window zlib can compress with
const MIN_COMPRESS_WINDOW_BITS: u8 = 9;

/// Default zlib compression level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Safety bound on codec loop iterations
const MAX_ITERATIONS: u32 = 100_000;

/// Pool of raw-deflate compressors at the default window size
pub type DeflaterPool = ResourcePool<DeflaterObjects>;

/// Pool of raw-deflate decompressors at the default window size
pub type InflaterPool = ResourcePool<InflaterObjects>;

/// Builds compressors for [`DeflaterPool`]
#[derive(Debug, Clone, Copy)]
pub struct DeflaterObjects {
    level: u32,
}

impl DeflaterObjects {
    /// Compressors at the given zlib level (0-9)
    pub fn new(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl PoolObjects for DeflaterObjects {
    type Object = Compress;

    fn new_object(&self) -> Compress {
        Compress::new_with_window_bits(Compression::new(self.level), false, DEFAULT_WINDOW_BITS)
    }

    fn reset(&self, compress: &mut Compress) {
        compress.reset();
    }
}

/// Builds decompressors for [`InflaterPool`]
#[derive(Debug, Clone, Copy, Default)]
pub struct InflaterObjects;

impl PoolObjects for InflaterObjects {
    type Object = Decompress;

    fn new_object(&self) -> Decompress {
        // A full-size window inflates streams compressed with any smaller window
        Decompress::new_with_window_bits(false, DEFAULT_WINDOW_BITS)
    }

    fn reset(&self, decompress: &mut Decompress) {
        decompress.reset(false);
    }
}

/// Negotiated permessage-deflate parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeflateConfig {
    /// Server's maximum LZ77 window bits (for compression when server)
    pub server_max_window_bits: u8,
    /// Client's maximum LZ77 window bits (for decompression when server)
    pub client_max_window_bits: u8,
    /// If true, server must reset compression context after each message
    pub server_no_context_takeover: bool,
    /// If true, client must reset compression context after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9, where 0 is no compression, 9 is max)
    pub compression_level: u32,
    /// Minimum message size to compress (smaller messages may not benefit)
    pub compression_threshold: usize,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_max_window_bits: DEFAULT_WINDOW_BITS,
            client_max_window_bits: DEFAULT_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            compression_threshold: 32, // Don't compress tiny messages
        }
    }
}

impl DeflateConfig {
    /// Negotiate a client offer down to the parameters this server accepts
    ///
    /// Returns `Ok(None)` when the offer must be declined (unknown or repeated
    /// parameter, or a window the compressor cannot honor) and an error when a
    /// parameter carries an invalid value.
    pub fn from_params(params: &[(String, Option<String>)]) -> Result<Option<Self>> {
        let mut config = Self::default();
        let mut seen: Vec<String> = Vec::with_capacity(params.len());

        for (name, value) in params {
            let name = name.to_ascii_lowercase();
            if seen.contains(&name) {
                trace!(param = %name, "declining permessage-deflate offer, repeated parameter");
                return Ok(None);
            }
            seen.push(name.clone());

            match name.as_str() {
                "server_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::Negotiation(
                            "server_no_context_takeover must not have a value".into(),
                        ));
                    }
                    config.server_no_context_takeover = true;
                }
                "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(Error::Negotiation(
                            "client_no_context_takeover must not have a value".into(),
                        ));
                    }
                    config.client_no_context_takeover = true;
                }
                "server_max_window_bits" => {
                    let bits = parse_window_bits(&name, value.as_deref())?.ok_or_else(|| {
                        Error::Negotiation("server_max_window_bits requires a value".into())
                    })?;
                    if bits < MIN_COMPRESS_WINDOW_BITS {
                        trace!(bits, "declining permessage-deflate offer, window too small");
                        return Ok(None);
                    }
                    config.server_max_window_bits = bits;
                }
                "client_max_window_bits" => {
                    // Without a value the client only indicates support
                    if let Some(bits) = parse_window_bits(&name, value.as_deref())? {
                        config.client_max_window_bits = bits;
                    }
                }
                _ => {
                    trace!(param = %name, "declining permessage-deflate offer, unknown parameter");
                    return Ok(None);
                }
            }
        }

        Ok(Some(config))
    }

    /// The accepted form of this configuration, as written in the response
    ///
    /// Only carries parameters the client offered.
    pub fn to_extension_config(&self) -> ExtensionConfig {
        let mut config = ExtensionConfig::new(PERMESSAGE_DEFLATE);

        if self.server_no_context_takeover {
            config = config.with_param("server_no_context_takeover", None);
        }
        if self.client_no_context_takeover {
            config = config.with_param("client_no_context_takeover", None);
        }
        if self.server_max_window_bits < MAX_WINDOW_BITS {
            config = config.with_param(
                "server_max_window_bits",
                Some(self.server_max_window_bits.to_string()),
            );
        }
        if self.client_max_window_bits < MAX_WINDOW_BITS {
            config = config.with_param(
                "client_max_window_bits",
                Some(self.client_max_window_bits.to_string()),
            );
        }

        config
    }

    /// Generate extension response header value for server
    pub fn to_response_header(&self) -> String {
        self.to_extension_config().to_string()
    }
}

fn parse_window_bits(name: &str, value: Option<&str>) -> Result<Option<u8>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let bits: u8 = value
        .parse()
        .map_err(|_| Error::Negotiation(format!("invalid {} value: {}", name, value)))?;
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) {
        return Err(Error::Negotiation(format!(
            "{} out of range (8-15): {}",
            name, bits
        )));
    }
    Ok(Some(bits))
}

/// Where an encoder's compressor came from
enum Deflater {
    Pooled(Compress),
    Owned(Compress),
}

impl Deflater {
    fn get_mut(&mut self) -> &mut Compress {
        match self {
            Deflater::Pooled(c) | Deflater::Owned(c) => c,
        }
    }
}

/// Deflate compressor for outgoing messages
pub struct DeflateEncoder {
    pool: Arc<DeflaterPool>,
    deflater: Option<Deflater>,
    no_context_takeover: bool,
    window_bits: u8,
    level: u32,
    threshold: usize,
}

impl DeflateEncoder {
    /// Create a new encoder; no compressor is taken until the first message
    pub fn new(
        pool: Arc<DeflaterPool>,
        window_bits: u8,
        no_context_takeover: bool,
        level: u32,
        threshold: usize,
    ) -> Self {
        Self {
            pool,
            deflater: None,
            no_context_takeover,
            window_bits,
            level,
            threshold,
        }
    }

    fn deflater(&mut self) -> &mut Compress {
        let window_bits = self.window_bits;
        let level = self.level;
        let pool = &self.pool;
        self.deflater
            .get_or_insert_with(|| {
                if window_bits == DEFAULT_WINDOW_BITS {
                    Deflater::Pooled(pool.acquire())
                } else {
                    // The pool only holds default-window compressors
                    Deflater::Owned(Compress::new_with_window_bits(
                        Compression::new(level),
                        false,
                        window_bits,
                    ))
                }
            })
            .get_mut()
    }

    /// Whether a compressor is currently held
    pub fn holds_deflater(&self) -> bool {
        self.deflater.is_some()
    }

    /// Compress a message payload
    ///
    /// Returns None if the message is too small to benefit from compression
    /// or if compression would make it larger.
    pub fn compress(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        if data.len() < self.threshold {
            return Ok(None);
        }

        let result = deflate_message(self.deflater(), data);
        if self.no_context_takeover {
            self.end_message();
        }
        let mut output = result?;

        // Per RFC 7692: Remove trailing 0x00 0x00 0xff 0xff
        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        // Only use compression if it actually reduces size
        if output.len() >= data.len() {
            return Ok(None);
        }

        Ok(Some(Bytes::from(output)))
    }

    /// Drop the compression context after a message
    fn end_message(&mut self) {
        match self.deflater.take() {
            Some(Deflater::Pooled(compress)) => self.pool.release(compress),
            Some(Deflater::Owned(mut compress)) => {
                compress.reset();
                self.deflater = Some(Deflater::Owned(compress));
            }
            None => {}
        }
    }

    /// Return the compressor to its pool
    pub fn release(&mut self) {
        if let Some(Deflater::Pooled(compress)) = self.deflater.take() {
            self.pool.release(compress);
        }
    }
}

impl Drop for DeflateEncoder {
    fn drop(&mut self) {
        self.release();
    }
}

fn deflate_message(compress: &mut Compress, data: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(data.len() + 64);
    let start_in = compress.total_in();
    let mut iterations = 0u32;

    loop {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            return Err(Error::Compression(
                "compression took too many iterations".into(),
            ));
        }

        if output.len() == output.capacity() {
            output.reserve(4096);
        }

        let consumed = (compress.total_in() - start_in) as usize;
        compress
            .compress_vec(&data[consumed..], &mut output, FlushCompress::Sync)
            .map_err(|e| Error::Compression(format!("deflate error: {}", e)))?;

        let consumed = (compress.total_in() - start_in) as usize;
        // The sync flush is complete once input is consumed with output space to spare
        if consumed >= data.len() && output.len() < output.capacity() {
            return Ok(output);
        }
    }
}

/// Deflate decompressor for incoming messages
pub struct DeflateDecoder {
    pool: Arc<InflaterPool>,
    inflater: Option<Decompress>,
    no_context_takeover: bool,
}

impl DeflateDecoder {
    /// Create a new decoder; no decompressor is taken until the first message
    pub fn new(pool: Arc<InflaterPool>, no_context_takeover: bool) -> Self {
        Self {
            pool,
            inflater: None,
            no_context_takeover,
        }
    }

    /// Whether a decompressor is currently held
    pub fn holds_inflater(&self) -> bool {
        self.inflater.is_some()
    }

    /// Decompress a message payload
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        let pool = &self.pool;
        let inflater = self.inflater.get_or_insert_with(|| pool.acquire());
        let result = inflate_message(inflater, data, max_size);

        if self.no_context_takeover || result.is_err() {
            self.release();
        }

        result.map(Bytes::from)
    }

    /// Return the decompressor to its pool
    pub fn release(&mut self) {
        self.pool.release(self.inflater.take());
    }
}

impl Drop for DeflateDecoder {
    fn drop(&mut self) {
        self.release();
    }
}

fn inflate_message(decompress: &mut Decompress, data: &[u8], max_size: usize) -> Result<Vec<u8>> {
    // Per RFC 7692: Append 0x00 0x00 0xff 0xff before decompressing
    let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
    input.extend_from_slice(data);
    input.extend_from_slice(&DEFLATE_TRAILER);

    let mut output = Vec::with_capacity(std::cmp::max(1024, data.len() * 4));
    let start_in = decompress.total_in();
    let mut iterations = 0u32;

    loop {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            return Err(Error::Compression(
                "decompression took too many iterations".into(),
            ));
        }

        if output.len() > max_size {
            return Err(Error::MessageTooLarge);
        }

        if output.len() == output.capacity() {
            if output.capacity() >= max_size {
                return Err(Error::MessageTooLarge);
            }
            // At least double or add 4KB, whichever is larger
            output.reserve(std::cmp::max(output.capacity(), 4096));
        }

        let consumed = (decompress.total_in() - start_in) as usize;
        let status = decompress
            .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
            .map_err(|e| Error::Compression(format!("inflate error: {}", e)))?;

        let consumed = (decompress.total_in() - start_in) as usize;
        match status {
            Status::StreamEnd => break,
            Status::Ok | Status::BufError => {
                if consumed >= input.len() && output.len() < output.capacity() {
                    break;
                }
            }
        }
    }

    if output.len() > max_size {
        return Err(Error::MessageTooLarge);
    }

    Ok(output)
}

/// Combined compressor/decompressor context for a server-side connection
pub struct DeflateContext {
    /// Encoder for outgoing messages
    pub encoder: DeflateEncoder,
    /// Decoder for incoming messages
    pub decoder: DeflateDecoder,
    /// Configuration
    pub config: DeflateConfig,
}

impl DeflateContext {
    /// Create context for server role
    pub fn server(
        config: DeflateConfig,
        deflaters: Arc<DeflaterPool>,
        inflaters: Arc<InflaterPool>,
    ) -> Self {
        let encoder = DeflateEncoder::new(
            deflaters,
            config.server_max_window_bits,
            config.server_no_context_takeover,
            config.compression_level,
            config.compression_threshold,
        );
        let decoder = DeflateDecoder::new(inflaters, config.client_no_context_takeover);

        Self {
            encoder,
            decoder,
            config,
        }
    }

    /// Compress a message if beneficial
    pub fn compress(&mut self, data: &[u8]) -> Result<Option<Bytes>> {
        self.encoder.compress(data)
    }

    /// Decompress a message
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes> {
        self.decoder.decompress(data, max_size)
    }

    /// Return both codecs to their pools
    pub fn release(&mut self) {
        self.encoder.release();
        self.decoder.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::INFINITE_CAPACITY;

    fn pools() -> (Arc<DeflaterPool>, Arc<InflaterPool>) {
        (
            Arc::new(DeflaterPool::new(
                INFINITE_CAPACITY,
                DeflaterObjects::new(DEFAULT_COMPRESSION_LEVEL),
            )),
            Arc::new(InflaterPool::new(INFINITE_CAPACITY, InflaterObjects)),
        )
    }

    fn params(list: &[(&str, Option<&str>)]) -> Vec<(String, Option<String>)> {
        list.iter()
            .map(|(n, v)| (n.to_string(), v.map(String::from)))
            .collect()
    }

    #[test]
    fn test_compress_decompress() {
        let (deflaters, inflaters) = pools();
        let mut ctx = DeflateContext::server(DeflateConfig::default(), deflaters, inflaters);

        let original = b"Hello, World! This is a test message that should be compressed.";

        let compressed = ctx.compress(original).unwrap();
        assert!(compressed.is_some());
        let compressed = compressed.unwrap();
        assert!(compressed.len() < original.len());

        let decompressed = ctx.decompress(&compressed, 1024).unwrap();
        assert_eq!(&decompressed[..], &original[..]);
    }

    #[test]
    fn test_small_message_not_compressed() {
        let (deflaters, inflaters) = pools();
        let config = DeflateConfig {
            compression_threshold: 100,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(config, deflaters.clone(), inflaters);

        assert!(ctx.compress(b"tiny").unwrap().is_none());
        // Nothing borrowed for a skipped message
        assert!(!ctx.encoder.holds_deflater());
        assert_eq!(deflaters.idle_count(), 0);
    }

    #[test]
    fn test_context_takeover_keeps_deflater() {
        let (deflaters, inflaters) = pools();
        let config = DeflateConfig {
            compression_threshold: 0,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(config, deflaters.clone(), inflaters);

        let msg = b"Hello, World! Hello, World! Hello, World!";
        let first = ctx.compress(msg).unwrap().unwrap();
        let second = ctx.compress(msg).unwrap().unwrap();

        // The second message references the first through the LZ77 window
        assert!(second.len() <= first.len());
        assert!(ctx.encoder.holds_deflater());
        assert_eq!(deflaters.idle_count(), 0);

        drop(ctx);
        assert_eq!(deflaters.idle_count(), 1);
    }

    #[test]
    fn test_no_context_takeover_returns_deflater() {
        let (deflaters, inflaters) = pools();
        let config = DeflateConfig {
            server_no_context_takeover: true,
            compression_threshold: 0,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(config, deflaters.clone(), inflaters);

        let msg = b"Hello, World! Hello, World! Hello, World!";
        let first = ctx.compress(msg).unwrap().unwrap();
        assert!(!ctx.encoder.holds_deflater());
        assert_eq!(deflaters.idle_count(), 1);

        // A reset compressor from the pool produces identical output
        let second = ctx.compress(msg).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(deflaters.idle_count(), 1);
    }

    #[test]
    fn test_decoder_returns_inflater_without_context_takeover() {
        let (deflaters, inflaters) = pools();
        let config = DeflateConfig {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            compression_threshold: 0,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(config, deflaters, inflaters.clone());

        let msg = b"a message long enough to be worth compressing, compressing, compressing";
        let compressed = ctx.compress(msg).unwrap().unwrap();
        let plain = ctx.decompress(&compressed, 4096).unwrap();
        assert_eq!(&plain[..], &msg[..]);
        assert!(!ctx.decoder.holds_inflater());
        assert_eq!(inflaters.idle_count(), 1);
    }

    #[test]
    fn test_decompress_limit() {
        let (deflaters, inflaters) = pools();
        let config = DeflateConfig {
            compression_threshold: 0,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(config, deflaters, inflaters);

        let big = vec![b'x'; 64 * 1024];
        let compressed = ctx.compress(&big).unwrap().unwrap();
        assert!(matches!(
            ctx.decompress(&compressed, 1024),
            Err(Error::MessageTooLarge)
        ));
    }

    #[test]
    fn test_small_window_uses_owned_compressor() {
        let (deflaters, inflaters) = pools();
        let config = DeflateConfig {
            server_max_window_bits: 10,
            compression_threshold: 0,
            ..Default::default()
        };
        let mut ctx = DeflateContext::server(config, deflaters.clone(), inflaters);

        let msg = b"window window window window window window window";
        let compressed = ctx.compress(msg).unwrap().unwrap();
        let plain = ctx.decompress(&compressed, 1024).unwrap();
        assert_eq!(&plain[..], &msg[..]);

        drop(ctx);
        assert_eq!(deflaters.idle_count(), 0);
    }

    #[test]
    fn test_config_from_params() {
        let config = DeflateConfig::from_params(&params(&[
            ("server_no_context_takeover", None),
            ("client_max_window_bits", Some("12")),
        ]))
        .unwrap()
        .unwrap();
        assert!(config.server_no_context_takeover);
        assert!(!config.client_no_context_takeover);
        assert_eq!(config.client_max_window_bits, 12);
        assert_eq!(config.server_max_window_bits, DEFAULT_WINDOW_BITS);
    }

    #[test]
    fn test_param_names_case_insensitive() {
        let config = DeflateConfig::from_params(&params(&[
            ("Server_No_Context_Takeover", None),
            ("CLIENT_MAX_WINDOW_BITS", Some("11")),
        ]))
        .unwrap()
        .unwrap();
        assert!(config.server_no_context_takeover);
        assert_eq!(config.client_max_window_bits, 11);

        assert_eq!(
            DeflateConfig::from_params(&params(&[
                ("server_no_context_takeover", None),
                ("SERVER_NO_CONTEXT_TAKEOVER", None),
            ]))
            .unwrap(),
            None
        );
    }

    #[test]
    fn test_client_no_context_takeover_does_not_add_server_param() {
        let config = DeflateConfig::from_params(&params(&[("client_no_context_takeover", None)]))
            .unwrap()
            .unwrap();
        assert!(config.client_no_context_takeover);
        assert!(!config.server_no_context_takeover);
        assert_eq!(
            config.to_response_header(),
            "permessage-deflate; client_no_context_takeover"
        );
    }

    #[test]
    fn test_invalid_params() {
        assert!(
            DeflateConfig::from_params(&params(&[("server_max_window_bits", Some("16"))]))
                .is_err()
        );
        assert!(
            DeflateConfig::from_params(&params(&[("client_max_window_bits", Some("abc"))]))
                .is_err()
        );
        assert!(
            DeflateConfig::from_params(&params(&[("server_no_context_takeover", Some("1"))]))
                .is_err()
        );
    }

    #[test]
    fn test_declined_offers() {
        assert_eq!(
            DeflateConfig::from_params(&params(&[("x_custom", None)])).unwrap(),
            None
        );
        assert_eq!(
            DeflateConfig::from_params(&params(&[
                ("server_no_context_takeover", None),
                ("server_no_context_takeover", None),
            ]))
            .unwrap(),
            None
        );
        assert_eq!(
            DeflateConfig::from_params(&params(&[("server_max_window_bits", Some("8"))]))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_response_header() {
        let config = DeflateConfig {
            server_no_context_takeover: true,
            server_max_window_bits: 12,
            ..Default::default()
        };

        let header = config.to_response_header();
        assert_eq!(
            header,
            "permessage-deflate; server_no_context_takeover; server_max_window_bits=12"
        );
    }
}
