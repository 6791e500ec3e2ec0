//! WebSocket extensions: offers, the registry, and the negotiated stack
//!
//! A client offers extensions in `Sec-WebSocket-Extensions` as an ordered list
//! of `name; param; param=value` elements. The server accepts a narrowed subset;
//! accepted order defines the order the stack applies to outgoing payloads
//! (and the reverse for incoming ones).

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use http::HeaderMap;
use http::header::SEC_WEBSOCKET_EXTENSIONS;

use crate::components::WebSocketComponents;
use crate::error::{Error, Result};

#[cfg(feature = "permessage-deflate")]
use crate::deflate::{DeflateConfig, DeflateContext, PERMESSAGE_DEFLATE};

/// Extension token of the pass-through extension
pub const IDENTITY: &str = "identity";

/// Extension token of the outgoing fragmentation extension
pub const FRAGMENT: &str = "fragment";

/// One element of a `Sec-WebSocket-Extensions` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionConfig {
    name: String,
    params: Vec<(String, Option<String>)>,
}

impl ExtensionConfig {
    /// An extension without parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter
    pub fn with_param(mut self, name: impl Into<String>, value: Option<String>) -> Self {
        self.params.push((name.into(), value));
        self
    }

    /// Extension token
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters in offer order
    pub fn params(&self) -> &[(String, Option<String>)] {
        &self.params
    }

    /// Look up a parameter: `None` if absent, `Some(None)` if present without a value
    pub fn param(&self, name: &str) -> Option<Option<&str>> {
        self.params
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_deref())
    }

    /// Parse a single `name; param; param=value` element
    pub fn parse(element: &str) -> Result<Self> {
        let mut parts = element.split(';');
        let name = parts.next().unwrap_or_default().trim();
        if !is_token(name) {
            return Err(Error::InvalidHttp("malformed extension name"));
        }

        let mut config = ExtensionConfig::new(name.to_ascii_lowercase());
        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            match part.split_once('=') {
                Some((key, value)) => {
                    let key = key.trim();
                    let value = unquote(value.trim())?;
                    if !is_token(key) || !is_token(value) {
                        return Err(Error::InvalidHttp("malformed extension parameter"));
                    }
                    config.params.push((key.to_string(), Some(value.to_string())));
                }
                None => {
                    if !is_token(part) {
                        return Err(Error::InvalidHttp("malformed extension parameter"));
                    }
                    config.params.push((part.to_string(), None));
                }
            }
        }

        Ok(config)
    }

    /// Parse a comma separated extension list; empty elements are skipped
    pub fn parse_list(value: &str) -> Result<Vec<Self>> {
        value
            .split(',')
            .map(str::trim)
            .filter(|element| !element.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Every `Sec-WebSocket-Extensions` header of a request, in order
    pub fn from_headers(headers: &HeaderMap) -> Result<Vec<Self>> {
        let mut offers = Vec::new();
        for value in headers.get_all(SEC_WEBSOCKET_EXTENSIONS) {
            let value = value
                .to_str()
                .map_err(|_| Error::InvalidHttp("invalid Sec-WebSocket-Extensions value"))?;
            offers.extend(Self::parse_list(value)?);
        }
        Ok(offers)
    }

    /// Whether this configuration only narrows `offer`
    ///
    /// Same extension, and every parameter present here was sent in the offer
    /// with a compatible value. A `*_max_window_bits` value may shrink the
    /// offered one; an offered window parameter without a value admits any
    /// valid size. Every other value must match the offer.
    pub fn is_narrowing_of(&self, offer: &ExtensionConfig) -> bool {
        self.name.eq_ignore_ascii_case(&offer.name)
            && self.params.iter().all(|(name, value)| match offer.param(name) {
                None => false,
                Some(offered) if is_window_bits(name) => {
                    narrows_window_bits(value.as_deref(), offered)
                }
                Some(offered) => value.as_deref() == offered,
            })
    }

    /// Render a list as a header value
    pub fn to_header_value(list: &[ExtensionConfig]) -> String {
        list.iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for ExtensionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, "; {}={}", name, value)?,
                None => write!(f, "; {}", name)?,
            }
        }
        Ok(())
    }
}

fn is_window_bits(name: &str) -> bool {
    name.eq_ignore_ascii_case("server_max_window_bits")
        || name.eq_ignore_ascii_case("client_max_window_bits")
}

fn narrows_window_bits(accepted: Option<&str>, offered: Option<&str>) -> bool {
    let bits = |value: &str| value.parse::<u8>().ok().filter(|b| (8..=15).contains(b));
    match (accepted, offered) {
        (None, offered) => offered.is_none(),
        (Some(accepted), None) => bits(accepted).is_some(),
        (Some(accepted), Some(offered)) => match (bits(accepted), bits(offered)) {
            (Some(accepted), Some(offered)) => accepted <= offered,
            _ => false,
        },
    }
}

fn unquote(value: &str) -> Result<&str> {
    if let Some(inner) = value.strip_prefix('"') {
        return inner
            .strip_suffix('"')
            .ok_or(Error::InvalidHttp("unterminated quoted extension value"));
    }
    Ok(value)
}

/// RFC 7230 token
fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'!' | b'#'
                        | b'$'
                        | b'%'
                        | b'&'
                        | b'\''
                        | b'*'
                        | b'+'
                        | b'-'
                        | b'.'
                        | b'^'
                        | b'_'
                        | b'`'
                        | b'|'
                        | b'~'
                )
        })
}

/// The extensions this engine can instantiate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtensionKind {
    /// RFC 7692 permessage-deflate
    #[cfg(feature = "permessage-deflate")]
    PerMessageDeflate,
    /// Pass-through, accepts any parameters
    Identity,
    /// Splits outgoing payloads at `maxLength` bytes
    Fragment,
}

impl ExtensionKind {
    /// Whether the extension claims the RSV1 frame bit
    pub fn uses_rsv1(&self) -> bool {
        match self {
            #[cfg(feature = "permessage-deflate")]
            ExtensionKind::PerMessageDeflate => true,
            ExtensionKind::Identity | ExtensionKind::Fragment => false,
        }
    }

    /// Narrow a client offer to what the server accepts
    ///
    /// `Ok(None)` declines the offer; an error means the offer carried a value
    /// the server cannot honor.
    pub fn negotiate(&self, offer: &ExtensionConfig) -> Result<Option<ExtensionConfig>> {
        match self {
            #[cfg(feature = "permessage-deflate")]
            ExtensionKind::PerMessageDeflate => Ok(DeflateConfig::from_params(offer.params())?
                .map(|config| config.to_extension_config())),
            ExtensionKind::Identity => Ok(Some(offer.clone())),
            ExtensionKind::Fragment => {
                if offer
                    .params()
                    .iter()
                    .any(|(n, _)| !n.eq_ignore_ascii_case("maxLength"))
                {
                    return Ok(None);
                }
                if let Some(value) = offer.param("maxLength") {
                    parse_max_length(value)?;
                }
                Ok(Some(offer.clone()))
            }
        }
    }
}

fn parse_max_length(value: Option<&str>) -> Result<usize> {
    value
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|len| *len > 0)
        .ok_or_else(|| Error::Negotiation("fragment maxLength must be a positive integer".into()))
}

/// Registry of supported extensions, keyed by token
#[derive(Debug, Clone)]
pub struct ExtensionRegistry {
    kinds: HashMap<String, ExtensionKind>,
}

impl ExtensionRegistry {
    /// A registry with nothing registered
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// Register an extension under a token
    pub fn register(&mut self, name: impl Into<String>, kind: ExtensionKind) {
        self.kinds.insert(name.into().to_ascii_lowercase(), kind);
    }

    /// Remove a token
    pub fn unregister(&mut self, name: &str) -> Option<ExtensionKind> {
        self.kinds.remove(&name.to_ascii_lowercase())
    }

    /// Lookup by token
    pub fn get(&self, name: &str) -> Option<ExtensionKind> {
        self.kinds.get(&name.to_ascii_lowercase()).copied()
    }

    /// Whether a token is registered
    pub fn is_available(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Registered tokens, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        #[cfg(feature = "permessage-deflate")]
        registry.register(PERMESSAGE_DEFLATE, ExtensionKind::PerMessageDeflate);
        registry.register(IDENTITY, ExtensionKind::Identity);
        registry.register(FRAGMENT, ExtensionKind::Fragment);
        registry
    }
}

/// An instantiated extension
pub enum Extension {
    /// Compression context with pooled codecs
    #[cfg(feature = "permessage-deflate")]
    PerMessageDeflate(Box<DeflateContext>),
    /// Pass-through
    Identity,
    /// Outgoing fragmentation limit
    Fragment {
        /// Largest payload per fragment, `None` if unlimited
        max_length: Option<usize>,
    },
}

impl fmt::Debug for Extension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            #[cfg(feature = "permessage-deflate")]
            Extension::PerMessageDeflate(ctx) => f
                .debug_tuple("PerMessageDeflate")
                .field(&ctx.config)
                .finish(),
            Extension::Identity => write!(f, "Identity"),
            Extension::Fragment { max_length } => f
                .debug_struct("Fragment")
                .field("max_length", max_length)
                .finish(),
        }
    }
}

/// A message payload passing through the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Payload bytes
    pub data: Bytes,
    /// RSV1 bit: set when the payload is compressed
    pub rsv1: bool,
}

impl Payload {
    /// An uncompressed payload
    pub fn plain(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            rsv1: false,
        }
    }
}

/// The ordered extension stack of one connection
///
/// Stored as an explicit sequence; outgoing payloads pass through it in
/// accepted order, incoming payloads in reverse.
#[derive(Debug, Default)]
pub struct ExtensionStack {
    configs: Vec<ExtensionConfig>,
    extensions: Vec<Extension>,
}

impl ExtensionStack {
    /// Instantiate the accepted extensions, wiring compression to the engine pools
    pub fn build(accepted: &[ExtensionConfig], components: &WebSocketComponents) -> Result<Self> {
        let mut extensions = Vec::with_capacity(accepted.len());

        for config in accepted {
            let kind = components.extensions().get(config.name()).ok_or_else(|| {
                Error::ConnectionBuild(format!("extension not registered: {}", config.name()))
            })?;

            let extension = match kind {
                #[cfg(feature = "permessage-deflate")]
                ExtensionKind::PerMessageDeflate => {
                    let mut deflate = DeflateConfig::from_params(config.params())?.ok_or_else(
                        || Error::ConnectionBuild("permessage-deflate parameters declined".into()),
                    )?;
                    deflate.compression_level = components.config().compression_level;
                    Extension::PerMessageDeflate(Box::new(DeflateContext::server(
                        deflate,
                        components.deflaters().clone(),
                        components.inflaters().clone(),
                    )))
                }
                ExtensionKind::Identity => Extension::Identity,
                ExtensionKind::Fragment => Extension::Fragment {
                    max_length: config.param("maxLength").map(parse_max_length).transpose()?,
                },
            };
            extensions.push(extension);
        }

        Ok(Self {
            configs: accepted.to_vec(),
            extensions,
        })
    }

    /// Accepted configurations in stack order
    pub fn configs(&self) -> &[ExtensionConfig] {
        &self.configs
    }

    /// Instantiated extensions in stack order
    pub fn extensions(&self) -> &[Extension] {
        &self.extensions
    }

    /// Extension tokens in stack order
    pub fn names(&self) -> Vec<&str> {
        self.configs.iter().map(ExtensionConfig::name).collect()
    }

    /// Number of extensions
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Whether no extension was negotiated
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }

    /// Smallest fragment limit in the stack
    pub fn max_fragment_length(&self) -> Option<usize> {
        self.extensions
            .iter()
            .filter_map(|e| match e {
                Extension::Fragment { max_length } => *max_length,
                _ => None,
            })
            .min()
    }

    /// Transform an outgoing message payload
    pub fn outgoing(&mut self, mut payload: Payload) -> Result<Payload> {
        for extension in &mut self.extensions {
            match extension {
                #[cfg(feature = "permessage-deflate")]
                Extension::PerMessageDeflate(ctx) => {
                    if !payload.rsv1 {
                        if let Some(compressed) = ctx.compress(&payload.data)? {
                            payload = Payload {
                                data: compressed,
                                rsv1: true,
                            };
                        }
                    }
                }
                Extension::Identity | Extension::Fragment { .. } => {}
            }
        }
        Ok(payload)
    }

    /// Transform an incoming message payload
    pub fn incoming(&mut self, mut payload: Payload, max_size: usize) -> Result<Payload> {
        for extension in self.extensions.iter_mut().rev() {
            match extension {
                #[cfg(feature = "permessage-deflate")]
                Extension::PerMessageDeflate(ctx) => {
                    if payload.rsv1 {
                        payload = Payload::plain(ctx.decompress(&payload.data, max_size)?);
                    }
                }
                Extension::Identity | Extension::Fragment { .. } => {}
            }
        }

        if payload.rsv1 {
            return Err(Error::Compression(
                "RSV1 set without a negotiated extension".into(),
            ));
        }
        if payload.data.len() > max_size {
            return Err(Error::MessageTooLarge);
        }
        Ok(payload)
    }

    /// Return every pooled resource held by the stack
    pub fn release(&mut self) {
        #[cfg(feature = "permessage-deflate")]
        for extension in &mut self.extensions {
            if let Extension::PerMessageDeflate(ctx) = extension {
                ctx.release();
            }
        }
    }
}
