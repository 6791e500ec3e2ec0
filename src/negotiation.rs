//! Per-handshake capability negotiation
//!
//! A [`Negotiation`] is built from the inbound request of one handshake
//! attempt. It holds what the client requested (subprotocols, extension
//! offers) and what the server accepted, and refuses accepted values that
//! the client did not offer. Writing the agreed values into the response is
//! the caller's job.
//!
//! The engine-wide policy that fills in the accepted values is a
//! [`Negotiator`]; [`DefaultNegotiator`] picks the first requested
//! subprotocol the engine supports and the registered extensions in offer
//! order.

use base64::Engine;
use http::header::{
    CONNECTION, ORIGIN, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION, UPGRADE,
};
use http::{HeaderMap, Method, Request};
use tracing::{debug, trace};

use crate::WS_VERSION;
use crate::components::WebSocketComponents;
use crate::error::{Error, Result};
use crate::extension::ExtensionConfig;
use crate::transport::TransportKind;

/// Capability state of one handshake attempt
#[derive(Debug, Clone)]
pub struct Negotiation {
    transport: TransportKind,
    method: Method,
    path: String,
    upgrade: bool,
    key: Option<String>,
    version: Option<String>,
    origin: Option<String>,
    requested_subprotocols: Vec<String>,
    subprotocol: Option<String>,
    offered_extensions: Vec<ExtensionConfig>,
    extensions: Vec<ExtensionConfig>,
}

impl Negotiation {
    /// Read the negotiation state from a request
    ///
    /// Fails when headers are malformed: an unparsable subprotocol or extension
    /// list, or on HTTP/1.1 a missing `Connection: Upgrade` or an invalid
    /// `Sec-WebSocket-Key`.
    pub fn new<B>(transport: TransportKind, request: &Request<B>) -> Result<Self> {
        let headers = request.headers();

        let upgrade = match transport {
            TransportKind::Http1 => header_has_token(headers, UPGRADE, "websocket"),
            TransportKind::Http2 => connect_protocol(request)
                .is_some_and(|p| p.eq_ignore_ascii_case("websocket")),
        };

        let key = match transport {
            TransportKind::Http1 => {
                if !header_has_token(headers, CONNECTION, "upgrade") {
                    return Err(Error::HandshakeFailed("missing Connection: Upgrade"));
                }
                let key = header_string(headers, SEC_WEBSOCKET_KEY)
                    .ok_or(Error::HandshakeFailed("missing Sec-WebSocket-Key"))?;
                if !is_valid_key(&key) {
                    return Err(Error::HandshakeFailed("invalid Sec-WebSocket-Key"));
                }
                Some(key)
            }
            // CONNECT streams carry no key (RFC 8441 §5)
            TransportKind::Http2 => None,
        };

        let path = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            transport,
            method: request.method().clone(),
            path,
            upgrade,
            key,
            version: header_string(headers, SEC_WEBSOCKET_VERSION),
            origin: header_string(headers, ORIGIN),
            requested_subprotocols: parse_subprotocols(headers)?,
            subprotocol: None,
            offered_extensions: ExtensionConfig::from_headers(headers)?,
            extensions: Vec::new(),
        })
    }

    /// Transport the request arrived on
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Request method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request path and query
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the transport-specific upgrade marker is present
    ///
    /// `Upgrade: websocket` on HTTP/1.1, `:protocol = websocket` on HTTP/2.
    pub fn is_upgrade_request(&self) -> bool {
        self.upgrade
    }

    /// `Sec-WebSocket-Key` (HTTP/1.1 only)
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// `Sec-WebSocket-Version`
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// `Origin`
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Check `Sec-WebSocket-Version`: required on HTTP/1.1, optional on HTTP/2
    pub fn validate_version(&self) -> Result<()> {
        match (self.transport, self.version()) {
            (_, Some(version)) if version.trim() == WS_VERSION => Ok(()),
            (TransportKind::Http2, None) => Ok(()),
            (TransportKind::Http1, None) => {
                Err(Error::HandshakeFailed("missing Sec-WebSocket-Version"))
            }
            (_, Some(_)) => Err(Error::HandshakeFailed("unsupported WebSocket version")),
        }
    }

    /// Subprotocols in client preference order
    pub fn requested_subprotocols(&self) -> &[String] {
        &self.requested_subprotocols
    }

    /// The accepted subprotocol
    pub fn accepted_subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// Accept one of the requested subprotocols
    pub fn set_accepted_subprotocol(&mut self, name: &str) -> Result<()> {
        if !self.requested_subprotocols.iter().any(|s| s == name) {
            return Err(Error::Configuration(format!(
                "subprotocol not requested: {}",
                name
            )));
        }
        self.subprotocol = Some(name.to_string());
        Ok(())
    }

    /// Withdraw the accepted subprotocol
    pub fn clear_accepted_subprotocol(&mut self) {
        self.subprotocol = None;
    }

    /// Extension offers in client order
    pub fn offered_extensions(&self) -> &[ExtensionConfig] {
        &self.offered_extensions
    }

    /// Accepted extensions in stack order
    pub fn accepted_extensions(&self) -> &[ExtensionConfig] {
        &self.extensions
    }

    /// Replace the accepted extensions
    ///
    /// Every entry must narrow one of the offers; otherwise nothing changes.
    pub fn set_accepted_extensions(&mut self, accepted: Vec<ExtensionConfig>) -> Result<()> {
        if let Some(invented) = accepted.iter().find(|config| {
            !self
                .offered_extensions
                .iter()
                .any(|offer| config.is_narrowing_of(offer))
        }) {
            return Err(Error::Configuration(format!(
                "extension not derived from an offer: {}",
                invented
            )));
        }
        self.extensions = accepted;
        Ok(())
    }
}

#[cfg(feature = "http2")]
fn connect_protocol<B>(request: &Request<B>) -> Option<&str> {
    request
        .extensions()
        .get::<h2::ext::Protocol>()
        .map(h2::ext::Protocol::as_str)
}

#[cfg(not(feature = "http2"))]
fn connect_protocol<B>(_request: &Request<B>) -> Option<&str> {
    None
}

fn header_string(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
}

/// Whether any value of a comma separated header contains `token`
pub(crate) fn header_has_token(headers: &HeaderMap, name: http::header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// `Sec-WebSocket-Key` must be base64 of 16 bytes (RFC 6455 §4.1)
fn is_valid_key(key: &str) -> bool {
    base64::engine::general_purpose::STANDARD
        .decode(key)
        .is_ok_and(|bytes| bytes.len() == 16)
}

fn parse_subprotocols(headers: &HeaderMap) -> Result<Vec<String>> {
    let mut protocols = Vec::new();
    for value in headers.get_all(SEC_WEBSOCKET_PROTOCOL) {
        let value = value
            .to_str()
            .map_err(|_| Error::InvalidHttp("invalid Sec-WebSocket-Protocol value"))?;
        for protocol in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if protocol.bytes().any(|b| !b.is_ascii_graphic() || b == b';') {
                return Err(Error::InvalidHttp("malformed Sec-WebSocket-Protocol"));
            }
            if !protocols.iter().any(|p| p == protocol) {
                protocols.push(protocol.to_string());
            }
        }
    }
    Ok(protocols)
}

/// Engine-wide policy that fills in the accepted values of a negotiation
pub trait Negotiator: Send + Sync {
    /// Populate accepted subprotocol and extensions
    ///
    /// An error means the client demanded something that cannot be honored;
    /// the handshake is rejected with 400.
    fn negotiate(
        &self,
        negotiation: &mut Negotiation,
        components: &WebSocketComponents,
    ) -> Result<()>;
}

impl<F> Negotiator for F
where
    F: Fn(&mut Negotiation, &WebSocketComponents) -> Result<()> + Send + Sync,
{
    fn negotiate(
        &self,
        negotiation: &mut Negotiation,
        components: &WebSocketComponents,
    ) -> Result<()> {
        self(negotiation, components)
    }
}

/// Registry-driven negotiation
///
/// - Subprotocol: the first requested one the engine supports
/// - Extensions: registered offers in client order, narrowed by their kind;
///   a token is accepted once, and only one extension may claim RSV1
/// - Unknown extensions and declined offers are dropped silently
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNegotiator;

impl Negotiator for DefaultNegotiator {
    fn negotiate(
        &self,
        negotiation: &mut Negotiation,
        components: &WebSocketComponents,
    ) -> Result<()> {
        if let Some(protocol) = negotiation
            .requested_subprotocols()
            .iter()
            .find(|p| components.supports_subprotocol(p))
            .cloned()
        {
            negotiation.set_accepted_subprotocol(&protocol)?;
        }

        let mut accepted: Vec<ExtensionConfig> = Vec::new();
        let mut rsv1_taken = false;

        for offer in negotiation.offered_extensions() {
            if accepted.iter().any(|a| a.name() == offer.name()) {
                continue;
            }

            let Some(kind) = components.extensions().get(offer.name()) else {
                trace!(extension = offer.name(), "dropping unsupported extension");
                continue;
            };

            if kind.uses_rsv1() && rsv1_taken {
                trace!(extension = offer.name(), "dropping extension, RSV1 already in use");
                continue;
            }

            match kind.negotiate(offer)? {
                Some(config) => {
                    rsv1_taken |= kind.uses_rsv1();
                    accepted.push(config);
                }
                None => {
                    debug!(extension = %offer, "declined extension offer");
                }
            }
        }

        negotiation.set_accepted_extensions(accepted)
    }
}
