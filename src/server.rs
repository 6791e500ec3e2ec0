//! Handshake driver
//!
//! One fixed algorithm for every transport:
//!
//! 1. validate the request for the transport
//! 2. build a [`Negotiation`] (plus version and origin policy)
//! 3. run the engine [`Negotiator`]
//! 4. look up a [`FrameHandler`] through the [`WebSocketMapping`]
//! 5. build the [`WebSocketConnection`]
//! 6. finalize the response
//! 7. swap the connection onto the endpoint
//!
//! The four transport-specific decisions come from a [`Handshaker`]. Every
//! rejection before step 7 leaves the endpoint speaking HTTP with the
//! rejection status set on the response; failures from step 7 on close the
//! endpoint and surface as `Err`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{self, BoxFuture, FutureExt};
use http::header::{SEC_WEBSOCKET_EXTENSIONS, SEC_WEBSOCKET_PROTOCOL, SEC_WEBSOCKET_VERSION};
use http::{HeaderValue, Request, Response, StatusCode, Version};
use tracing::{debug, warn};

use crate::WS_VERSION;
use crate::channel::HttpChannel;
use crate::components::WebSocketComponents;
use crate::connection::{CoreSession, FrameHandler, WebSocketConnection};
use crate::error::{Error, Result};
use crate::extension::ExtensionConfig;
use crate::handshake::Rfc6455Handshaker;
use crate::negotiation::{DefaultNegotiator, Negotiation, Negotiator};
use crate::transport::TransportKind;

#[cfg(feature = "http2")]
use crate::http2::Rfc8441Handshaker;

/// Transport-specific decision points of the handshake
pub trait Handshaker: Send + Sync {
    /// Transport this handshaker serves
    fn transport(&self) -> TransportKind;

    /// Whether the request is an upgrade request for this transport
    fn validate_request(&self, request: &Request<()>) -> bool;

    /// Read the negotiation state from the request
    fn new_negotiation(&self, request: &Request<()>) -> Result<Negotiation>;

    /// React to the handler lookup result
    ///
    /// May set a status on `response`. The driver rejects when this returns
    /// `false` or when it left an error status behind.
    fn validate_frame_handler(
        &self,
        handler: Option<&Arc<dyn FrameHandler>>,
        response: &mut Response<()>,
    ) -> bool;

    /// Build the connection over the channel's endpoint
    fn create_websocket_connection(
        &self,
        channel: &HttpChannel,
        session: Arc<CoreSession>,
    ) -> Result<WebSocketConnection>;

    /// Set the success status and transport headers
    fn prepare_response(&self, negotiation: &Negotiation, response: &mut Response<()>)
    -> Result<()>;
}

static RFC6455: Rfc6455Handshaker = Rfc6455Handshaker;

#[cfg(feature = "http2")]
static RFC8441: Rfc8441Handshaker = Rfc8441Handshaker;

/// Progress of one handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Start,
    RequestValidated,
    Negotiated,
    HandlerObtained,
    HandlerValidated,
    ConnectionBuilt,
    ResponseFinalized,
    Upgraded,
    Rejected,
}

/// Result of a handshake that did not fail after the upgrade point
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The connection is installed on the endpoint
    Upgraded(Arc<WebSocketConnection>),
    /// The request was refused; the response carries `status` and the
    /// endpoint still speaks HTTP
    Rejected {
        /// Last state reached before the rejection
        state: HandshakeState,
        status: StatusCode,
    },
}

impl HandshakeOutcome {
    /// The upgraded connection
    pub fn connection(&self) -> Option<&Arc<WebSocketConnection>> {
        match self {
            HandshakeOutcome::Upgraded(connection) => Some(connection),
            HandshakeOutcome::Rejected { .. } => None,
        }
    }

    /// Whether the handshake was refused
    pub fn is_rejected(&self) -> bool {
        matches!(self, HandshakeOutcome::Rejected { .. })
    }

    /// The handshake state this outcome ended in
    pub fn state(&self) -> HandshakeState {
        match self {
            HandshakeOutcome::Upgraded(_) => HandshakeState::Upgraded,
            HandshakeOutcome::Rejected { .. } => HandshakeState::Rejected,
        }
    }
}

/// Application mapping from a negotiation to its frame handler
///
/// The lookup may suspend; it may also adjust the accepted subprotocol.
pub trait WebSocketMapping: Send + Sync {
    fn frame_handler<'a>(
        &'a self,
        negotiation: &'a mut Negotiation,
    ) -> BoxFuture<'a, Option<Arc<dyn FrameHandler>>>;
}

impl<F, Fut> WebSocketMapping for F
where
    F: Fn(&Negotiation) -> Fut + Send + Sync,
    Fut: Future<Output = Option<Arc<dyn FrameHandler>>> + Send + 'static,
{
    fn frame_handler<'a>(
        &'a self,
        negotiation: &'a mut Negotiation,
    ) -> BoxFuture<'a, Option<Arc<dyn FrameHandler>>> {
        (self)(&*negotiation).boxed()
    }
}

/// Exact path to handler mapping
#[derive(Clone, Default)]
pub struct PathMapping {
    routes: HashMap<String, Arc<dyn FrameHandler>>,
}

impl PathMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `path` (without query) to `handler`
    pub fn route(mut self, path: impl Into<String>, handler: Arc<dyn FrameHandler>) -> Self {
        self.routes.insert(path.into(), handler);
        self
    }

    /// Handler for a request path, ignoring the query
    pub fn get(&self, path: &str) -> Option<&Arc<dyn FrameHandler>> {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        self.routes.get(path)
    }
}

impl WebSocketMapping for PathMapping {
    fn frame_handler<'a>(
        &'a self,
        negotiation: &'a mut Negotiation,
    ) -> BoxFuture<'a, Option<Arc<dyn FrameHandler>>> {
        future::ready(self.get(negotiation.path()).cloned()).boxed()
    }
}

impl fmt::Debug for PathMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathMapping")
            .field("routes", &self.routes.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// WebSocket upgrade server
///
/// Holds the engine components, the negotiation policy and the application
/// mapping; drives one handshake per inbound request.
pub struct WebSocketServer {
    components: Arc<WebSocketComponents>,
    negotiator: Arc<dyn Negotiator>,
    mapping: Arc<dyn WebSocketMapping>,
}

impl WebSocketServer {
    /// Server with the default negotiator
    pub fn new(
        components: Arc<WebSocketComponents>,
        mapping: impl WebSocketMapping + 'static,
    ) -> Self {
        Self {
            components,
            negotiator: Arc::new(DefaultNegotiator),
            mapping: Arc::new(mapping),
        }
    }

    /// Replace the negotiation policy
    pub fn with_negotiator(mut self, negotiator: impl Negotiator + 'static) -> Self {
        self.negotiator = Arc::new(negotiator);
        self
    }

    /// Engine components
    pub fn components(&self) -> &Arc<WebSocketComponents> {
        &self.components
    }

    /// The handshaker serving an HTTP version
    pub fn handshaker(version: Version) -> Option<&'static dyn Handshaker> {
        match TransportKind::from_version(version)? {
            TransportKind::Http1 => Some(&RFC6455),
            #[cfg(feature = "http2")]
            TransportKind::Http2 => Some(&RFC8441),
            #[cfg(not(feature = "http2"))]
            TransportKind::Http2 => None,
        }
    }

    /// Upgrade a request with the handshaker for its HTTP version
    pub async fn upgrade(
        &self,
        request: &Request<()>,
        response: &mut Response<()>,
        channel: &HttpChannel,
    ) -> Result<HandshakeOutcome> {
        match Self::handshaker(request.version()) {
            Some(handshaker) => self.handshake(handshaker, request, response, channel).await,
            None => {
                debug!(version = ?request.version(), "no handshaker for HTTP version");
                Ok(reject(HandshakeState::Start, StatusCode::BAD_REQUEST, response))
            }
        }
    }

    /// Run the handshake with a specific handshaker
    pub async fn handshake(
        &self,
        handshaker: &dyn Handshaker,
        request: &Request<()>,
        response: &mut Response<()>,
        channel: &HttpChannel,
    ) -> Result<HandshakeOutcome> {
        let transport = handshaker.transport();
        let config = self.components.config();

        if !handshaker.validate_request(request) {
            debug!(%transport, "not an upgrade request");
            return Ok(reject(HandshakeState::Start, StatusCode::BAD_REQUEST, response));
        }
        let state = HandshakeState::RequestValidated;

        let mut negotiation = match handshaker.new_negotiation(request) {
            Ok(negotiation) => negotiation,
            Err(e) => {
                debug!(%transport, error = %e, "malformed upgrade request");
                return Ok(reject(state, e.status(), response));
            }
        };

        if let Err(e) = negotiation.validate_version() {
            debug!(%transport, version = negotiation.version(), error = %e, "unsupported version");
            response
                .headers_mut()
                .insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static(WS_VERSION));
            return Ok(reject(state, e.status(), response));
        }

        if !config.is_origin_allowed(negotiation.origin()) {
            debug!(%transport, origin = negotiation.origin(), "origin not allowed");
            return Ok(reject(state, Error::OriginNotAllowed.status(), response));
        }

        if let Err(e) = self.negotiator.negotiate(&mut negotiation, &self.components) {
            debug!(%transport, error = %e, "negotiation failed");
            return Ok(reject(state, e.status(), response));
        }
        let state = HandshakeState::Negotiated;

        let endpoint = channel.endpoint();
        let timeout = config.handshake_timeout;
        let lookup = tokio::time::timeout(timeout, self.mapping.frame_handler(&mut negotiation));
        let handler = tokio::select! {
            biased;
            _ = endpoint.closed() => {
                debug!(%transport, "endpoint closed during handler lookup");
                return Err(Error::ConnectionClosed);
            }
            found = lookup => match found {
                Ok(handler) => handler,
                Err(_) => {
                    debug!(%transport, ?timeout, "handler lookup timed out");
                    None
                }
            },
        };
        let state = HandshakeState::HandlerObtained;

        let valid = handshaker.validate_frame_handler(handler.as_ref(), response);
        let status = response.status();
        let failed = status.is_client_error() || status.is_server_error();
        if !valid || failed {
            let status = if failed {
                status
            } else {
                Error::HandlerUnavailable.status()
            };
            debug!(%transport, path = negotiation.path(), %status, "no frame handler");
            return Ok(reject(state, status, response));
        }
        let state = HandshakeState::HandlerValidated;

        let session = match CoreSession::new(&negotiation, handler, &self.components) {
            Ok(session) => Arc::new(session),
            Err(e) => {
                warn!(%transport, error = %e, "failed to build session");
                return Ok(reject(state, e.status(), response));
            }
        };

        let connection = match handshaker.create_websocket_connection(channel, session) {
            Ok(connection) => Arc::new(connection),
            Err(e) => {
                warn!(%transport, error = %e, "failed to build connection");
                return Ok(reject(state, e.status(), response));
            }
        };
        let state = HandshakeState::ConnectionBuilt;

        let headers = response.headers().clone();
        if let Err(e) = write_negotiated_headers(&negotiation, response)
            .and_then(|()| handshaker.prepare_response(&negotiation, response))
        {
            warn!(%transport, error = %e, "failed to prepare response");
            connection.abandon();
            *response.headers_mut() = headers;
            return Ok(reject(state, e.status(), response));
        }
        let state = HandshakeState::ResponseFinalized;

        if let Err(e) = endpoint.upgrade(&connection, response) {
            warn!(%transport, ?state, error = %e, "upgrade failed");
            connection.abandon();
            if !endpoint.is_upgraded() {
                endpoint.close();
            }
            return Err(e);
        }

        connection.on_upgraded();
        debug!(
            %transport,
            path = negotiation.path(),
            subprotocol = negotiation.accepted_subprotocol(),
            extensions = %ExtensionConfig::to_header_value(negotiation.accepted_extensions()),
            "websocket upgraded"
        );
        Ok(HandshakeOutcome::Upgraded(connection))
    }
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("components", &self.components)
            .finish()
    }
}

fn reject(state: HandshakeState, status: StatusCode, response: &mut Response<()>) -> HandshakeOutcome {
    *response.status_mut() = status;
    HandshakeOutcome::Rejected { state, status }
}

/// Write the agreed subprotocol and extensions
fn write_negotiated_headers(negotiation: &Negotiation, response: &mut Response<()>) -> Result<()> {
    let headers = response.headers_mut();

    if let Some(protocol) = negotiation.accepted_subprotocol() {
        let value = HeaderValue::from_str(protocol)
            .map_err(|_| Error::InvalidHttp("invalid Sec-WebSocket-Protocol value"))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }

    let extensions = negotiation.accepted_extensions();
    if !extensions.is_empty() {
        let value = HeaderValue::from_str(&ExtensionConfig::to_header_value(extensions))
            .map_err(|_| Error::InvalidHttp("invalid Sec-WebSocket-Extensions value"))?;
        headers.insert(SEC_WEBSOCKET_EXTENSIONS, value);
    }

    Ok(())
}
