//! WebSocket-level connection
//!
//! A [`WebSocketConnection`] is built once per successful handshake, before
//! the upgrade point, and only receives its byte stream when the endpoint
//! installs it. It borrows a read buffer from the connector pool for its
//! whole life and owns the [`CoreSession`] carrying the negotiated extension
//! stack. A connection that never gets installed must be
//! [`abandon`](WebSocketConnection::abandon)ed so both go back.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::alloc::ByteBufferPool;
use crate::channel::{BoxedIo, Connector, EndPoint, Scheduler};
use crate::components::WebSocketComponents;
use crate::error::{CloseReason, Error, Result};
use crate::extension::ExtensionStack;
use crate::negotiation::Negotiation;
use crate::transport::TransportKind;

/// Application callbacks of one connection
///
/// Frame delivery belongs to the frame codec; this seam only covers the
/// connection lifecycle.
pub trait FrameHandler: Send + Sync {
    /// The connection was installed on its endpoint
    fn on_open(&self, _session: &CoreSession) {}

    /// The connection closed
    fn on_closed(&self, _session: &CoreSession, _reason: &CloseReason) {}
}

/// Negotiated state of one connection
pub struct CoreSession {
    transport: TransportKind,
    path: String,
    subprotocol: Option<String>,
    extensions: Mutex<ExtensionStack>,
    handler: Option<Arc<dyn FrameHandler>>,
    max_message_size: usize,
    max_frame_size: usize,
    idle_timeout: Option<Duration>,
}

impl CoreSession {
    /// Session for the values agreed in `negotiation`
    ///
    /// Instantiates the accepted extensions, wiring compression to the
    /// engine pools.
    pub fn new(
        negotiation: &Negotiation,
        handler: Option<Arc<dyn FrameHandler>>,
        components: &WebSocketComponents,
    ) -> Result<Self> {
        let extensions = ExtensionStack::build(negotiation.accepted_extensions(), components)?;
        let config = components.config();

        Ok(Self {
            transport: negotiation.transport(),
            path: negotiation.path().to_string(),
            subprotocol: negotiation.accepted_subprotocol().map(String::from),
            extensions: Mutex::new(extensions),
            handler,
            max_message_size: config.max_message_size,
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout(),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached(transport: TransportKind, components: &WebSocketComponents) -> Self {
        let config = components.config();
        Self {
            transport,
            path: "/".to_string(),
            subprotocol: None,
            extensions: Mutex::new(ExtensionStack::default()),
            handler: None,
            max_message_size: config.max_message_size,
            max_frame_size: config.max_frame_size,
            idle_timeout: config.idle_timeout(),
        }
    }

    /// Transport the handshake ran over
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Request path and query
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Accepted subprotocol
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The negotiated extension stack
    pub fn extensions(&self) -> MutexGuard<'_, ExtensionStack> {
        self.extensions.lock()
    }

    /// Application handler, if one was supplied
    pub fn handler(&self) -> Option<&Arc<dyn FrameHandler>> {
        self.handler.as_ref()
    }

    /// Maximum reassembled message size
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Maximum outgoing frame size, lowered by a negotiated fragment extension
    pub fn max_frame_size(&self) -> usize {
        match self.extensions.lock().max_fragment_length() {
            Some(limit) => limit.min(self.max_frame_size),
            None => self.max_frame_size,
        }
    }

    /// Idle timeout, `None` when disabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    /// Return pooled extension resources
    pub fn release_extensions(&self) {
        self.extensions.lock().release();
    }
}

impl fmt::Debug for CoreSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreSession")
            .field("transport", &self.transport)
            .field("path", &self.path)
            .field("subprotocol", &self.subprotocol)
            .field("extensions", &self.extensions.lock().names())
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// Lifecycle of a [`WebSocketConnection`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Built, not installed yet
    Built,
    /// Installed on its endpoint
    Open,
    /// Closed or abandoned
    Closed,
}

struct ConnectionState {
    status: ConnectionStatus,
    io: Option<BoxedIo>,
    /// Response head still to be written ahead of any frame
    head: Option<Bytes>,
    buffer: Option<BytesMut>,
    idle_task: Option<JoinHandle<()>>,
}

/// A connection speaking the WebSocket protocol
pub struct WebSocketConnection {
    endpoint: Weak<EndPoint>,
    executor: Handle,
    scheduler: Scheduler,
    buffers: Arc<ByteBufferPool>,
    session: Arc<CoreSession>,
    state: Mutex<ConnectionState>,
}

impl WebSocketConnection {
    /// Build a connection for `endpoint` from the connector's resources
    pub fn new(
        endpoint: &Arc<EndPoint>,
        connector: &Connector,
        session: Arc<CoreSession>,
    ) -> Result<Self> {
        if !endpoint.is_open() {
            return Err(Error::ConnectionBuild("endpoint closed".into()));
        }

        let buffers = connector.buffers().clone();
        let buffer = buffers.get();

        Ok(Self {
            endpoint: Arc::downgrade(endpoint),
            executor: connector.executor().clone(),
            scheduler: connector.scheduler().clone(),
            buffers,
            session,
            state: Mutex::new(ConnectionState {
                status: ConnectionStatus::Built,
                io: None,
                head: None,
                buffer: Some(buffer),
                idle_task: None,
            }),
        })
    }

    /// Negotiated session
    pub fn session(&self) -> &Arc<CoreSession> {
        &self.session
    }

    /// Executor for connection tasks
    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    /// Current lifecycle status
    pub fn status(&self) -> ConnectionStatus {
        self.state.lock().status
    }

    /// Whether the connection is installed and not closed
    pub fn is_open(&self) -> bool {
        self.status() == ConnectionStatus::Open
    }

    /// Whether the byte stream is held by this connection
    pub fn has_io(&self) -> bool {
        self.state.lock().io.is_some()
    }

    /// Receive the byte stream at the upgrade point
    pub(crate) fn attach(&self, io: BoxedIo, head: Option<Bytes>) {
        let mut state = self.state.lock();
        state.io = Some(io);
        state.head = head;
    }

    /// Take the byte stream for the frame codec
    ///
    /// Writes the pending response head first, so the stream is positioned at
    /// the first frame.
    pub async fn commit(&self) -> Result<BoxedIo> {
        let (io, head) = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Closed {
                return Err(Error::ConnectionClosed);
            }
            (state.io.take(), state.head.take())
        };

        let mut io = io.ok_or(Error::InvalidState("byte stream already taken"))?;
        if let Some(head) = head {
            io.write_all(&head).await?;
            io.flush().await?;
        }
        Ok(io)
    }

    /// Take the pooled read buffer
    pub fn take_read_buffer(&self) -> Option<BytesMut> {
        self.state.lock().buffer.take()
    }

    /// Give a read buffer back to the connector pool
    pub fn release_read_buffer(&self, buffer: BytesMut) {
        self.buffers.put(buffer);
    }

    /// Called once installed: notify the handler and arm the idle timeout
    pub fn on_upgraded(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if state.status != ConnectionStatus::Built {
                return;
            }
            state.status = ConnectionStatus::Open;
        }

        if let Some(handler) = self.session.handler() {
            handler.on_open(&self.session);
        }
        self.touch();

        debug!(
            transport = %self.session.transport(),
            path = self.session.path(),
            subprotocol = self.session.subprotocol(),
            "websocket connection opened"
        );
    }

    /// Restart the idle timeout after activity
    pub fn touch(self: &Arc<Self>) {
        let Some(timeout) = self.session.idle_timeout() else {
            return;
        };

        let weak = Arc::downgrade(self);
        let task = self.scheduler.schedule(timeout, async move {
            if let Some(connection) = weak.upgrade() {
                debug!(path = connection.session.path(), "idle timeout");
                connection.close(CloseReason::new(CloseReason::GOING_AWAY, "idle timeout"));
            }
        });

        let previous = {
            let mut state = self.state.lock();
            if state.status != ConnectionStatus::Open {
                task.abort();
                return;
            }
            state.idle_task.replace(task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Close the connection and its endpoint
    pub fn close(&self, reason: CloseReason) {
        let (was_open, buffer, idle_task) = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Closed {
                return;
            }
            let was_open = state.status == ConnectionStatus::Open;
            state.status = ConnectionStatus::Closed;
            state.io = None;
            state.head = None;
            (was_open, state.buffer.take(), state.idle_task.take())
        };

        if let Some(task) = idle_task {
            task.abort();
        }
        if let Some(buffer) = buffer {
            self.buffers.put(buffer);
        }
        self.session.release_extensions();

        if was_open {
            if let Some(handler) = self.session.handler() {
                handler.on_closed(&self.session, &reason);
            }
        }
        debug!(code = reason.code, reason = %reason.reason, "websocket connection closed");

        if let Some(endpoint) = self.endpoint.upgrade() {
            endpoint.close();
        }
    }

    /// Release everything a connection that was never installed holds
    ///
    /// The endpoint is left alone so the HTTP layer can still respond.
    pub fn abandon(&self) {
        let (buffer, io) = {
            let mut state = self.state.lock();
            if state.status != ConnectionStatus::Built {
                return;
            }
            state.status = ConnectionStatus::Closed;
            state.head = None;
            (state.buffer.take(), state.io.take())
        };

        if let Some(buffer) = buffer {
            self.buffers.put(buffer);
        }
        drop(io);
        self.session.release_extensions();
        trace!(path = self.session.path(), "websocket connection abandoned");
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Some(buffer) = self.state.get_mut().buffer.take() {
            self.buffers.put(buffer);
        }
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WebSocketConnection")
            .field("status", &state.status)
            .field("has_io", &state.io.is_some())
            .field("session", &self.session)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use http::{Request, Response, StatusCode};
    use tokio::io::AsyncReadExt;

    #[derive(Default)]
    struct Counting {
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    impl FrameHandler for Counting {
        fn on_open(&self, _session: &CoreSession) {
            self.opened.fetch_add(1, Ordering::SeqCst);
        }

        fn on_closed(&self, _session: &CoreSession, reason: &CloseReason) {
            assert_eq!(reason.code, CloseReason::NORMAL);
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn negotiation() -> Negotiation {
        let request = Request::builder()
            .uri("/echo")
            .header("upgrade", "websocket")
            .header("connection", "Upgrade")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("sec-websocket-version", "13")
            .body(())
            .unwrap();
        Negotiation::new(TransportKind::Http1, &request).unwrap()
    }

    struct Fixture {
        endpoint: Arc<EndPoint>,
        connector: Connector,
        client: tokio::io::DuplexStream,
        components: WebSocketComponents,
    }

    fn fixture(config: Config) -> Fixture {
        let (server, client) = tokio::io::duplex(4096);
        let components = WebSocketComponents::new(config);
        Fixture {
            endpoint: Arc::new(EndPoint::new(server)),
            connector: Connector::current(components.buffers().clone()).unwrap(),
            client,
            components,
        }
    }

    fn build(fixture: &Fixture, handler: Option<Arc<dyn FrameHandler>>) -> Arc<WebSocketConnection> {
        let session = CoreSession::new(&negotiation(), handler, &fixture.components).unwrap();
        Arc::new(
            WebSocketConnection::new(&fixture.endpoint, &fixture.connector, Arc::new(session))
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_abandon_returns_buffer() {
        let fixture = fixture(Config::default());
        let connection = build(&fixture, None);
        assert_eq!(fixture.components.buffers().cached(), 0);

        connection.abandon();
        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert_eq!(fixture.components.buffers().cached(), 1);
        assert!(fixture.endpoint.is_open());
        assert!(fixture.endpoint.take_http_io().is_some());
    }

    #[tokio::test]
    async fn test_dropped_connection_returns_buffer() {
        let fixture = fixture(Config::default());
        drop(build(&fixture, None));
        assert_eq!(fixture.components.buffers().cached(), 1);
    }

    #[tokio::test]
    async fn test_build_on_closed_endpoint_fails() {
        let fixture = fixture(Config::default());
        fixture.endpoint.close();

        let session = CoreSession::new(&negotiation(), None, &fixture.components).unwrap();
        let result =
            WebSocketConnection::new(&fixture.endpoint, &fixture.connector, Arc::new(session));
        assert!(matches!(result, Err(Error::ConnectionBuild(_))));
    }

    #[tokio::test]
    async fn test_commit_writes_response_head() {
        let mut fixture = fixture(Config::default());
        let connection = build(&fixture, None);

        let mut response = Response::new(());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response
            .headers_mut()
            .insert("upgrade", http::HeaderValue::from_static("websocket"));
        fixture.endpoint.upgrade(&connection, &response).unwrap();
        connection.on_upgraded();

        let mut io = connection.commit().await.unwrap();
        io.write_all(b"frames").await.unwrap();

        let mut received = vec![0u8; 128];
        let mut len = 0;
        while !received[..len].ends_with(b"frames") {
            len += fixture.client.read(&mut received[len..]).await.unwrap();
        }
        let text = String::from_utf8_lossy(&received[..len]);
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("upgrade: websocket\r\n"));
        assert!(text.ends_with("\r\n\r\nframes"));

        assert!(matches!(
            connection.commit().await,
            Err(Error::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_handler_callbacks() {
        let fixture = fixture(Config::default());
        let handler = Arc::new(Counting::default());
        let connection = build(&fixture, Some(handler.clone()));

        fixture
            .endpoint
            .upgrade(&connection, &Response::new(()))
            .unwrap();
        connection.on_upgraded();
        connection.on_upgraded();
        assert_eq!(handler.opened.load(Ordering::SeqCst), 1);

        connection.close(CloseReason::new(CloseReason::NORMAL, "bye"));
        connection.close(CloseReason::new(CloseReason::NORMAL, "again"));
        assert_eq!(handler.closed.load(Ordering::SeqCst), 1);
        assert!(!fixture.endpoint.is_open());
        assert_eq!(fixture.components.buffers().cached(), 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes_connection() {
        let fixture = fixture(Config::builder().idle_timeout(1).build());
        let connection = build(&fixture, None);
        fixture
            .endpoint
            .upgrade(&connection, &Response::new(()))
            .unwrap();
        connection.on_upgraded();
        assert!(connection.is_open());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(connection.status(), ConnectionStatus::Closed);
        assert!(!fixture.endpoint.is_open());
    }

    #[tokio::test]
    async fn test_idle_timeout_disabled() {
        let fixture = fixture(Config::builder().idle_timeout(0).build());
        let connection = build(&fixture, None);
        fixture
            .endpoint
            .upgrade(&connection, &Response::new(()))
            .unwrap();
        connection.on_upgraded();
        assert!(connection.state.lock().idle_task.is_none());
    }
}
