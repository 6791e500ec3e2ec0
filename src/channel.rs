//! Connector and endpoint collaborators
//!
//! A [`Connector`] hands every connection built on it the same executor,
//! scheduler and buffer pool. An [`EndPoint`] owns the byte channel of one
//! HTTP exchange and is the place where the HTTP-level connection is swapped
//! for a [`WebSocketConnection`]. The swap happens under the endpoint lock,
//! so the byte channel is reachable either by the HTTP layer or by the
//! WebSocket connection, never both.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::Response;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::alloc::ByteBufferPool;
use crate::connection::WebSocketConnection;
use crate::error::{CloseReason, Error, Result};
use crate::handshake::encode_response_head;

#[cfg(feature = "http2")]
use crate::http2::Http2Stream;

/// A bidirectional byte stream usable as a connection transport
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AsyncReadWrite for T {}

/// Type-erased byte stream
pub type BoxedIo = Box<dyn AsyncReadWrite>;

/// Runs delayed tasks on a runtime
#[derive(Debug, Clone)]
pub struct Scheduler {
    handle: Handle,
}

impl Scheduler {
    /// Scheduler backed by a runtime handle
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Run `task` after `delay`
    pub fn schedule<F>(&self, delay: Duration, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }
}

/// Connector-scoped resources shared by every connection it accepts
#[derive(Debug, Clone)]
pub struct Connector {
    executor: Handle,
    scheduler: Scheduler,
    buffers: Arc<ByteBufferPool>,
}

impl Connector {
    /// Connector whose scheduler runs on the executor
    pub fn new(executor: Handle, buffers: Arc<ByteBufferPool>) -> Self {
        Self {
            scheduler: Scheduler::new(executor.clone()),
            executor,
            buffers,
        }
    }

    /// Connector on the current tokio runtime
    pub fn current(buffers: Arc<ByteBufferPool>) -> Result<Self> {
        let executor = Handle::try_current()
            .map_err(|e| Error::Configuration(format!("no tokio runtime: {}", e)))?;
        Ok(Self::new(executor, buffers))
    }

    /// Replace the scheduler
    pub fn with_scheduler(mut self, scheduler: Scheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Executor for connection tasks
    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    /// Scheduler for timeouts
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Buffer pool for connection I/O
    pub fn buffers(&self) -> &Arc<ByteBufferPool> {
        &self.buffers
    }
}

/// The byte channel of an endpoint while it still speaks HTTP
pub enum HttpIo {
    /// A connection-level stream (TCP/TLS)
    Stream(BoxedIo),
    /// An HTTP/2 extended CONNECT stream
    #[cfg(feature = "http2")]
    Tunnel(Http2Stream),
}

impl fmt::Debug for HttpIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpIo::Stream(_) => f.write_str("Stream"),
            #[cfg(feature = "http2")]
            HttpIo::Tunnel(stream) => f.debug_tuple("Tunnel").field(stream).finish(),
        }
    }
}

/// Connection object installed on an endpoint
enum Installed {
    Http,
    WebSocket(Arc<WebSocketConnection>),
    Closed,
}

struct EndPointState {
    installed: Installed,
    io: Option<HttpIo>,
}

/// Underlying byte endpoint of one HTTP exchange
pub struct EndPoint {
    state: Mutex<EndPointState>,
    tunnel: bool,
    closed: watch::Sender<bool>,
}

impl EndPoint {
    /// Endpoint over a connection-level byte stream
    pub fn new<S: AsyncReadWrite>(io: S) -> Self {
        Self::with_io(HttpIo::Stream(Box::new(io)), false)
    }

    /// Endpoint over the tunnel of an HTTP/2 CONNECT stream
    #[cfg(feature = "http2")]
    pub fn tunnel(stream: Http2Stream) -> Self {
        Self::with_io(HttpIo::Tunnel(stream), true)
    }

    fn with_io(io: HttpIo, tunnel: bool) -> Self {
        Self {
            state: Mutex::new(EndPointState {
                installed: Installed::Http,
                io: Some(io),
            }),
            tunnel,
            closed: watch::channel(false).0,
        }
    }

    /// Whether this endpoint tunnels through an HTTP/2 stream
    pub fn is_tunnel(&self) -> bool {
        self.tunnel
    }

    /// Whether the endpoint is still open
    pub fn is_open(&self) -> bool {
        !matches!(self.state.lock().installed, Installed::Closed)
    }

    /// Whether a WebSocket connection is installed
    pub fn is_upgraded(&self) -> bool {
        matches!(self.state.lock().installed, Installed::WebSocket(_))
    }

    /// The installed WebSocket connection
    pub fn connection(&self) -> Option<Arc<WebSocketConnection>> {
        match &self.state.lock().installed {
            Installed::WebSocket(connection) => Some(connection.clone()),
            _ => None,
        }
    }

    /// Take the byte channel to complete an ordinary HTTP response
    ///
    /// Only possible while no WebSocket connection is installed.
    pub fn take_http_io(&self) -> Option<HttpIo> {
        let mut state = self.state.lock();
        match state.installed {
            Installed::Http => state.io.take(),
            _ => None,
        }
    }

    /// Atomically replace the HTTP connection with `connection`
    ///
    /// The byte channel moves into the connection together with the pending
    /// response: an HTTP/1.1 response head is queued on the connection, an
    /// HTTP/2 response is sent on the stream.
    pub fn upgrade(
        &self,
        connection: &Arc<WebSocketConnection>,
        response: &Response<()>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        match state.installed {
            Installed::Http => {}
            Installed::WebSocket(_) => return Err(Error::InvalidState("endpoint already upgraded")),
            Installed::Closed => return Err(Error::ConnectionClosed),
        }

        let io = state
            .io
            .take()
            .ok_or(Error::InvalidState("byte channel taken by the HTTP layer"))?;

        match io {
            HttpIo::Stream(stream) => {
                connection.attach(stream, Some(encode_response_head(response)));
            }
            #[cfg(feature = "http2")]
            HttpIo::Tunnel(mut stream) => {
                if let Err(e) = stream.send_response(copy_response(response)) {
                    state.installed = Installed::Closed;
                    drop(state);
                    self.closed.send_replace(true);
                    return Err(e.into());
                }
                connection.attach(Box::new(stream), None);
            }
        }

        state.installed = Installed::WebSocket(connection.clone());
        trace!(tunnel = self.tunnel, "websocket connection installed");
        Ok(())
    }

    /// Close the endpoint
    ///
    /// Drops the byte channel, closes an installed connection and wakes
    /// everything waiting in [`closed`](Self::closed).
    pub fn close(&self) {
        let previous = {
            let mut state = self.state.lock();
            if matches!(state.installed, Installed::Closed) {
                return;
            }
            state.io = None;
            std::mem::replace(&mut state.installed, Installed::Closed)
        };

        self.closed.send_replace(true);
        debug!(tunnel = self.tunnel, "endpoint closed");

        if let Installed::WebSocket(connection) = previous {
            connection.close(CloseReason::new(CloseReason::ABNORMAL, "endpoint closed"));
        }
    }

    /// Resolves once the endpoint is closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl fmt::Debug for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        let installed = match state.installed {
            Installed::Http => "http",
            Installed::WebSocket(_) => "websocket",
            Installed::Closed => "closed",
        };
        f.debug_struct("EndPoint")
            .field("installed", &installed)
            .field("tunnel", &self.tunnel)
            .field("has_io", &state.io.is_some())
            .finish()
    }
}

#[cfg(feature = "http2")]
fn copy_response(response: &Response<()>) -> Response<()> {
    let mut copy = Response::new(());
    *copy.status_mut() = response.status();
    *copy.headers_mut() = response.headers().clone();
    copy
}

/// One inbound HTTP exchange: its connector and endpoint
#[derive(Debug, Clone)]
pub struct HttpChannel {
    connector: Connector,
    endpoint: Arc<EndPoint>,
}

impl HttpChannel {
    /// Channel over an endpoint accepted by `connector`
    pub fn new(connector: Connector, endpoint: Arc<EndPoint>) -> Self {
        Self {
            connector,
            endpoint,
        }
    }

    /// The owning connector
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    /// The byte endpoint
    pub fn endpoint(&self) -> &Arc<EndPoint> {
        &self.endpoint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::WebSocketComponents;
    use crate::connection::CoreSession;
    use crate::transport::TransportKind;
    use http::StatusCode;

    fn channel() -> (HttpChannel, tokio::io::DuplexStream) {
        let (server, client) = tokio::io::duplex(1024);
        let buffers = Arc::new(ByteBufferPool::new(256, 4));
        let connector = Connector::current(buffers).unwrap();
        (
            HttpChannel::new(connector, Arc::new(EndPoint::new(server))),
            client,
        )
    }

    fn connection(channel: &HttpChannel) -> Arc<WebSocketConnection> {
        let components = WebSocketComponents::default();
        let session = CoreSession::detached(TransportKind::Http1, &components);
        Arc::new(
            WebSocketConnection::new(
                channel.endpoint(),
                channel.connector(),
                Arc::new(session),
            )
            .unwrap(),
        )
    }

    fn switching_protocols() -> Response<()> {
        let mut response = Response::new(());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        response
    }

    #[test]
    fn test_connector_requires_runtime() {
        let buffers = Arc::new(ByteBufferPool::default());
        assert!(matches!(
            Connector::current(buffers),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_upgrade_moves_io() {
        let (channel, _client) = channel();
        let endpoint = channel.endpoint();
        let connection = connection(&channel);

        endpoint.upgrade(&connection, &switching_protocols()).unwrap();

        assert!(endpoint.is_upgraded());
        assert!(endpoint.take_http_io().is_none());
        assert!(connection.has_io());
        assert!(Arc::ptr_eq(&endpoint.connection().unwrap(), &connection));
    }

    #[tokio::test]
    async fn test_upgrade_twice_rejected() {
        let (channel, _client) = channel();
        let endpoint = channel.endpoint();
        let first = connection(&channel);
        let second = connection(&channel);

        endpoint.upgrade(&first, &switching_protocols()).unwrap();
        assert!(matches!(
            endpoint.upgrade(&second, &switching_protocols()),
            Err(Error::InvalidState(_))
        ));
        assert!(!second.has_io());
    }

    #[tokio::test]
    async fn test_upgrade_after_http_takeover_rejected() {
        let (channel, _client) = channel();
        let endpoint = channel.endpoint();
        let connection = connection(&channel);

        assert!(matches!(endpoint.take_http_io(), Some(HttpIo::Stream(_))));
        assert!(endpoint.upgrade(&connection, &switching_protocols()).is_err());
        assert!(!endpoint.is_upgraded());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_closes_connection() {
        let (channel, _client) = channel();
        let endpoint = channel.endpoint().clone();
        let connection = connection(&channel);
        endpoint.upgrade(&connection, &switching_protocols()).unwrap();
        connection.on_upgraded();

        let waiter = {
            let endpoint = endpoint.clone();
            tokio::spawn(async move { endpoint.closed().await })
        };

        endpoint.close();
        waiter.await.unwrap();

        assert!(!endpoint.is_open());
        assert!(!connection.is_open());
        assert!(endpoint.upgrade(&connection, &switching_protocols()).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_upgrades_install_one() {
        let (channel, _client) = channel();
        let endpoint = channel.endpoint().clone();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let endpoint = endpoint.clone();
            let connection = connection(&channel);
            tasks.push(tokio::spawn(async move {
                endpoint.upgrade(&connection, &switching_protocols()).is_ok()
            }));
        }

        let mut installed = 0;
        for task in tasks {
            if task.await.unwrap() {
                installed += 1;
            }
        }
        assert_eq!(installed, 1);
    }
}
