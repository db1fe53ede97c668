//! WebSocket server bridging browsers to tunnels.
//!
//! # Connection Flow
//!
//! 1. Accept TCP connection
//! 2. Upgrade to WebSocket, echoing any requested sub-protocol
//! 3. Ask the [`Connector`] for a tunnel
//! 4. Fire `on_connect` listeners
//! 5. Run the two pumps until the daemon → browser side ends
//! 6. Release handles, close the tunnel, fire `on_disconnect` listeners

// ============================================================================
// Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderMap, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{Instrument, Span, debug, error, field, info, info_span, trace};

use crate::bridge::{self, ConnectionListener};
use crate::error::Result;
use crate::protocol::MAX_GUAC_MESSAGE;
use crate::tunnel::Tunnel;

// ============================================================================
// Constants
// ============================================================================

/// WebSocket read buffer, large enough for one instruction.
const WEBSOCKET_READ_BUFFER_SIZE: usize = MAX_GUAC_MESSAGE;

/// WebSocket write buffer, large enough for one batched flush.
const WEBSOCKET_WRITE_BUFFER_SIZE: usize = MAX_GUAC_MESSAGE * 2;

/// How often the accept loop checks the shutdown flag.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// ConnectRequest
// ============================================================================

/// The upgrade request a connection was opened with.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    /// Address of the browser.
    pub remote_addr: SocketAddr,
    /// Request URI, including the query string.
    pub uri: Uri,
    /// Request headers.
    pub headers: HeaderMap,
}

impl ConnectRequest {
    /// Creates a request with no headers.
    #[must_use]
    pub fn new(remote_addr: SocketAddr, uri: Uri) -> Self {
        Self {
            remote_addr,
            uri,
            headers: HeaderMap::new(),
        }
    }

    /// Returns the query string, or `""`.
    #[inline]
    #[must_use]
    pub fn query(&self) -> &str {
        self.uri.query().unwrap_or_default()
    }
}

// ============================================================================
// Connector
// ============================================================================

/// Opens a tunnel for an upgraded connection.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Tunnel type produced.
    type Tunnel: Tunnel;

    /// Dials the daemon and completes the handshake.
    ///
    /// # Errors
    ///
    /// Any error aborts the connection before listeners fire.
    async fn connect(&self, request: &ConnectRequest) -> Result<Self::Tunnel>;
}

// ============================================================================
// WebsocketServer
// ============================================================================

/// Accepts browser WebSocket connections and bridges each to a tunnel.
///
/// # Example
///
/// ```ignore
/// let sessions = Arc::new(SessionRegistry::new());
/// let server = Arc::new(WebsocketServer::new(connector).listener(sessions.clone()));
///
/// let listener = TcpListener::bind("0.0.0.0:4567").await?;
/// server.serve(listener).await;
/// ```
pub struct WebsocketServer<C> {
    connector: C,
    /// Notified in registration order.
    listeners: Vec<Arc<dyn ConnectionListener>>,
    /// Parent of every per-connection span.
    span: Span,
    shutdown: AtomicBool,
}

impl<C: Connector> WebsocketServer<C> {
    /// Creates a server using `connector` to open tunnels.
    #[must_use]
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            listeners: Vec::new(),
            span: Span::none(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Registers a connect/disconnect listener.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Sets the span every connection span is created under.
    #[must_use]
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Stops the accept loop. Established connections keep running.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Accepts connections until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        if let Ok(addr) = listener.local_addr() {
            info!(parent: &self.span, %addr, "Serving websocket tunnel");
        }

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!(parent: &self.span, "Accept loop shutting down");
                break;
            }

            match timeout(ACCEPT_POLL_INTERVAL, listener.accept()).await {
                Ok(Ok((stream, addr))) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.handle(stream, addr).await;
                    });
                }
                Ok(Err(e)) => {
                    error!(parent: &self.span, error = %e, "Accept failed");
                }
                Err(_) => continue,
            }
        }
    }

    /// Upgrades one TCP connection and bridges it until it ends.
    pub async fn handle(&self, stream: TcpStream, remote_addr: SocketAddr) {
        let span = info_span!(
            parent: &self.span,
            "connection",
            %remote_addr,
            connection_id = field::Empty,
        );

        self.handle_inner(stream, remote_addr).instrument(span).await;
    }

    async fn handle_inner(&self, stream: TcpStream, remote_addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            trace!(error = %e, "Unable to set TCP_NODELAY");
        }

        let mut captured = None;
        let callback = |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
            if let Some(protocol) = request.headers().get(SEC_WEBSOCKET_PROTOCOL) {
                response
                    .headers_mut()
                    .insert(SEC_WEBSOCKET_PROTOCOL, protocol.clone());
            }
            captured = Some((request.uri().clone(), request.headers().clone()));
            Ok(response)
        };

        let mut ws = match accept_hdr_async_with_config(stream, callback, Some(websocket_config())).await {
            Ok(ws) => ws,
            Err(e) => {
                error!(error = %e, "Failed to upgrade websocket");
                return;
            }
        };

        let Some((uri, headers)) = captured else {
            return;
        };
        let request = ConnectRequest {
            remote_addr,
            uri,
            headers,
        };

        trace!("Connecting to tunnel");
        let tunnel = match self.connector.connect(&request).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!(error = %e, "Error creating tunnel");
                if let Err(e) = ws.close(None).await {
                    trace!(error = %e, "Error closing websocket");
                }
                return;
            }
        };

        Span::current().record("connection_id", tunnel.connection_id());
        trace!("Websocket connection established");

        let (sink, stream) = ws.split();
        match bridge::run(tunnel, stream, sink, &request, &self.listeners).await {
            Ok(()) => trace!("Websocket connection closed"),
            Err(e) => debug!(error = %e, "Websocket connection closed with error"),
        }
    }
}

/// Buffer sizing for upgraded connections.
fn websocket_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .read_buffer_size(WEBSOCKET_READ_BUFFER_SIZE)
        .write_buffer_size(WEBSOCKET_WRITE_BUFFER_SIZE)
}

// ============================================================================
// Tests
// ============================================================================
