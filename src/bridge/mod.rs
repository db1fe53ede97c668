//! Full-duplex bridging between a browser transport and a tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐  read_message   ┌──────────────────────┐  write_raw   ┌────────┐
//! │          │ ──────────────► │ transport_to_tunnel  │ ───────────► │        │
//! │ Browser  │                 │ (spawned task)       │              │ Tunnel │
//! │transport │  write_message  ├──────────────────────┤  read_some   │        │
//! │          │ ◄────────────── │ tunnel_to_transport  │ ◄─────────── │        │
//! └──────────┘    (batched)    │ (accepting task)     │              └────────┘
//!                              └──────────────────────┘
//! ```
//!
//! The connection is finished when the pump on the accepting task returns.
//! Teardown then releases the reader, closes the tunnel and notifies the
//! listeners, no matter which side failed first. It also stops the spawned
//! pump, which drops its writer handle and the browser read half even while
//! the browser is idle.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{Instrument, debug, trace};

use crate::error::Result;
use crate::transport::ConnectRequest;
use crate::tunnel::Tunnel;

// ============================================================================
// Submodules
// ============================================================================

/// Browser → daemon and daemon → browser pumps.
pub mod pump;

// ============================================================================
// Re-exports
// ============================================================================

pub use pump::{transport_to_tunnel, tunnel_to_transport};

// ============================================================================
// Transport Capabilities
// ============================================================================

/// Source of complete browser messages.
#[async_trait]
pub trait MessageRead: Send {
    /// Reads one complete message.
    ///
    /// Returns [`Error::TransportClosed`](crate::Error::TransportClosed)
    /// once the browser has closed the transport.
    async fn read_message(&mut self) -> Result<Vec<u8>>;
}

/// Sink for complete browser messages.
#[async_trait]
pub trait MessageWrite: Send {
    /// Writes one complete message.
    ///
    /// Returns [`Error::TransportClosed`](crate::Error::TransportClosed)
    /// when the transport is already closed.
    async fn write_message(&mut self, data: &[u8]) -> Result<()>;

    /// Closes the transport.
    async fn close(&mut self) -> Result<()>;
}

// ============================================================================
// ConnectionListener
// ============================================================================

/// Hooks fired once per bridged connection.
///
/// Listeners run synchronously on the accepting task, in registration order.
pub trait ConnectionListener: Send + Sync {
    /// Called after the tunnel is established, before any data flows.
    fn on_connect(&self, connection_id: &str, request: &ConnectRequest) {
        let _ = (connection_id, request);
    }

    /// Called once the connection is torn down.
    fn on_disconnect(&self, connection_id: &str, request: &ConnectRequest) {
        let _ = (connection_id, request);
    }
}

// ============================================================================
// Connection Orchestration
// ============================================================================

/// Bridges `transport` and `tunnel` until the daemon → browser pump ends.
///
/// The browser → daemon pump is spawned; it releases its writer handle when
/// it exits or when this connection is torn down.
///
/// # Errors
///
/// - [`Error::HandleInUse`](crate::Error::HandleInUse) if the tunnel's
///   handles are already taken
/// - the error that ended the daemon → browser pump
pub async fn run<T, R, W>(
    tunnel: T,
    mut transport_reader: R,
    mut transport_writer: W,
    request: &ConnectRequest,
    listeners: &[Arc<dyn ConnectionListener>],
) -> Result<()>
where
    T: Tunnel,
    R: MessageRead + 'static,
    W: MessageWrite,
{
    let tunnel = Arc::new(tunnel);
    let connection_id = tunnel.connection_id().to_owned();

    for listener in listeners {
        listener.on_connect(&connection_id, request);
    }

    let (stop, mut stopped) = oneshot::channel::<()>();
    let mut teardown = Teardown {
        tunnel: Arc::clone(&tunnel),
        reader: None,
        connection_id,
        request,
        listeners,
        _stop: stop,
    };

    let mut writer = tunnel.acquire_writer()?;
    let reader = teardown.reader.insert(tunnel.acquire_reader()?);

    let inbound_tunnel = Arc::clone(&tunnel);
    tokio::spawn(
        async move {
            tokio::select! {
                _ = &mut stopped => trace!("Browser -> guacd pump stopped by teardown"),
                _ = transport_to_tunnel(&mut transport_reader, &mut writer) => {}
            }
            drop(transport_reader);
            inbound_tunnel.release_writer(writer);
            trace!("Browser -> guacd pump finished");
        }
        .in_current_span(),
    );

    let result = tunnel_to_transport(reader, &mut transport_writer).await;

    if let Err(e) = transport_writer.close().await {
        trace!(error = %e, "Error closing websocket");
    }

    result
}

/// Guaranteed-on-exit cleanup of one bridged connection.
struct Teardown<'a, T: Tunnel> {
    tunnel: Arc<T>,
    reader: Option<T::Reader>,
    connection_id: String,
    request: &'a ConnectRequest,
    listeners: &'a [Arc<dyn ConnectionListener>],
    /// Dropped last, stopping the browser → daemon pump.
    _stop: oneshot::Sender<()>,
}

impl<T: Tunnel> Drop for Teardown<'_, T> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            self.tunnel.release_reader(reader);
        }

        if let Err(e) = self.tunnel.close() {
            trace!(error = %e, "Error closing tunnel");
        }

        for listener in self.listeners {
            listener.on_disconnect(&self.connection_id, self.request);
        }

        debug!(connection_id = %self.connection_id, "Bridged connection closed");
    }
}

// ============================================================================
// Tests
// ============================================================================
