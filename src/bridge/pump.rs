//! The two data pumps of a bridged connection.
//!
//! | Pump | Direction | Ends on |
//! |------|-----------|---------|
//! | [`transport_to_tunnel`] | Browser → Daemon | transport read error, tunnel write error |
//! | [`tunnel_to_transport`] | Daemon → Browser | tunnel read error, transport write error |
//!
//! Both drop anything carrying the reserved internal opcode. Neither retries.

// ============================================================================
// Imports
// ============================================================================

use tracing::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{MAX_GUAC_MESSAGE, is_internal};
use crate::tunnel::{InstructionRead, InstructionWrite};

use super::{MessageRead, MessageWrite};

// ============================================================================
// Browser → Daemon
// ============================================================================

/// Forwards transport messages verbatim to the tunnel writer.
///
/// Returns `Ok(())` when the browser closed the transport cleanly.
///
/// # Errors
///
/// The transport read error or tunnel write error that ended the pump.
pub async fn transport_to_tunnel<R, W>(transport: &mut R, tunnel: &mut W) -> Result<()>
where
    R: MessageRead + ?Sized,
    W: InstructionWrite + ?Sized,
{
    loop {
        let data = match transport.read_message().await {
            Ok(data) => data,
            Err(Error::TransportClosed) => {
                debug!("[Browser -> guacd] Browser closed the connection");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "[Browser -> guacd] Browser disconnected or error reading from WebSocket");
                return Err(e);
            }
        };

        if is_internal(&data) {
            trace!(bytes = data.len(), "[Browser -> guacd] Dropped internal message");
            continue;
        }

        if let Err(e) = tunnel.write_raw(&data).await {
            error!(error = %e, "[Browser -> guacd] Failed to write to guacd (guacd may have disconnected)");
            return Err(e);
        }
    }
}

// ============================================================================
// Daemon → Browser
// ============================================================================

/// Forwards tunnel instructions to the transport in batches.
///
/// Instructions are accumulated while more complete ones are already
/// buffered by the reader; the batch is sent as one message as soon as the
/// reader has nothing more ready or the batch reaches [`MAX_GUAC_MESSAGE`].
///
/// Returns `Ok(())` when the transport was already closed cleanly.
///
/// # Errors
///
/// The tunnel read error or transport write error that ended the pump.
pub async fn tunnel_to_transport<R, W>(tunnel: &mut R, transport: &mut W) -> Result<()>
where
    R: InstructionRead + ?Sized,
    W: MessageWrite + ?Sized,
{
    let mut batch = Vec::with_capacity(MAX_GUAC_MESSAGE * 2);

    loop {
        let instruction = match tunnel.read_some().await {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(error = %e, "[guacd -> Browser] guacd disconnected or error reading from guacd");
                return Err(e);
            }
        };

        if is_internal(instruction) {
            trace!(bytes = instruction.len(), "[guacd -> Browser] Dropped internal instruction");
        } else {
            batch.extend_from_slice(instruction);
        }

        if batch.is_empty() || (tunnel.available() && batch.len() < MAX_GUAC_MESSAGE) {
            continue;
        }

        match transport.write_message(&batch).await {
            Ok(()) => trace!(bytes = batch.len(), "[guacd -> Browser] Flushed batch"),
            Err(Error::TransportClosed) => {
                debug!("[guacd -> Browser] websocket already closed (clean close)");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "[guacd -> Browser] Failed to write to WebSocket (browser may have disconnected)");
                return Err(e);
            }
        }
        batch.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;

    use async_trait::async_trait;

    /// Tunnel reader replaying pre-buffered instructions.
    struct Buffered {
        queue: VecDeque<Vec<u8>>,
        current: Vec<u8>,
    }

    impl Buffered {
        fn new<I: IntoIterator<Item = &'static [u8]>>(items: I) -> Self {
            Self {
                queue: items.into_iter().map(<[u8]>::to_vec).collect(),
                current: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl InstructionRead for Buffered {
        async fn read_some(&mut self) -> Result<&[u8]> {
            self.current = self
                .queue
                .pop_front()
                .ok_or_else(|| Error::connection("daemon closed the connection"))?;
            Ok(&self.current)
        }

        fn available(&self) -> bool {
            !self.queue.is_empty()
        }
    }

    #[derive(Default)]
    struct Recorder {
        written: Vec<Vec<u8>>,
        closed: bool,
    }

    #[async_trait]
    impl InstructionWrite for Recorder {
        async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
            self.written.push(data.to_vec());
            Ok(())
        }
    }

    #[async_trait]
    impl MessageWrite for Recorder {
        async fn write_message(&mut self, data: &[u8]) -> Result<()> {
            if self.closed {
                return Err(Error::TransportClosed);
            }
            self.written.push(data.to_vec());
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed = true;
            Ok(())
        }
    }

    struct Messages(VecDeque<Result<Vec<u8>>>);

    #[async_trait]
    impl MessageRead for Messages {
        async fn read_message(&mut self) -> Result<Vec<u8>> {
            self.0.pop_front().unwrap_or(Err(Error::TransportClosed))
        }
    }

    #[tokio::test]
    async fn test_batches_everything_already_buffered() {
        let mut reader = Buffered::new([&b"3.nop;"[..], b"4.sync,1.1;", b"4.sync,1.2;"]);
        let mut transport = Recorder::default();

        let err = tunnel_to_transport(&mut reader, &mut transport)
            .await
            .unwrap_err();

        assert!(err.is_connection_error());
        assert_eq!(transport.written, [b"3.nop;4.sync,1.1;4.sync,1.2;".to_vec()]);
    }

    #[tokio::test]
    async fn test_flushes_when_cap_reached() {
        let big: &'static [u8] = Box::leak(vec![b'x'; MAX_GUAC_MESSAGE].into_boxed_slice());
        let mut reader = Buffered::new([big, &b"3.nop;"[..]]);
        let mut transport = Recorder::default();

        let _ = tunnel_to_transport(&mut reader, &mut transport).await;

        assert_eq!(transport.written.len(), 2);
        assert_eq!(transport.written[0].len(), MAX_GUAC_MESSAGE);
        assert_eq!(transport.written[1], b"3.nop;");
    }

    #[tokio::test]
    async fn test_outbound_drops_internal_instructions() {
        let mut reader = Buffered::new([&b"4.sync,1.1;"[..], b"0.,4.ping;", b"3.nop;"]);
        let mut transport = Recorder::default();

        let _ = tunnel_to_transport(&mut reader, &mut transport).await;

        assert_eq!(transport.written, [b"4.sync,1.1;3.nop;".to_vec()]);
    }

    #[tokio::test]
    async fn test_trailing_internal_instruction_still_flushes_batch() {
        let mut reader = Buffered::new([&b"4.sync,1.1;"[..], b"0.,4.ping;"]);
        let mut transport = Recorder::default();

        let _ = tunnel_to_transport(&mut reader, &mut transport).await;

        assert_eq!(transport.written, [b"4.sync,1.1;".to_vec()]);
    }

    #[tokio::test]
    async fn test_outbound_clean_close_is_ok() {
        let mut reader = Buffered::new([&b"3.nop;"[..]]);
        let mut transport = Recorder {
            closed: true,
            ..Recorder::default()
        };

        tunnel_to_transport(&mut reader, &mut transport)
            .await
            .expect("clean close");
    }

    #[tokio::test]
    async fn test_inbound_forwards_and_filters() {
        let mut transport = Messages(VecDeque::from([
            Ok(b"5.mouse,1.1,1.2,1.0;".to_vec()),
            Ok(b"0.,4.ping,13.1700000000000;".to_vec()),
            Ok(b"3.key,5.65307,1.1;".to_vec()),
        ]));
        let mut tunnel = Recorder::default();

        transport_to_tunnel(&mut transport, &mut tunnel)
            .await
            .expect("clean close");

        assert_eq!(
            tunnel.written,
            [
                b"5.mouse,1.1,1.2,1.0;".to_vec(),
                b"3.key,5.65307,1.1;".to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_inbound_stops_on_read_error() {
        let mut transport = Messages(VecDeque::from([
            Err(Error::connection("reset")),
            Ok(b"3.nop;".to_vec()),
        ]));
        let mut tunnel = Recorder::default();

        let err = transport_to_tunnel(&mut transport, &mut tunnel)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connection { .. }));
        assert!(tunnel.written.is_empty());
    }
}
