//! Tunnel over a single daemon connection.
//!
//! The reader and writer live in slots shared between the tunnel and its
//! handles. A handle leases its half out of the slot for the duration of one
//! operation and puts it back afterwards, so [`SimpleTunnel::close`] can drop
//! both halves even while the handles are held.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::stream::{InstructionReader, InstructionWriter, Stream};

use super::{InstructionRead, InstructionWrite, Tunnel};

// ============================================================================
// Slots
// ============================================================================

/// One half of the daemon connection.
///
/// `io` is `None` while leased for an operation or after close.
struct Slot<T> {
    io: Option<T>,
    closed: bool,
}

impl<T> Slot<T> {
    fn shared(io: T) -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self {
            io: Some(io),
            closed: false,
        }))
    }

    fn close(&mut self) {
        self.closed = true;
        self.io = None;
    }
}

/// Half taken out of its slot; returned on drop unless the slot was closed.
struct Lease<'a, T> {
    slot: &'a Mutex<Slot<T>>,
    io: Option<T>,
}

impl<'a, T> Lease<'a, T> {
    fn take(slot: &'a Mutex<Slot<T>>) -> Result<Self> {
        let io = slot.lock().io.take().ok_or(Error::TunnelClosed)?;
        Ok(Self { slot, io: Some(io) })
    }

    fn io(&mut self) -> Result<&mut T> {
        self.io.as_mut().ok_or(Error::TunnelClosed)
    }
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if !slot.closed {
            slot.io = self.io.take();
        }
    }
}

// ============================================================================
// SimpleTunnel
// ============================================================================

/// Tunnel owning one negotiated [`Stream`].
///
/// # Example
///
/// ```ignore
/// let mut stream = Stream::connect(addr, SOCKET_TIMEOUT).await?;
/// stream.handshake(&config).await?;
/// let tunnel = SimpleTunnel::new(stream)?;
/// ```
pub struct SimpleTunnel<R = OwnedReadHalf, W = OwnedWriteHalf> {
    uuid: Uuid,
    connection_id: String,
    reader: Arc<Mutex<Slot<InstructionReader<R>>>>,
    writer: Arc<Mutex<Slot<InstructionWriter<W>>>>,
    reader_held: AtomicBool,
    writer_held: AtomicBool,
    closed: watch::Sender<bool>,
}

impl<R, W> SimpleTunnel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps a stream that has completed its handshake.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the stream has no connection id yet.
    pub fn new(stream: Stream<R, W>) -> Result<Self> {
        let connection_id = stream
            .connection_id()
            .map(str::to_owned)
            .ok_or_else(|| Error::protocol("stream has not completed a handshake"))?;

        let (reader, writer) = stream.into_parts();
        let (closed, _) = watch::channel(false);
        let uuid = Uuid::new_v4();

        debug!(%uuid, %connection_id, "Tunnel opened");

        Ok(Self {
            uuid,
            connection_id,
            reader: Slot::shared(reader),
            writer: Slot::shared(writer),
            reader_held: AtomicBool::new(false),
            writer_held: AtomicBool::new(false),
            closed,
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed.borrow() {
            return Err(Error::TunnelClosed);
        }
        Ok(())
    }
}

impl<R, W> Tunnel for SimpleTunnel<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    type Reader = TunnelReader<R>;
    type Writer = TunnelWriter<W>;

    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn acquire_reader(&self) -> Result<Self::Reader> {
        self.ensure_open()?;
        if self.reader_held.swap(true, Ordering::AcqRel) {
            return Err(Error::HandleInUse { handle: "reader" });
        }

        Ok(TunnelReader {
            io: Arc::clone(&self.reader),
            current: Vec::new(),
            closed: self.closed.subscribe(),
        })
    }

    fn release_reader(&self, reader: Self::Reader) {
        drop(reader);
        self.reader_held.store(false, Ordering::Release);
    }

    fn acquire_writer(&self) -> Result<Self::Writer> {
        self.ensure_open()?;
        if self.writer_held.swap(true, Ordering::AcqRel) {
            return Err(Error::HandleInUse { handle: "writer" });
        }

        Ok(TunnelWriter {
            io: Arc::clone(&self.writer),
            closed: self.closed.subscribe(),
        })
    }

    fn release_writer(&self, writer: Self::Writer) {
        drop(writer);
        self.writer_held.store(false, Ordering::Release);
    }

    fn close(&self) -> Result<()> {
        if self.closed.send_replace(true) {
            trace!(uuid = %self.uuid, "Tunnel already closed");
            return Ok(());
        }

        // Halves leased by an in-flight operation are dropped when it ends.
        self.reader.lock().close();
        self.writer.lock().close();

        debug!(uuid = %self.uuid, connection_id = %self.connection_id, "Tunnel closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow()
    }
}

// ============================================================================
// Handles
// ============================================================================

/// Exclusive reader of a [`SimpleTunnel`].
pub struct TunnelReader<R> {
    io: Arc<Mutex<Slot<InstructionReader<R>>>>,
    /// Copy of the last instruction returned.
    current: Vec<u8>,
    closed: watch::Receiver<bool>,
}

/// Exclusive writer of a [`SimpleTunnel`].
pub struct TunnelWriter<W> {
    io: Arc<Mutex<Slot<InstructionWriter<W>>>>,
    closed: watch::Receiver<bool>,
}

/// Resolves once the tunnel is closed (or dropped).
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> InstructionRead for TunnelReader<R> {
    async fn read_some(&mut self) -> Result<&[u8]> {
        let mut lease = Lease::take(&self.io)?;
        let inner = lease.io()?;

        let outcome = tokio::select! {
            biased;
            () = wait_closed(&mut self.closed) => Err(Error::TunnelClosed),
            result = inner.read_some() => result.map(|raw| {
                self.current.clear();
                self.current.extend_from_slice(raw);
            }),
        };

        drop(lease);
        outcome.map(|()| self.current.as_slice())
    }

    fn available(&self) -> bool {
        !*self.closed.borrow()
            && self
                .io
                .lock()
                .io
                .as_ref()
                .is_some_and(|reader| reader.available())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> InstructionWrite for TunnelWriter<W> {
    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let mut lease = Lease::take(&self.io)?;
        let inner = lease.io()?;

        let outcome = tokio::select! {
            biased;
            () = wait_closed(&mut self.closed) => Err(Error::TunnelClosed),
            result = inner.write_raw(data) => result,
        };

        drop(lease);
        outcome
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex};
    use tokio::time::timeout;

    use crate::protocol::{HandshakeConfig, Instruction};

    type TestTunnel = SimpleTunnel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;
    type TestStream = Stream<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    const TIMEOUT: Duration = Duration::from_secs(5);

    /// Runs a handshake against an in-memory daemon and returns both ends.
    async fn open_tunnel() -> (TestTunnel, TestStream) {
        let (daemon_io, bridge_io) = duplex(4096);
        let mut daemon = Stream::new(daemon_io, TIMEOUT);
        let mut bridge = Stream::new(bridge_io, TIMEOUT);

        let daemon_side = async {
            daemon.reader_mut().expect_opcode("select").await?;
            daemon
                .writer_mut()
                .write_instruction(&Instruction::new("args", Vec::<String>::new()))
                .await?;
            daemon.reader_mut().expect_opcode("size").await?;
            daemon.reader_mut().expect_opcode("audio").await?;
            daemon.reader_mut().expect_opcode("video").await?;
            daemon.reader_mut().expect_opcode("image").await?;
            daemon.reader_mut().expect_opcode("connect").await?;
            daemon
                .writer_mut()
                .write_instruction(&Instruction::new("ready", ["$id"]))
                .await
        };

        let config = HandshakeConfig::new("vnc");
        let (bridge_result, daemon_result) = tokio::join!(bridge.handshake(&config), daemon_side);
        bridge_result.expect("bridge handshake");
        daemon_result.expect("daemon handshake");

        (SimpleTunnel::new(bridge).expect("tunnel"), daemon)
    }

    /// Asserts the daemon side sees the connection end within 500ms.
    async fn assert_released(daemon: &mut TestStream) {
        let read = timeout(Duration::from_millis(500), daemon.reader_mut().read_some())
            .await
            .map(|result| result.map(<[u8]>::len));
        match read {
            Ok(Err(Error::Connection { .. })) => {}
            other => panic!("daemon connection still open: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_new_requires_handshake() {
        let (_daemon, bridge) = duplex(64);
        let result = SimpleTunnel::new(Stream::new(bridge, TIMEOUT));
        assert!(matches!(result, Err(Error::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_connection_id_and_uuid() {
        let (tunnel, _daemon) = open_tunnel().await;
        assert_eq!(tunnel.connection_id(), "$id");
        assert!(!tunnel.uuid().is_nil());
        assert!(tunnel.is_open());
    }

    #[tokio::test]
    async fn test_acquire_twice_fails() {
        let (tunnel, _daemon) = open_tunnel().await;

        let reader = tunnel.acquire_reader().expect("first reader");
        assert!(matches!(
            tunnel.acquire_reader(),
            Err(Error::HandleInUse { handle: "reader" })
        ));

        tunnel.release_reader(reader);
        assert!(tunnel.acquire_reader().is_ok());

        let _writer = tunnel.acquire_writer().expect("first writer");
        assert!(matches!(
            tunnel.acquire_writer(),
            Err(Error::HandleInUse { handle: "writer" })
        ));
    }

    #[tokio::test]
    async fn test_reader_and_writer_reach_daemon() {
        let (tunnel, mut daemon) = open_tunnel().await;
        let mut reader = tunnel.acquire_reader().expect("reader");
        let mut writer = tunnel.acquire_writer().expect("writer");

        writer.write_raw(b"4.sync,1.5;").await.expect("write");
        let echoed = daemon.reader_mut().read_instruction().await.expect("daemon read");
        assert_eq!(echoed, Instruction::new("sync", ["5"]));

        daemon
            .writer_mut()
            .write_raw(b"3.nop;4.sync,1.6;")
            .await
            .expect("daemon write");
        assert_eq!(reader.read_some().await.expect("read"), b"3.nop;");
        assert!(reader.available());
        assert_eq!(reader.read_some().await.expect("read"), b"4.sync,1.6;");
        assert!(!reader.available());
    }

    #[tokio::test]
    async fn test_released_handle_keeps_buffered_data() {
        let (tunnel, mut daemon) = open_tunnel().await;
        daemon
            .writer_mut()
            .write_raw(b"3.nop;4.sync,1.7;")
            .await
            .expect("daemon write");

        let mut reader = tunnel.acquire_reader().expect("reader");
        assert_eq!(reader.read_some().await.expect("read"), b"3.nop;");
        tunnel.release_reader(reader);

        let mut reader = tunnel.acquire_reader().expect("reader again");
        assert!(reader.available());
        assert_eq!(reader.read_some().await.expect("read"), b"4.sync,1.7;");
    }

    #[tokio::test]
    async fn test_close_interrupts_in_flight_read() {
        let (tunnel, _daemon) = open_tunnel().await;
        let tunnel = Arc::new(tunnel);
        let mut reader = tunnel.acquire_reader().expect("reader");

        let closer = Arc::clone(&tunnel);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close().expect("close");
        });

        let err = reader.read_some().await.unwrap_err();
        assert!(matches!(err, Error::TunnelClosed));
        assert!(!reader.available());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (tunnel, _daemon) = open_tunnel().await;
        let writer = tunnel.acquire_writer().expect("writer");

        tunnel.close().expect("first close");
        tunnel.close().expect("second close");
        assert!(!tunnel.is_open());

        tunnel.release_writer(writer);
        assert!(matches!(tunnel.acquire_writer(), Err(Error::TunnelClosed)));
        assert!(matches!(tunnel.acquire_reader(), Err(Error::TunnelClosed)));
    }

    #[tokio::test]
    async fn test_close_releases_connection() {
        let (tunnel, mut daemon) = open_tunnel().await;
        tunnel.close().expect("close");

        assert_released(&mut daemon).await;
    }

    #[tokio::test]
    async fn test_close_with_held_handles_releases_connection() {
        let (tunnel, mut daemon) = open_tunnel().await;
        let mut reader = tunnel.acquire_reader().expect("reader");
        let mut writer = tunnel.acquire_writer().expect("writer");

        tunnel.close().expect("close");
        assert_released(&mut daemon).await;

        assert!(matches!(reader.read_some().await, Err(Error::TunnelClosed)));
        assert!(matches!(
            writer.write_raw(b"3.nop;").await,
            Err(Error::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_with_held_writer_releases_connection() {
        let (tunnel, mut daemon) = open_tunnel().await;
        let _writer = tunnel.acquire_writer().expect("writer");

        tunnel.close().expect("close");
        assert_released(&mut daemon).await;
    }
}
