//! Buffered, timeout-bounded instruction I/O over a daemon connection.
//!
//! # Buffering
//!
//! [`InstructionReader`] owns a fixed buffer of [`MAX_GUAC_MESSAGE`] bytes.
//! Each read pulls whatever the socket has, so one read may deliver several
//! instructions at once; [`InstructionReader::available`] reports whether the
//! next one is already complete without touching the socket.
//!
//! ```text
//!  0        start                 end          MAX_GUAC_MESSAGE
//!  ├─ spent ─┼── unread (framed) ──┼─── free ───┤
//! ```
//!
//! The unread tail is moved to the front only when the free space runs out.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::protocol::{HandshakeConfig, Instruction, InstructionFramer, MAX_GUAC_MESSAGE};
use crate::tunnel::{InstructionRead, InstructionWrite};

// ============================================================================
// Constants
// ============================================================================

/// Default timeout for daemon I/O.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(15);

/// Opcode the daemon uses to reject a request.
const ERROR_OPCODE: &str = "error";

// ============================================================================
// InstructionReader
// ============================================================================

/// Reads one complete instruction at a time from the daemon.
pub struct InstructionReader<R> {
    inner: R,
    buf: Box<[u8]>,
    /// Start of the first unread byte.
    start: usize,
    /// End of valid data.
    end: usize,
    framer: InstructionFramer,
    timeout: Duration,
}

impl<R: AsyncRead + Unpin> InstructionReader<R> {
    /// Creates a reader with the given I/O timeout.
    #[must_use]
    pub fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            buf: vec![0u8; MAX_GUAC_MESSAGE].into_boxed_slice(),
            start: 0,
            end: 0,
            framer: InstructionFramer::new(),
            timeout,
        }
    }

    /// Returns the raw bytes of the next complete instruction, `;` included.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no complete instruction arrives in time
    /// - [`Error::Connection`] if the daemon closed the connection
    /// - [`Error::Framing`] / [`Error::InstructionTooLarge`] on invalid data
    /// - [`Error::Io`] on socket errors
    pub async fn read_some(&mut self) -> Result<&[u8]> {
        loop {
            if let Some(len) = self.framer.scan(&self.buf[self.start..self.end])? {
                let begin = self.start;
                self.start += len;
                if self.start == self.end {
                    self.start = 0;
                    self.end = 0;
                }
                return Ok(&self.buf[begin..begin + len]);
            }

            if self.end == self.buf.len() {
                if self.start == 0 {
                    return Err(Error::instruction_too_large(self.end + 1, MAX_GUAC_MESSAGE));
                }
                self.compact();
            }

            self.fill().await?;
        }
    }

    /// Returns `true` if another complete instruction is already buffered.
    #[must_use]
    pub fn available(&self) -> bool {
        matches!(
            self.framer.clone().scan(&self.buf[self.start..self.end]),
            Ok(Some(_))
        )
    }

    /// Reads and parses the next instruction.
    ///
    /// # Errors
    ///
    /// Same as [`read_some`](Self::read_some), plus [`Error::Framing`] for
    /// elements that are not UTF-8.
    pub async fn read_instruction(&mut self) -> Result<Instruction> {
        let raw = self.read_some().await?;
        Instruction::parse(raw)
    }

    /// Reads the next instruction and requires its opcode to be `expected`.
    ///
    /// # Errors
    ///
    /// - [`Error::Daemon`] if the daemon sent an `error` instruction
    /// - [`Error::UnexpectedOpcode`] for any other opcode
    pub async fn expect_opcode(&mut self, expected: &str) -> Result<Instruction> {
        let instruction = self.read_instruction().await?;

        if instruction.opcode() == expected {
            return Ok(instruction);
        }

        if instruction.opcode() == ERROR_OPCODE {
            let args = instruction.args();
            let message = args.first().cloned().unwrap_or_default();
            let status = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
            return Err(Error::daemon(status, message));
        }

        Err(Error::unexpected_opcode(expected, instruction.opcode()))
    }

    /// Moves the unread tail to the front of the buffer.
    fn compact(&mut self) {
        self.buf.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// Performs one timeout-bounded socket read into the free space.
    async fn fill(&mut self) -> Result<()> {
        let read = timeout(self.timeout, self.inner.read(&mut self.buf[self.end..]))
            .await
            .map_err(|_| Error::timeout("read from daemon", self.timeout.as_millis() as u64))??;

        if read == 0 {
            return Err(Error::connection("daemon closed the connection"));
        }

        trace!(bytes = read, "Read from daemon");
        self.end += read;
        Ok(())
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> InstructionRead for InstructionReader<R> {
    async fn read_some(&mut self) -> Result<&[u8]> {
        InstructionReader::read_some(self).await
    }

    fn available(&self) -> bool {
        InstructionReader::available(self)
    }
}

// ============================================================================
// InstructionWriter
// ============================================================================

/// Writes raw bytes or instructions to the daemon.
pub struct InstructionWriter<W> {
    inner: W,
    timeout: Duration,
}

impl<W: AsyncWrite + Unpin> InstructionWriter<W> {
    /// Creates a writer with the given I/O timeout.
    #[must_use]
    pub fn new(inner: W, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// Writes bytes verbatim.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the write does not complete in time
    /// - [`Error::Io`] on socket errors
    pub async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        let inner = &mut self.inner;
        timeout(self.timeout, async move {
            inner.write_all(data).await?;
            inner.flush().await
        })
        .await
        .map_err(|_| Error::timeout("write to daemon", self.timeout.as_millis() as u64))??;

        Ok(())
    }

    /// Encodes and writes one instruction.
    ///
    /// # Errors
    ///
    /// Same as [`write_raw`](Self::write_raw).
    pub async fn write_instruction(&mut self, instruction: &Instruction) -> Result<()> {
        self.write_raw(&instruction.encode()).await
    }

    /// Shuts down the write direction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the shutdown fails.
    pub async fn shutdown(&mut self) -> Result<()> {
        timeout(self.timeout, self.inner.shutdown())
            .await
            .map_err(|_| Error::timeout("shutdown daemon socket", self.timeout.as_millis() as u64))??;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> InstructionWrite for InstructionWriter<W> {
    async fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        InstructionWriter::write_raw(self, data).await
    }
}

// ============================================================================
// Stream
// ============================================================================

/// A daemon connection split into an instruction reader and writer.
///
/// # Example
///
/// ```ignore
/// use guac_bridge::{HandshakeConfig, SOCKET_TIMEOUT, Stream};
///
/// let mut stream = Stream::connect("127.0.0.1:4822", SOCKET_TIMEOUT).await?;
/// let id = stream.handshake(&HandshakeConfig::new("vnc")).await?;
/// ```
pub struct Stream<R = OwnedReadHalf, W = OwnedWriteHalf> {
    reader: InstructionReader<R>,
    writer: InstructionWriter<W>,
    connection_id: Option<String>,
}

impl Stream {
    /// Dials the daemon over TCP.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if the dial does not complete in time
    /// - [`Error::Connection`] if the daemon is unreachable
    pub async fn connect(addr: impl ToSocketAddrs, io_timeout: Duration) -> Result<Self> {
        let socket = timeout(io_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::timeout("connect to daemon", io_timeout.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("unable to reach daemon: {e}")))?;

        socket.set_nodelay(true)?;
        debug!(peer = ?socket.peer_addr().ok(), "Connected to daemon");

        let (read, write) = socket.into_split();
        Ok(Self::from_parts(read, write, io_timeout))
    }
}

impl<S: AsyncRead + AsyncWrite> Stream<ReadHalf<S>, WriteHalf<S>> {
    /// Wraps any duplex byte stream.
    #[must_use]
    pub fn new(io: S, io_timeout: Duration) -> Self {
        let (read, write) = tokio::io::split(io);
        Self::from_parts(read, write, io_timeout)
    }
}

impl<R, W> Stream<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Builds a stream from separate read and write halves.
    #[must_use]
    pub fn from_parts(read: R, write: W, io_timeout: Duration) -> Self {
        Self {
            reader: InstructionReader::new(read, io_timeout),
            writer: InstructionWriter::new(write, io_timeout),
            connection_id: None,
        }
    }

    /// Negotiates a session and returns the connection id.
    ///
    /// Sends `select`, waits for `args`, answers with the display, media,
    /// timezone and `connect` instructions, then waits for `ready`.
    ///
    /// # Errors
    ///
    /// - [`Error::Daemon`] if the daemon rejects the request
    /// - [`Error::UnexpectedOpcode`] if a step is answered out of order
    /// - [`Error::Protocol`] if `ready` carries no connection id
    /// - any read/write error of the underlying connection
    pub async fn handshake(&mut self, config: &HandshakeConfig) -> Result<String> {
        debug!(select = config.select_arg(), "Starting handshake");
        self.writer
            .write_instruction(&config.select_instruction())
            .await?;

        let args = self.reader.expect_opcode("args").await?;
        trace!(args = ?args.args(), "Daemon requested parameters");

        let mut response = Vec::new();
        for instruction in config.response_instructions(args.args()) {
            instruction.encode_into(&mut response);
        }
        self.writer.write_raw(&response).await?;

        let ready = self.reader.expect_opcode("ready").await?;
        let id = ready
            .into_args()
            .into_iter()
            .next()
            .ok_or_else(|| Error::protocol("no connection id received"))?;

        debug!(connection_id = %id, "Handshake completed");
        self.connection_id = Some(id.clone());
        Ok(id)
    }

    /// Returns the connection id assigned by the last handshake.
    #[inline]
    #[must_use]
    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.as_deref()
    }

    /// Returns the reader.
    #[inline]
    pub fn reader_mut(&mut self) -> &mut InstructionReader<R> {
        &mut self.reader
    }

    /// Returns the writer.
    #[inline]
    pub fn writer_mut(&mut self) -> &mut InstructionWriter<W> {
        &mut self.writer
    }

    /// Splits into reader and writer.
    #[must_use]
    pub fn into_parts(self) -> (InstructionReader<R>, InstructionWriter<W>) {
        (self.reader, self.writer)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::duplex;
    use tokio_test::io::Builder;

    const SHORT: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_read_some_across_partial_reads() {
        let mock = Builder::new()
            .read(b"4.si")
            .read(b"ze,4.1024,")
            .read(b"3.768;")
            .build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let raw = reader.read_some().await.expect("read");
        assert_eq!(raw, b"4.size,4.1024,3.768;");
        assert!(!reader.available());
    }

    #[tokio::test]
    async fn test_available_after_two_buffered() {
        let mock = Builder::new().read(b"3.nop;4.sync,1.0;").build();
        let mut reader = InstructionReader::new(mock, SHORT);

        assert_eq!(reader.read_some().await.expect("first"), b"3.nop;");
        assert!(reader.available());
        assert_eq!(reader.read_some().await.expect("second"), b"4.sync,1.0;");
        assert!(!reader.available());
    }

    #[tokio::test]
    async fn test_available_false_for_partial_tail() {
        let mock = Builder::new().read(b"3.nop;4.sy").build();
        let mut reader = InstructionReader::new(mock, SHORT);

        reader.read_some().await.expect("first");
        assert!(!reader.available());
    }

    #[tokio::test]
    async fn test_read_instruction_parses() {
        let mock = Builder::new().read("4.name,2.é;".as_bytes()).build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let ins = reader.read_instruction().await.expect("read");
        assert_eq!(ins, Instruction::new("name", ["é"]));
    }

    #[tokio::test]
    async fn test_framing_error_surfaces() {
        let mock = Builder::new().read(b"3.nop!").build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let err = reader.read_some().await.unwrap_err();
        assert!(matches!(err, Error::Framing { .. }));
    }

    #[tokio::test]
    async fn test_eof_is_connection_error() {
        let mock = Builder::new().read(b"4.sy").build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let err = reader.read_some().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (_daemon, bridge) = duplex(64);
        let mut reader = InstructionReader::new(bridge, Duration::from_millis(20));

        let err = reader.read_some().await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_compacts_when_buffer_fills() {
        let filler = Instruction::new("blob", ["x".repeat(MAX_GUAC_MESSAGE - 20)]).encode();
        let tail = Instruction::new("blob", ["y".repeat(100)]).encode();
        let mut data = filler.clone();
        data.extend_from_slice(&tail);

        let mock = Builder::new()
            .read(&data[..MAX_GUAC_MESSAGE])
            .read(&data[MAX_GUAC_MESSAGE..])
            .build();
        let mut reader = InstructionReader::new(mock, SHORT);

        assert_eq!(reader.read_some().await.expect("filler"), filler.as_slice());
        assert_eq!(reader.read_some().await.expect("tail"), tail.as_slice());
    }

    #[tokio::test]
    async fn test_oversized_instruction_rejected() {
        let big = Instruction::new("blob", ["z".repeat(MAX_GUAC_MESSAGE)]).encode();
        let mock = Builder::new().read(&big[..MAX_GUAC_MESSAGE]).build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let err = reader.read_some().await.unwrap_err();
        assert!(matches!(err, Error::InstructionTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_expect_opcode_reports_daemon_error() {
        let mock = Builder::new()
            .read(b"5.error,18.Protocol not found,3.519;")
            .build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let err = reader.expect_opcode("args").await.unwrap_err();
        match err {
            Error::Daemon { status, message } => {
                assert_eq!(status, 519);
                assert_eq!(message, "Protocol not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_expect_opcode_mismatch() {
        let mock = Builder::new().read(b"5.ready,1.x;").build();
        let mut reader = InstructionReader::new(mock, SHORT);

        let err = reader.expect_opcode("args").await.unwrap_err();
        assert!(matches!(err, Error::UnexpectedOpcode { .. }));
    }

    #[tokio::test]
    async fn test_write_raw_passes_through() {
        let mock = Builder::new().write(b"4.sync,1.0;").build();
        let mut writer = InstructionWriter::new(mock, SHORT);

        writer.write_raw(b"4.sync,1.0;").await.expect("write");
    }

    #[tokio::test]
    async fn test_shutdown_signals_eof() {
        let (daemon, bridge) = duplex(64);
        let mut daemon = Stream::new(daemon, SHORT);
        let mut bridge = Stream::new(bridge, SHORT);

        bridge.writer_mut().write_raw(b"3.nop;").await.expect("write");
        bridge.writer_mut().shutdown().await.expect("shutdown");

        assert_eq!(daemon.reader_mut().read_some().await.expect("nop"), b"3.nop;");
        let err = daemon.reader_mut().read_some().await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_handshake_orders_connect_args() {
        let (daemon, bridge) = duplex(4096);
        let mut stream = Stream::new(bridge, SHORT);

        let daemon_task = tokio::spawn(async move {
            let mut daemon = Stream::new(daemon, SHORT);

            let select = daemon.reader_mut().expect_opcode("select").await?;
            assert_eq!(select.args(), ["vnc"]);

            daemon
                .writer_mut()
                .write_instruction(&Instruction::new("args", ["VERSION_1_5_0", "hostname", "port"]))
                .await?;

            let mut seen = Vec::new();
            loop {
                let ins = daemon.reader_mut().read_instruction().await?;
                seen.push(ins.opcode().to_owned());
                if ins.opcode() == "connect" {
                    assert_eq!(ins.args(), ["VERSION_1_5_0", "h", "5900"]);
                    break;
                }
            }
            assert_eq!(seen, ["size", "audio", "video", "image", "connect"]);

            daemon
                .writer_mut()
                .write_instruction(&Instruction::new("ready", ["$generated"]))
                .await?;
            Ok::<_, Error>(())
        });

        let config = HandshakeConfig::new("vnc")
            .parameter("port", "5900")
            .parameter("hostname", "h");

        let id = stream.handshake(&config).await.expect("handshake");
        assert_eq!(id, "$generated");
        assert_eq!(stream.connection_id(), Some("$generated"));

        daemon_task.await.expect("join").expect("daemon side");
    }

    #[tokio::test]
    async fn test_handshake_ready_without_id() {
        let mock = Builder::new()
            .write(b"6.select,3.ssh;")
            .read(b"4.args;")
            .write(b"4.size,4.1024,3.768,2.96;5.audio;5.video;5.image;7.connect;")
            .read(b"5.ready;")
            .build();
        let (read, write) = tokio::io::split(mock);
        let mut stream = Stream::from_parts(read, write, SHORT);

        let err = stream.handshake(&HandshakeConfig::new("ssh")).await.unwrap_err();
        assert!(matches!(err, Error::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_handshake_select_rejected_by_daemon() {
        let mock = Builder::new()
            .write(b"6.select,3.ssh;")
            .read(b"5.error,18.Protocol not found,3.519;")
            .build();
        let (read, write) = tokio::io::split(mock);
        let mut stream = Stream::from_parts(read, write, SHORT);

        let err = stream.handshake(&HandshakeConfig::new("ssh")).await.unwrap_err();
        match err {
            Error::Daemon { status, message } => {
                assert_eq!(status, 519);
                assert_eq!(message, "Protocol not found");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(stream.connection_id().is_none());
    }
}
