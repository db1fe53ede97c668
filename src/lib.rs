//! guac-bridge - WebSocket bridge for the guacd remote desktop daemon.
//!
//! This library moves Guacamole protocol instructions between browsers and
//! `guacd`, multiplexing many remote desktop sessions (RDP, VNC, SSH, ...)
//! over ordinary WebSocket connections.
//!
//! # Architecture
//!
//! ```text
//! Browser ◄──WebSocket──► WebsocketServer ──► bridge::run ◄──► Tunnel ◄──TCP──► guacd
//!                               │                                 │
//!                               └── SessionRegistry               └── Stream (codec)
//! ```
//!
//! - **Stream**: timeout-bounded daemon connection speaking the
//!   length-prefixed instruction format
//! - **Tunnel**: owns a negotiated stream, hands out one reader and one
//!   writer at a time
//! - **Bridge**: two pumps, browser → daemon verbatim and daemon → browser
//!   batched
//! - **SessionRegistry**: live tunnel counts per connection id
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use guac_bridge::{
//!     ConnectRequest, Connector, HandshakeConfig, Result, SOCKET_TIMEOUT, SessionRegistry,
//!     SimpleTunnel, Stream, WebsocketServer,
//! };
//!
//! struct Guacd;
//!
//! #[async_trait]
//! impl Connector for Guacd {
//!     type Tunnel = SimpleTunnel;
//!
//!     async fn connect(&self, request: &ConnectRequest) -> Result<SimpleTunnel> {
//!         let mut stream = Stream::connect("127.0.0.1:4822", SOCKET_TIMEOUT).await?;
//!         stream.handshake(&HandshakeConfig::from_query(request.query())).await?;
//!         SimpleTunnel::new(stream)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> std::io::Result<()> {
//!     let sessions = Arc::new(SessionRegistry::new());
//!     let server = Arc::new(WebsocketServer::new(Guacd).listener(sessions));
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:4567").await?;
//!     server.serve(listener).await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`protocol`] | Instruction codec and handshake configuration |
//! | [`stream`] | Timeout-bounded daemon I/O |
//! | [`tunnel`] | Tunnel trait and [`SimpleTunnel`] |
//! | [`bridge`] | Pumps and per-connection orchestration |
//! | [`transport`] | WebSocket server and message capabilities |
//! | [`session`] | [`SessionRegistry`] |
//! | [`config`] | [`ServerConfig`] from the environment |
//! | [`error`] | Error types and [`Result`] alias |
//!
//! # Logging
//!
//! Everything is reported through [`tracing`]. The library never installs a
//! subscriber; pass a parent span with [`WebsocketServer::with_span`] to
//! attach connection logs to your own context.

// ============================================================================
// Modules
// ============================================================================

/// Bridging pumps and connection orchestration.
pub mod bridge;

/// Server configuration.
pub mod config;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Guacamole wire protocol.
///
/// Instruction codec, framing and handshake configuration.
pub mod protocol;

/// Live session bookkeeping.
pub mod session;

/// Daemon connection with instruction-level I/O.
pub mod stream;

/// Browser-facing WebSocket transport.
pub mod transport;

/// Tunnel abstraction over daemon sessions.
pub mod tunnel;

// ============================================================================
// Re-exports
// ============================================================================

// Bridge types
pub use bridge::{ConnectionListener, MessageRead, MessageWrite};

// Configuration types
pub use config::ServerConfig;

// Error types
pub use error::{Error, Result};

// Protocol types
pub use protocol::{HandshakeConfig, Instruction, InstructionFramer, MAX_GUAC_MESSAGE};

// Session types
pub use session::{SessionCount, SessionRegistry};

// Stream types
pub use stream::{InstructionReader, InstructionWriter, SOCKET_TIMEOUT, Stream};

// Transport types
pub use transport::{ConnectRequest, Connector, WebsocketServer};

// Tunnel types
pub use tunnel::{InstructionRead, InstructionWrite, SimpleTunnel, Tunnel};
