//! Error types for the guacd bridge.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use guac_bridge::{HandshakeConfig, Result, Stream};
//!
//! async fn example(config: &HandshakeConfig) -> Result<String> {
//!     let mut stream = Stream::connect("127.0.0.1:4822", guac_bridge::SOCKET_TIMEOUT).await?;
//!     stream.handshake(config).await
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Daemon connection | [`Error::Connection`], [`Error::Timeout`], [`Error::TunnelClosed`], [`Error::Io`] |
//! | Framing / protocol | [`Error::Framing`], [`Error::InstructionTooLarge`], [`Error::Protocol`], [`Error::UnexpectedOpcode`], [`Error::Daemon`] |
//! | Tunnel discipline | [`Error::HandleInUse`] |
//! | Transport | [`Error::TransportClosed`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::error::ProtocolError;

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when process or handshake configuration is invalid.
    /// Fatal at startup.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Daemon Connection Errors
    // ========================================================================
    /// Connection to the daemon failed.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Daemon I/O did not complete within the configured timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The tunnel was closed while (or before) the operation ran.
    #[error("Tunnel closed")]
    TunnelClosed,

    // ========================================================================
    // Framing / Protocol Errors
    // ========================================================================
    /// Malformed instruction bytes.
    #[error("Framing error: {message}")]
    Framing {
        /// Description of the framing violation.
        message: String,
    },

    /// An instruction exceeds the maximum message size.
    #[error("Instruction of {size} bytes exceeds maximum of {max} bytes")]
    InstructionTooLarge {
        /// Size the instruction would need.
        size: usize,
        /// Maximum permitted size.
        max: usize,
    },

    /// Protocol violation during negotiation.
    #[error("Protocol error: {message}")]
    Protocol {
        /// Description of the protocol violation.
        message: String,
    },

    /// Daemon answered with an opcode other than the one required.
    #[error("Expected \"{expected}\" instruction but received \"{actual}\"")]
    UnexpectedOpcode {
        /// The opcode the handshake step requires.
        expected: String,
        /// The opcode actually received.
        actual: String,
    },

    /// Daemon reported an `error` instruction.
    #[error("Daemon error {status}: {message}")]
    Daemon {
        /// Numeric status code sent by the daemon.
        status: u32,
        /// Human readable message sent by the daemon.
        message: String,
    },

    // ========================================================================
    // Tunnel Discipline Errors
    // ========================================================================
    /// A reader or writer handle was acquired while already held.
    #[error("Tunnel {handle} is already acquired")]
    HandleInUse {
        /// Which handle (`reader` or `writer`).
        handle: &'static str,
    },

    // ========================================================================
    // Transport Errors
    // ========================================================================
    /// The browser transport is closed.
    ///
    /// Covers a clean close handshake as well as writes after close.
    #[error("Transport closed")]
    TransportClosed,

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(WsError),
}

// ============================================================================
// Conversions
// ============================================================================

impl From<WsError> for Error {
    fn from(err: WsError) -> Self {
        match err {
            WsError::ConnectionClosed
            | WsError::AlreadyClosed
            | WsError::Protocol(ProtocolError::SendAfterClosing) => Self::TransportClosed,
            other => Self::WebSocket(other),
        }
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Creates a framing error.
    #[inline]
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Creates an instruction too large error.
    #[inline]
    pub fn instruction_too_large(size: usize, max: usize) -> Self {
        Self::InstructionTooLarge { size, max }
    }

    /// Creates a protocol error.
    #[inline]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Creates an unexpected opcode error.
    #[inline]
    pub fn unexpected_opcode(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::UnexpectedOpcode {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Creates a daemon error.
    #[inline]
    pub fn daemon(status: u32, message: impl Into<String>) -> Self {
        Self::Daemon {
            status,
            message: message.into(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` if this error concerns the daemon connection.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::TunnelClosed | Self::Io(_)
        )
    }

    /// Returns `true` if the instruction stream was malformed or out of order.
    #[inline]
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Framing { .. }
                | Self::InstructionTooLarge { .. }
                | Self::Protocol { .. }
                | Self::UnexpectedOpcode { .. }
                | Self::Daemon { .. }
        )
    }

    /// Returns `true` if the browser transport closed cleanly.
    #[inline]
    #[must_use]
    pub fn is_transport_closed(&self) -> bool {
        matches!(self, Self::TransportClosed)
    }
}

// ============================================================================
// Tests
// ============================================================================
