//! guacd wire protocol.
//!
//! This module defines the instruction format spoken by the daemon and the
//! negotiation that opens a session.
//!
//! # Protocol Overview
//!
//! | Step | Direction | Instruction |
//! |------|-----------|-------------|
//! | 1 | Bridge → Daemon | `select` (protocol or connection id) |
//! | 2 | Daemon → Bridge | `args` (required parameter names) |
//! | 3 | Bridge → Daemon | `size`, `audio`, `video`, `image`, `timezone`, `connect` |
//! | 4 | Daemon → Bridge | `ready` (connection id) |
//!
//! After `ready` the instruction stream is opaque to the bridge.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `instruction` | [`Instruction`] type and the length-prefixed codec |
//! | `handshake` | [`HandshakeConfig`] and the negotiation steps |

// ============================================================================
// Submodules
// ============================================================================

/// Instruction type and wire codec.
pub mod instruction;

/// Session negotiation.
pub mod handshake;

// ============================================================================
// Constants
// ============================================================================

/// Maximum size of one instruction, also the outbound batching cap.
pub const MAX_GUAC_MESSAGE: usize = 8192;

/// Opcode reserved for messages private to the bridge.
pub const INTERNAL_DATA_OPCODE: &str = "";

/// Encoded prefix of every instruction carrying [`INTERNAL_DATA_OPCODE`].
pub const INTERNAL_OPCODE_PREFIX: &[u8] = b"0.";

/// Protocol version advertised to daemons that announce one.
pub const PROTOCOL_VERSION: &str = "VERSION_1_5_0";

// ============================================================================
// Re-exports
// ============================================================================

pub use handshake::HandshakeConfig;
pub use instruction::{Instruction, InstructionFramer, is_internal};
