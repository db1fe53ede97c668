//! Browser-facing transport layer.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐                              ┌──────────────────┐
//! │  Browser    │         WebSocket            │ WebsocketServer  │
//! │  (Guacamole │◄────────────────────────────►│  → Connector     │
//! │   client)   │   /websocket-tunnel?...      │  → bridge::run   │
//! └─────────────┘                              └──────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `server` | Upgrade handling, accept loop and tunnel creation |
//! | `websocket` | Message capabilities for split WebSocket halves |

// ============================================================================
// Submodules
// ============================================================================

/// WebSocket server and connection handling.
pub mod server;

/// WebSocket halves as browser transports.
pub mod websocket;

// ============================================================================
// Re-exports
// ============================================================================

pub use server::{ConnectRequest, Connector, WebsocketServer};
