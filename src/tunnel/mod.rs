//! Tunnel abstraction over a daemon session.
//!
//! A tunnel owns one negotiated daemon connection and hands out exactly one
//! reader and one writer at a time. The bridge only ever talks to the
//! capability traits defined here, so it can be driven by in-memory fakes.
//!
//! # Handle Discipline
//!
//! ```text
//!   acquire_reader ──► TunnelReader ──► release_reader
//!   acquire_writer ──► TunnelWriter ──► release_writer
//!   close ──► in-flight I/O on held handles fails with TunnelClosed
//! ```
//!
//! Acquiring a handle that is already held fails with
//! [`Error::HandleInUse`](crate::Error::HandleInUse).

// ============================================================================
// Imports
// ============================================================================

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

// ============================================================================
// Submodules
// ============================================================================

/// Tunnel over a single daemon [`Stream`](crate::Stream).
pub mod simple;

// ============================================================================
// Re-exports
// ============================================================================

pub use simple::{SimpleTunnel, TunnelReader, TunnelWriter};

// ============================================================================
// Capability Traits
// ============================================================================

/// Source of complete daemon instructions.
#[async_trait]
pub trait InstructionRead: Send {
    /// Returns the raw bytes of the next complete instruction.
    async fn read_some(&mut self) -> Result<&[u8]>;

    /// Returns `true` if another complete instruction is buffered already.
    fn available(&self) -> bool;
}

/// Sink for raw daemon protocol bytes.
#[async_trait]
pub trait InstructionWrite: Send {
    /// Writes bytes verbatim.
    async fn write_raw(&mut self, data: &[u8]) -> Result<()>;
}

// ============================================================================
// Tunnel
// ============================================================================

/// A negotiated daemon session with exclusive reader/writer access.
pub trait Tunnel: Send + Sync + 'static {
    /// Reader handle type.
    type Reader: InstructionRead + 'static;
    /// Writer handle type.
    type Writer: InstructionWrite + 'static;

    /// Locally generated identifier of this tunnel instance.
    fn uuid(&self) -> Uuid;

    /// Connection id assigned by the daemon. Stable for the tunnel's lifetime.
    fn connection_id(&self) -> &str;

    /// Takes the reader handle.
    ///
    /// # Errors
    ///
    /// - [`Error::HandleInUse`](crate::Error::HandleInUse) if the reader is held
    /// - [`Error::TunnelClosed`](crate::Error::TunnelClosed) after [`close`](Self::close)
    fn acquire_reader(&self) -> Result<Self::Reader>;

    /// Returns the reader handle.
    fn release_reader(&self, reader: Self::Reader);

    /// Takes the writer handle.
    ///
    /// # Errors
    ///
    /// - [`Error::HandleInUse`](crate::Error::HandleInUse) if the writer is held
    /// - [`Error::TunnelClosed`](crate::Error::TunnelClosed) after [`close`](Self::close)
    fn acquire_writer(&self) -> Result<Self::Writer>;

    /// Returns the writer handle.
    fn release_writer(&self, writer: Self::Writer);

    /// Releases the daemon connection. Only the first call has any effect.
    ///
    /// # Errors
    ///
    /// Implementation specific; [`SimpleTunnel`] never fails.
    fn close(&self) -> Result<()>;

    /// Returns `true` until [`close`](Self::close) is called.
    fn is_open(&self) -> bool;
}
