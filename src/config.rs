//! Process configuration for the bridge server.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `GUACD_ADDRESS` | `127.0.0.1:4822` | Daemon `host:port` |
//! | `LISTEN_ADDRESS` | `0.0.0.0:4567` | Socket address to serve on |
//! | `CERT_PATH` | - | TLS certificate (not supported) |
//! | `CERT_KEY_PATH` | - | TLS private key (not supported) |
//!
//! TLS has to be terminated in front of the bridge, so any certificate
//! configuration is rejected.

// ============================================================================
// Imports
// ============================================================================

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use tracing::debug;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default daemon address.
pub const DEFAULT_GUACD_ADDRESS: &str = "127.0.0.1:4822";

/// Default listen address.
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:4567";

// ============================================================================
// ServerConfig
// ============================================================================

/// Validated server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Daemon address as `host:port`.
    pub guacd_addr: String,
    /// Address the WebSocket server binds to.
    pub listen_addr: SocketAddr,
}

impl ServerConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid addresses or any certificate
    /// variable.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid addresses or any certificate
    /// variable.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let cert_path = get("CERT_PATH").map(PathBuf::from);
        let cert_key_path = get("CERT_KEY_PATH").map(PathBuf::from);
        match (&cert_path, &cert_key_path) {
            (None, None) => {}
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::config(
                    "You must set both the CERT_PATH and CERT_KEY_PATH environment variables",
                ));
            }
            (Some(cert), Some(key)) => {
                return Err(Error::config(format!(
                    "TLS is not supported (CERT_PATH={}, CERT_KEY_PATH={}); terminate TLS in front of the bridge",
                    cert.display(),
                    key.display()
                )));
            }
        }

        let guacd_addr = get("GUACD_ADDRESS").unwrap_or_else(|| DEFAULT_GUACD_ADDRESS.to_owned());
        validate_host_port(&guacd_addr)?;

        let listen = get("LISTEN_ADDRESS").unwrap_or_else(|| DEFAULT_LISTEN_ADDRESS.to_owned());
        let listen_addr = listen
            .parse::<SocketAddr>()
            .map_err(|e| Error::config(format!("Invalid LISTEN_ADDRESS {listen:?}: {e}")))?;

        let config = Self {
            guacd_addr,
            listen_addr,
        };
        debug!(?config, "Loaded server configuration");
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            guacd_addr: DEFAULT_GUACD_ADDRESS.to_owned(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4567)),
        }
    }
}

/// Checks that `addr` is a non-empty host followed by a valid port.
fn validate_host_port(addr: &str) -> Result<()> {
    let invalid = || Error::config(format!("Invalid GUACD_ADDRESS {addr:?}: expected host:port"));

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.is_empty() {
        return Err(invalid());
    }
    port.parse::<u16>().map_err(|_| invalid())?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================
