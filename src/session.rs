//! Registry of live tunnels keyed by connection id.
//!
//! Register a [`SessionRegistry`] as a [`ConnectionListener`] and it counts
//! one tunnel per connect and uncounts it on disconnect. Several browser
//! connections may join the same daemon connection id, so the value is a
//! count rather than a flag.
//!
//! # Example
//!
//! ```ignore
//! let sessions = Arc::new(SessionRegistry::new());
//! let server = WebsocketServer::new(connector).listener(sessions.clone());
//!
//! // Later, from a listing endpoint:
//! let body = sessions.to_json()?;
//! ```

// ============================================================================
// Imports
// ============================================================================

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::bridge::ConnectionListener;
use crate::error::{Error, Result};
use crate::transport::ConnectRequest;

// ============================================================================
// SessionCount
// ============================================================================

/// One entry of a registry snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionCount {
    /// Daemon connection id.
    pub uuid: String,
    /// Tunnels currently associated with the id.
    pub count: usize,
}

// ============================================================================
// SessionRegistry
// ============================================================================

/// Concurrency-safe connection id → active tunnel count map.
///
/// Counts never go negative and an id whose count reaches zero is removed.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<FxHashMap<String, usize>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one more tunnel for `connection_id`.
    pub fn add(&self, connection_id: &str) {
        let mut sessions = self.sessions.write();
        let count = sessions.entry(connection_id.to_owned()).or_insert(0);
        *count += 1;
        debug!(connection_id, count = *count, "Session added");
    }

    /// Counts one tunnel less for `connection_id`, removing it at zero.
    pub fn delete(&self, connection_id: &str) {
        let mut sessions = self.sessions.write();

        let Some(count) = sessions.get_mut(connection_id) else {
            warn!(connection_id, "Delete for unknown session ignored");
            return;
        };

        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            sessions.remove(connection_id);
        }

        debug!(connection_id, count = remaining, "Session removed");
    }

    /// Returns the count for `connection_id`, `0` if absent.
    #[must_use]
    pub fn count(&self, connection_id: &str) -> usize {
        self.sessions
            .read()
            .get(connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// Returns the number of distinct connection ids.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns `true` if no tunnel is live.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Returns a consistent copy of every entry, in no particular order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<SessionCount> {
        self.sessions
            .read()
            .iter()
            .map(|(uuid, &count)| SessionCount {
                uuid: uuid.clone(),
                count,
            })
            .collect()
    }

    /// Serializes [`snapshot`](Self::snapshot) as a JSON array.
    ///
    /// # Errors
    ///
    /// Propagates serializer failures as [`Error::Protocol`](crate::Error::Protocol).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(&self.snapshot())
            .map_err(|e| Error::protocol(format!("failed to encode sessions: {e}")))
    }
}

impl ConnectionListener for SessionRegistry {
    fn on_connect(&self, connection_id: &str, _request: &ConnectRequest) {
        self.add(connection_id);
    }

    fn on_disconnect(&self, connection_id: &str, _request: &ConnectRequest) {
        self.delete(connection_id);
    }
}

// ============================================================================
// Tests
// ============================================================================
