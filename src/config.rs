//! Tunables for client sessions and document servers
//!
//! All fields have defaults, so a partial JSON object is a valid
//! configuration:
//!
//! ```rust
//! use wavesync_core::SyncConfig;
//!
//! let config = SyncConfig::from_json(r#"{ "session": { "ackTimeoutMs": 5000 } }"#).unwrap();
//! assert_eq!(config.session.ack_timeout_ms, 5000);
//! assert!(config.session.coalesce_queued);
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How long a sent delta may go unacknowledged before the session degrades
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Catch-up larger than this is answered with a snapshot instead
pub const DEFAULT_MAX_CATCH_UP_DELTAS: usize = 1000;

/// Pending requests per document actor
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Committed deltas buffered per subscriber before it lags
pub const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Client session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub ack_timeout_ms: u64,
    /// Merge queued deltas into one before sending
    pub coalesce_queued: bool,
}

impl SessionConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            coalesce_queued: true,
        }
    }
}

/// Document server settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub max_catch_up_deltas: usize,
    pub command_buffer: usize,
    pub broadcast_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_catch_up_deltas: DEFAULT_MAX_CATCH_UP_DELTAS,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub session: SessionConfig,
    pub server: ServerConfig,
}

impl SyncConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.session.ack_timeout(), DEFAULT_ACK_TIMEOUT);
        assert_eq!(config.server.max_catch_up_deltas, DEFAULT_MAX_CATCH_UP_DELTAS);
    }

    #[test]
    fn test_partial_json() {
        let config = SyncConfig::from_json(r#"{"server": {"broadcastCapacity": 8}}"#).unwrap();
        assert_eq!(config.server.broadcast_capacity, 8);
        assert_eq!(config.server.command_buffer, DEFAULT_COMMAND_BUFFER);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_invalid_json() {
        assert!(SyncConfig::from_json("{").is_err());
    }
}
