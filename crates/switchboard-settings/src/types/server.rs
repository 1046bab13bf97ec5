//! Transport server and logging settings.

use serde::{Deserialize, Serialize};

/// HTTP/WebSocket listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Listen port. `0` picks an ephemeral port.
    pub port: u16,
    /// Upper bound on simultaneously open WebSocket connections.
    pub max_connections: usize,
    /// Interval between server pings, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a connection is considered dead, in milliseconds.
    pub heartbeat_timeout_ms: u64,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// How long shutdown waits for connection tasks to drain, in milliseconds.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8065,
            max_connections: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 90_000,
            max_message_size: 64 * 1024,
            shutdown_timeout_ms: 10_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit one JSON object per line instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
