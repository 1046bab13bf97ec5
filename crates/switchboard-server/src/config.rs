//! Server configuration.

use std::time::Duration;

use switchboard_hub::{HubConfig, SlowConsumerPolicy};
use switchboard_settings::SwitchboardSettings;

/// Configuration for the Switchboard server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` auto-assigns).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Interval between server Ping frames.
    pub heartbeat_interval: Duration,
    /// Close a connection after this long without a pong.
    pub heartbeat_timeout: Duration,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Requests a single connection may have in progress.
    pub max_inflight_requests: usize,
    /// How long shutdown waits for tasks to drain.
    pub shutdown_timeout: Duration,
    /// Mount `/cluster/broadcast` for peers.
    pub cluster_enabled: bool,
    /// Secret peers must present on `/cluster/broadcast`. Without one the
    /// endpoint refuses every request.
    pub cluster_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 10_000,
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            max_message_size: 64 * 1024,
            max_inflight_requests: 16,
            shutdown_timeout: Duration::from_secs(10),
            cluster_enabled: false,
            cluster_secret: None,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &SwitchboardSettings) -> Self {
        let server = &settings.server;
        Self {
            host: server.host.clone(),
            port: server.port,
            max_connections: server.max_connections,
            heartbeat_interval: Duration::from_millis(server.heartbeat_interval_ms),
            heartbeat_timeout: Duration::from_millis(server.heartbeat_timeout_ms),
            max_message_size: server.max_message_size,
            max_inflight_requests: settings.rpc.max_inflight_requests,
            shutdown_timeout: Duration::from_millis(server.shutdown_timeout_ms),
            cluster_enabled: settings.cluster.enabled,
            cluster_secret: settings.cluster.secret.clone(),
        }
    }

    /// Socket address string to bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Hub tuning from loaded settings.
pub fn hub_config(settings: &SwitchboardSettings) -> HubConfig {
    let hub = &settings.hub;
    HubConfig {
        shard_count: hub.shard_count,
        shard_inbox_capacity: hub.shard_inbox_capacity,
        outbound_queue_capacity: hub.outbound_queue_capacity,
        slow_consumer: SlowConsumerPolicy {
            max_consecutive_full: hub.slow_consumer_threshold,
            max_backlog_age: Duration::from_millis(hub.max_backlog_age_ms),
        },
    }
}
