//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]`, so a settings
//! file may set any subset of fields and the rest keep their defaults.

mod cluster;
mod hub;
mod server;

pub use cluster::*;
pub use hub::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "hub": { "shardCount": 8 },
///   "cluster": { "enabled": true, "peers": ["http://10.0.0.2:8065"] }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchboardSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Shard and queue tuning.
    pub hub: HubSettings,
    /// Request handling.
    pub rpc: RpcSettings,
    /// Peer forwarding.
    pub cluster: ClusterSettings,
    /// Session store.
    pub auth: AuthSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

impl SwitchboardSettings {
    /// Reject combinations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.hub.outbound_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.outboundQueueCapacity must be at least 1".into(),
            ));
        }
        if self.hub.shard_inbox_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.shardInboxCapacity must be at least 1".into(),
            ));
        }
        if self.hub.slow_consumer_threshold == 0 {
            return Err(SettingsError::InvalidValue(
                "hub.slowConsumerThreshold must be at least 1".into(),
            ));
        }
        if self.rpc.max_inflight_requests == 0 {
            return Err(SettingsError::InvalidValue(
                "rpc.maxInflightRequests must be at least 1".into(),
            ));
        }
        if self.server.heartbeat_interval_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.heartbeatIntervalMs must be positive".into(),
            ));
        }
        if self.server.heartbeat_timeout_ms < self.server.heartbeat_interval_ms {
            return Err(SettingsError::InvalidValue(format!(
                "server.heartbeatTimeoutMs ({}) is shorter than heartbeatIntervalMs ({})",
                self.server.heartbeat_timeout_ms, self.server.heartbeat_interval_ms
            )));
        }
        if self.cluster.enabled && self.cluster.secret.as_deref().is_none_or(str::is_empty) {
            return Err(SettingsError::InvalidValue(
                "cluster.secret is required when cluster.enabled is set".into(),
            ));
        }
        if self.cluster.enabled && self.cluster.forward_queue_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "cluster.forwardQueueCapacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
