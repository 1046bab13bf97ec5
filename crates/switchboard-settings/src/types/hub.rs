//! Hub tuning and request-handling settings.

use serde::{Deserialize, Serialize};

/// Shard and outbound queue tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HubSettings {
    /// Number of shards. `0` means twice the available parallelism.
    pub shard_count: usize,
    /// Capacity of each shard's command inbox.
    pub shard_inbox_capacity: usize,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_capacity: usize,
    /// Consecutive full-queue pushes before a connection is evicted.
    pub slow_consumer_threshold: u32,
    /// Longest a queue may stay full before eviction, in milliseconds.
    pub max_backlog_age_ms: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            shard_count: 0,
            shard_inbox_capacity: 4096,
            outbound_queue_capacity: 256,
            slow_consumer_threshold: 3,
            max_backlog_age_ms: 30_000,
        }
    }
}

/// Inbound request handling.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RpcSettings {
    /// Per-handler timeout, in milliseconds.
    pub handler_timeout_ms: u64,
    /// Requests a single connection may have in progress.
    pub max_inflight_requests: usize,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            handler_timeout_ms: 60_000,
            max_inflight_requests: 16,
        }
    }
}
