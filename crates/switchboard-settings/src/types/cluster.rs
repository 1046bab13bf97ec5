//! Multi-node and authentication settings.

use serde::{Deserialize, Serialize};

/// Peer forwarding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Forward broadcasts to peers.
    pub enabled: bool,
    /// This node's id. Empty means generate one at startup.
    pub node_id: String,
    /// Base URLs of peer nodes (e.g. `http://10.0.0.2:8065`).
    pub peers: Vec<String>,
    /// Shared secret sent with every forwarded broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Capacity of the forwarder's queue.
    pub forward_queue_capacity: usize,
    /// Per-peer request timeout, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: String::new(),
            peers: Vec::new(),
            secret: None,
            forward_queue_capacity: 1024,
            request_timeout_ms: 2_000,
        }
    }
}

/// Session store settings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// JSON file seeding the in-memory session store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sessions_file: Option<String>,
}
