//! `/health` endpoint body.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `"ok"`, or `"draining"` once shutdown has started.
    pub status: &'static str,
    /// This node's cluster id.
    pub node_id: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live connections registered with the hub.
    pub connections: usize,
    /// Number of hub shards.
    pub shards: usize,
}

/// Build a health response from live counters.
pub fn health_check(
    start_time: Instant,
    node_id: &str,
    connections: usize,
    shards: usize,
    draining: bool,
) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" },
        node_id: node_id.to_owned(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        shards,
    }
}
