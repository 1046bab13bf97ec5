//! Metric names recorded by the hub and the cluster forwarder.

/// Broadcasts submitted (counter, labels: target).
pub const HUB_BROADCASTS_TOTAL: &str = "hub_broadcasts_total";
/// Messages dropped because a recipient's queue was full (counter).
pub const HUB_DELIVERIES_DROPPED_TOTAL: &str = "hub_deliveries_dropped_total";
/// Connections evicted as slow consumers (counter).
pub const HUB_SLOW_CONSUMER_EVICTIONS_TOTAL: &str = "hub_slow_consumer_evictions_total";
/// Connections registered across all shards (gauge).
pub const HUB_CONNECTIONS_REGISTERED: &str = "hub_connections_registered";
/// Broadcasts sent to peers (counter).
pub const CLUSTER_FORWARDS_TOTAL: &str = "cluster_forwards_total";
/// Failed peer sends (counter, labels: peer).
pub const CLUSTER_FORWARD_ERRORS_TOTAL: &str = "cluster_forward_errors_total";
/// Broadcasts dropped because the forwarder queue was full (counter).
pub const CLUSTER_FORWARDS_DROPPED_TOTAL: &str = "cluster_forwards_dropped_total";
/// Broadcasts accepted from peers (counter).
pub const CLUSTER_RECEIVED_TOTAL: &str = "cluster_received_total";
