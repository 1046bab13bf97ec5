//! # switchboard-hub
//!
//! The connection hub: a fixed set of shards, each a single task owning a
//! partition of live connections keyed by user id.
//!
//! - [`connection`]: per-connection state, bounded outbound queue, slow-consumer policy
//! - [`shard`]: the sequential loop that owns membership and fans out broadcasts
//! - [`hub`]: shard table, routing, registration, shutdown
//! - [`cluster`]: best-effort forwarding of broadcasts to peer nodes
//! - [`memory`]: in-process cluster transport

#![deny(unsafe_code)]

pub mod cluster;
pub mod connection;
pub mod hub;
pub mod memory;
pub mod metrics;
pub mod shard;

pub use cluster::{ClusterError, ClusterForwarder, ClusterTransport};
pub use connection::{CloseReason, ConnIdentity, Outbound, PushOutcome, SlowConsumerPolicy, WebConn};
pub use hub::{Hub, HubConfig, HubError};
pub use memory::{MemoryCluster, MemoryTransport};
