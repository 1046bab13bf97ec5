//! # switchboard-server
//!
//! Axum HTTP + `WebSocket` transport for the Switchboard hub.
//!
//! - `/ws`: session-authenticated upgrade, one reader, writer and heartbeat
//!   task per connection
//! - `/health` and `/metrics` (Prometheus text format)
//! - `/cluster/broadcast`: broadcasts forwarded by peer nodes, plus the HTTP
//!   transport that sends them
//! - Built-in `ping` and `user_typing` actions
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod actions;
pub mod cluster;
pub mod config;
pub mod health;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use cluster::HttpClusterTransport;
pub use config::ServerConfig;
pub use server::{AppState, SwitchboardServer};
pub use shutdown::ShutdownCoordinator;
