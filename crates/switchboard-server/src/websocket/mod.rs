//! WebSocket session handling and heartbeat.

pub mod heartbeat;
pub mod session;

pub use session::{SessionDeps, run_ws_session};
