//! # switchboard-core
//!
//! Foundation types shared by every Switchboard crate.
//!
//! - **Branded IDs**: `UserId`, `SessionId`, `ConnectionId`, `ChannelId`, `TeamId`
//! - **Envelopes**: the request/response units exchanged over a connection
//! - **Events**: `WebSocketEvent` payloads and the `Broadcast` routing wrapper
//! - **Errors**: `AppError`, the application-layer error handed to clients
//! - **Logging**: `tracing` subscriber initialization

#![deny(unsafe_code)]

pub mod envelope;
pub mod errors;
pub mod events;
pub mod ids;
pub mod logging;

pub use envelope::{ErrorBody, RequestEnvelope, ResponseEnvelope, ResponseStatus};
pub use errors::AppError;
pub use events::{Broadcast, BroadcastTarget, WebSocketEvent};
pub use ids::{ChannelId, ConnectionId, SessionId, TeamId, UserId};
