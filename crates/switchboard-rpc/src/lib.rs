//! # switchboard-rpc
//!
//! Inbound request handling for Switchboard connections.
//!
//! Each request envelope is checked against the connection's session,
//! dispatched to the handler registered for its action, and answered on the
//! same connection. All failures reach the client as sanitized error
//! envelopes that echo the request's `seq`.

#![deny(unsafe_code)]

pub mod context;
pub mod errors;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod session;
pub mod validation;

pub use context::RequestContext;
pub use errors::RpcError;
pub use registry::{ActionHandler, ActionRegistry, FnHandler};
pub use router::RequestRouter;
pub use session::{InMemorySessionStore, Session, SessionError, SessionStore};
