//! Per-request context handed to action handlers.

use std::sync::Arc;

use switchboard_core::{ConnectionId, UserId};
use switchboard_hub::Hub;

use crate::session::Session;

/// Identity and dependencies available to a handler.
#[derive(Clone)]
pub struct RequestContext {
    /// The validated session.
    pub session: Session,
    /// Connection that issued the request.
    pub connection_id: ConnectionId,
    /// Owner of the session and connection.
    pub user_id: UserId,
    /// Client locale.
    pub locale: String,
    /// Hub, for handlers that broadcast.
    pub hub: Arc<Hub>,
}
