//! Per-request pipeline: session check, dispatch, response.

use std::sync::Arc;

use serde_json::Value;
use switchboard_core::{RequestEnvelope, ResponseEnvelope};
use switchboard_hub::{Hub, WebConn};
use tracing::{debug, instrument, warn};

use crate::context::RequestContext;
use crate::errors::RpcError;
use crate::registry::ActionRegistry;
use crate::session::{Session, SessionStore};

/// Validates and dispatches requests arriving on connections.
///
/// Responses always go back to the issuing connection through its shard,
/// so they are ordered with broadcasts to that connection.
#[derive(Clone)]
pub struct RequestRouter {
    registry: Arc<ActionRegistry>,
    sessions: Arc<dyn SessionStore>,
    hub: Arc<Hub>,
}

impl RequestRouter {
    /// Create a router.
    pub fn new(registry: Arc<ActionRegistry>, sessions: Arc<dyn SessionStore>, hub: Arc<Hub>) -> Self {
        Self {
            registry,
            sessions,
            hub,
        }
    }

    /// The action registry.
    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Parse a raw text frame and route it.
    ///
    /// A frame that is not a request envelope gets an `InvalidRequest`
    /// response carrying the frame's numeric `seq` if one can be recovered,
    /// otherwise 0.
    pub async fn handle_frame(&self, conn: &Arc<WebConn>, text: &str) -> ResponseEnvelope {
        match serde_json::from_str::<RequestEnvelope>(text) {
            Ok(request) => self.route(conn, request).await,
            Err(e) => {
                let seq = recover_seq(text);
                debug!(conn_id = %conn.id, seq, error = %e, "malformed request frame");
                let err = RpcError::InvalidRequest {
                    message: format!("malformed request: {e}"),
                };
                self.reject(conn, seq, &err).await
            }
        }
    }

    /// Validate, dispatch and answer one request.
    #[instrument(skip_all, fields(conn_id = %conn.id, action = %request.action, seq = request.seq))]
    pub async fn route(&self, conn: &Arc<WebConn>, request: RequestEnvelope) -> ResponseEnvelope {
        let response = self.process(conn, &request).await;
        self.hub.send(conn, response.clone()).await;
        response
    }

    /// Answer a request with an error without invoking any handler.
    pub async fn reject(&self, conn: &Arc<WebConn>, seq: i64, err: &RpcError) -> ResponseEnvelope {
        let response = ResponseEnvelope::fail(seq, err.to_error_body());
        self.hub.send(conn, response.clone()).await;
        response
    }

    async fn process(&self, conn: &WebConn, request: &RequestEnvelope) -> ResponseEnvelope {
        let session = match self.authenticate(conn).await {
            Ok(session) => session,
            Err(err) => return failure(request, &err),
        };

        let ctx = RequestContext {
            session,
            connection_id: conn.id.clone(),
            user_id: conn.user_id.clone(),
            locale: conn.locale.clone(),
            hub: Arc::clone(&self.hub),
        };

        match self.registry.dispatch(request, &ctx).await {
            Ok(data) => ResponseEnvelope::ok(request.seq, data),
            Err(err) => failure(request, &err),
        }
    }

    async fn authenticate(&self, conn: &WebConn) -> Result<Session, RpcError> {
        let session = self.sessions.validate_session(conn.session_token()).await?;
        if session.user_id != conn.user_id {
            warn!(
                conn_id = %conn.id,
                conn_user = %conn.user_id,
                session_user = %session.user_id,
                "session does not belong to connection user"
            );
            return Err(RpcError::Session {
                message: "session does not match connection".into(),
            });
        }
        Ok(session)
    }
}

fn failure(request: &RequestEnvelope, err: &RpcError) -> ResponseEnvelope {
    if err.is_server_fault() {
        match err {
            RpcError::Handler(app) => warn!(error = %app.system_message(), "request failed"),
            other => warn!(error = %other, "request failed"),
        }
    } else {
        debug!(error = %err, error_type = err.error_type(), "request rejected");
    }
    ResponseEnvelope::fail(request.seq, err.to_error_body())
}

/// Pull a numeric `seq` out of a frame that failed to parse as a request.
pub fn recover_seq(text: &str) -> i64 {
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("seq").and_then(Value::as_i64))
        .unwrap_or(0)
}
