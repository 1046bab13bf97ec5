//! Request error taxonomy.

use switchboard_core::{AppError, ErrorBody};

use crate::validation::sanitize_error_message;

/// Session missing, expired, revoked or owned by another user.
pub const SESSION_INVALID: &str = "websocket.session_invalid";
/// No handler registered for the action.
pub const UNKNOWN_ACTION: &str = "websocket.unknown_action";
/// The frame is not a request envelope.
pub const INVALID_REQUEST: &str = "websocket.invalid_request";
/// A parameter is missing or has the wrong type.
pub const INVALID_PARAM: &str = "websocket.invalid_param";
/// Too many requests in progress on the connection.
pub const SERVER_BUSY: &str = "websocket.server_busy";
/// The handler did not finish in time.
pub const TIMEOUT: &str = "websocket.timeout";
/// Unexpected failure.
pub const INTERNAL: &str = "websocket.internal";

/// Error produced while handling one request.
///
/// Every variant reaches the client as an [`ErrorBody`] built by
/// [`RpcError::to_error_body`], the only place internal detail is stripped.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The connection's session failed validation.
    #[error("{message}")]
    Session {
        /// Client-safe description.
        message: String,
    },

    /// The action is not registered.
    #[error("unknown action '{action}'")]
    UnknownAction {
        /// Requested action.
        action: String,
    },

    /// The frame could not be parsed as a request.
    #[error("{message}")]
    InvalidRequest {
        /// What was wrong with the frame.
        message: String,
    },

    /// A handler parameter is missing or ill-typed.
    #[error("invalid or missing parameter '{name}' for action '{action}'")]
    InvalidParam {
        /// Action being handled.
        action: String,
        /// Offending parameter.
        name: String,
    },

    /// The connection has too many requests in progress.
    #[error("too many requests in progress for action '{action}'")]
    ServerBusy {
        /// Rejected action.
        action: String,
    },

    /// The handler exceeded its timeout.
    #[error("action '{action}' timed out")]
    Timeout {
        /// Action that timed out.
        action: String,
    },

    /// Application error returned by a handler.
    #[error(transparent)]
    Handler(#[from] AppError),

    /// Unexpected failure. The message never reaches the client.
    #[error("{message}")]
    Internal {
        /// Internal description.
        message: String,
    },
}

impl RpcError {
    /// Stable error id sent to the client.
    pub fn code(&self) -> &str {
        match self {
            Self::Session { .. } => SESSION_INVALID,
            Self::UnknownAction { .. } => UNKNOWN_ACTION,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::InvalidParam { .. } => INVALID_PARAM,
            Self::ServerBusy { .. } => SERVER_BUSY,
            Self::Timeout { .. } => TIMEOUT,
            Self::Handler(app) => &app.id,
            Self::Internal { .. } => INTERNAL,
        }
    }

    /// HTTP-equivalent status.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Session { .. } => 401,
            Self::UnknownAction { .. } => 501,
            Self::InvalidRequest { .. } | Self::InvalidParam { .. } => 400,
            Self::ServerBusy { .. } => 503,
            Self::Timeout { .. } => 504,
            Self::Handler(app) => app.status_code,
            Self::Internal { .. } => 500,
        }
    }

    /// Short label for the `error_type` metric.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Session { .. } => "session",
            Self::UnknownAction { .. } => "unknown_action",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::InvalidParam { .. } => "invalid_param",
            Self::ServerBusy { .. } => "server_busy",
            Self::Timeout { .. } => "timeout",
            Self::Handler(_) => "handler",
            Self::Internal { .. } => "internal",
        }
    }

    /// Whether the failure is the server's fault rather than the client's.
    pub fn is_server_fault(&self) -> bool {
        self.status_code() >= 500 && !matches!(self, Self::UnknownAction { .. })
    }

    /// Client-visible body with internal detail removed.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            id: self.code().to_owned(),
            message: sanitize_error_message(self),
            status_code: self.status_code(),
        }
    }
}
