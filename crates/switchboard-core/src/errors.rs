//! Application-layer error returned by action handlers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::envelope::ErrorBody;

/// Error produced by the application layer.
///
/// `detailed_error` holds internal diagnostics (SQL text, file paths, peer
/// addresses). It is logged server-side and never leaves the process;
/// [`AppError::to_error_body`] drops it.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{location}: {message}")]
pub struct AppError {
    /// Stable machine-readable id (e.g. `app.channel.not_found`).
    pub id: String,
    /// Client-safe message.
    pub message: String,
    /// Internal diagnostics, server-side only.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detailed_error: String,
    /// HTTP-equivalent status code.
    pub status_code: u16,
    /// Where the error was raised (function or action name).
    #[serde(default, rename = "where")]
    pub location: String,
}

impl AppError {
    /// Create an error without internal detail.
    pub fn new(
        location: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
        status_code: u16,
    ) -> Self {
        Self {
            id: id.into(),
            message: message.into(),
            detailed_error: String::new(),
            status_code,
            location: location.into(),
        }
    }

    /// Attach internal diagnostics.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detailed_error = detail.into();
        self
    }

    /// Full message for server-side logs, including internal detail.
    pub fn system_message(&self) -> String {
        if self.detailed_error.is_empty() {
            self.to_string()
        } else {
            format!("{self}, {}", self.detailed_error)
        }
    }

    /// Client-visible body with internal detail stripped.
    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            id: self.id.clone(),
            message: self.message.clone(),
            status_code: self.status_code,
        }
    }
}
