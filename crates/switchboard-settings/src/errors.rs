//! Errors raised while loading settings.

use std::path::PathBuf;

use thiserror::Error;

/// Why a settings file could not be turned into [`crate::SwitchboardSettings`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The file exists but could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Malformed JSON, or a field of the wrong type.
    #[error("malformed settings: {0}")]
    Json(#[from] serde_json::Error),
    /// Out of range, or inconsistent with another value.
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, SettingsError>;
