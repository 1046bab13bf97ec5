//! Session lookup.
//!
//! Sessions belong to the authentication layer; the router only asks
//! whether a token is still valid, on every request.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use switchboard_core::{SessionId, UserId};
use thiserror::Error;
use tracing::debug;

use crate::errors::RpcError;

/// An authenticated login session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Session id.
    pub id: SessionId,
    /// Owning user.
    pub user_id: UserId,
    /// Bearer token.
    pub token: String,
    /// Expiry; `None` never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Whether the session has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether the session has expired.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Session validation failure.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// No session for the token (never existed or revoked).
    #[error("session not found")]
    NotFound,
    /// The session has expired.
    #[error("session expired")]
    Expired,
    /// The store could not answer.
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        let message = match err {
            SessionError::NotFound => "invalid or revoked session",
            SessionError::Expired => "session expired",
            SessionError::Unavailable(_) => "session could not be validated",
        };
        RpcError::Session {
            message: message.to_string(),
        }
    }
}

/// Source of truth for sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve a token to a live session.
    async fn validate_session(&self, token: &str) -> Result<Session, SessionError>;
}

/// Failure loading sessions from a file.
#[derive(Debug, Error)]
pub enum SessionFileError {
    /// The file could not be read.
    #[error("failed to read sessions file: {0}")]
    Io(#[from] std::io::Error),
    /// The file is not a JSON array of sessions.
    #[error("failed to parse sessions file: {0}")]
    Json(#[from] serde_json::Error),
}

/// Sessions held in memory, keyed by token.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    by_token: RwLock<HashMap<String, Session>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `sessions`.
    pub fn with_sessions(sessions: impl IntoIterator<Item = Session>) -> Self {
        let store = Self::new();
        for session in sessions {
            store.insert(session);
        }
        store
    }

    /// Load a JSON array of sessions.
    pub fn from_json_file(path: &Path) -> Result<Self, SessionFileError> {
        let content = std::fs::read_to_string(path)?;
        let sessions: Vec<Session> = serde_json::from_str(&content)?;
        debug!(?path, count = sessions.len(), "loaded sessions");
        Ok(Self::with_sessions(sessions))
    }

    /// Add or replace a session.
    pub fn insert(&self, session: Session) {
        let _ = self.by_token.write().insert(session.token.clone(), session);
    }

    /// Revoke a session by token. Returns it if it existed.
    pub fn revoke(&self, token: &str) -> Option<Session> {
        self.by_token.write().remove(token)
    }

    /// Look up a session by id.
    pub fn find_by_id(&self, id: &SessionId) -> Option<Session> {
        self.by_token
            .read()
            .values()
            .find(|s| &s.id == id)
            .cloned()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.by_token.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.by_token.read().is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn validate_session(&self, token: &str) -> Result<Session, SessionError> {
        let session = self
            .by_token
            .read()
            .get(token)
            .cloned()
            .ok_or(SessionError::NotFound)?;
        if session.is_expired() {
            return Err(SessionError::Expired);
        }
        Ok(session)
    }
}
