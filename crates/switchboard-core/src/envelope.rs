//! Request/response envelopes exchanged over a WebSocket connection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Application-level RPC call sent by a client over its connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Action name (e.g. `user_typing`).
    pub action: String,
    /// Caller-assigned sequence number, echoed in the response.
    pub seq: i64,
    /// Action parameters.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl RequestEnvelope {
    /// Build a request with empty data.
    pub fn new(action: impl Into<String>, seq: i64) -> Self {
        Self {
            action: action.into(),
            seq,
            data: Map::new(),
        }
    }

    /// Attach a data field.
    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        let _ = self.data.insert(key.into(), value);
        self
    }

    /// Read a string parameter.
    pub fn str_param(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(Value::as_str)
    }
}

/// Outcome marker on a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The action succeeded.
    #[serde(rename = "OK")]
    Ok,
    /// The action failed; `error` is populated.
    #[serde(rename = "FAIL")]
    Fail,
}

/// Client-visible error detail. Carries no internal diagnostics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable machine-readable error id.
    pub id: String,
    /// Human-readable message.
    pub message: String,
    /// HTTP-equivalent status code.
    pub status_code: u16,
}

/// Reply to a [`RequestEnvelope`], delivered to the issuing connection only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoed request sequence number.
    pub seq: i64,
    /// Success or failure.
    pub status: ResponseStatus,
    /// Result payload (present on success when the handler returned data).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Error payload (present on failure).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ResponseEnvelope {
    /// Build a success response. A `null` payload is omitted on the wire.
    pub fn ok(seq: i64, data: Value) -> Self {
        Self {
            seq,
            status: ResponseStatus::Ok,
            data: (!data.is_null()).then_some(data),
            error: None,
        }
    }

    /// Build a failure response.
    pub fn fail(seq: i64, error: ErrorBody) -> Self {
        Self {
            seq,
            status: ResponseStatus::Fail,
            data: None,
            error: Some(error),
        }
    }

    /// Whether this response reports success.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }
}
