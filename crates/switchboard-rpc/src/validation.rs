//! Parameter helpers and client-facing error sanitization.

use serde_json::Value;
use switchboard_core::RequestEnvelope;

use crate::errors::RpcError;

/// Maximum general string parameter length (8 KB).
pub const MAX_PARAM_LENGTH: usize = 8_192;

/// Read a required, non-empty string parameter.
pub fn required_str<'a>(req: &'a RequestEnvelope, name: &str) -> Result<&'a str, RpcError> {
    match req.str_param(name) {
        Some(v) if !v.is_empty() => {
            validate_string_param(req, name, v, MAX_PARAM_LENGTH)?;
            Ok(v)
        }
        _ => Err(invalid_param(req, name)),
    }
}

/// Read an optional string parameter. Present but not a string is an error.
pub fn optional_str<'a>(req: &'a RequestEnvelope, name: &str) -> Result<Option<&'a str>, RpcError> {
    match req.data.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(v)) => {
            validate_string_param(req, name, v, MAX_PARAM_LENGTH)?;
            Ok(Some(v.as_str()))
        }
        Some(_) => Err(invalid_param(req, name)),
    }
}

/// Reject strings longer than `max_len` bytes.
pub fn validate_string_param(
    req: &RequestEnvelope,
    name: &str,
    value: &str,
    max_len: usize,
) -> Result<(), RpcError> {
    if value.len() > max_len {
        return Err(invalid_param(req, name));
    }
    Ok(())
}

fn invalid_param(req: &RequestEnvelope, name: &str) -> RpcError {
    RpcError::InvalidParam {
        action: req.action.clone(),
        name: name.to_owned(),
    }
}

/// Message shown to the client for an error.
///
/// Internal errors become a fixed string; application errors keep only
/// their client-safe message.
pub fn sanitize_error_message(err: &RpcError) -> String {
    match err {
        RpcError::Internal { .. } => "Internal error".to_string(),
        RpcError::Handler(app) => app.message.clone(),
        other => other.to_string(),
    }
}
