//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchboardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `SWITCHBOARD_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::SwitchboardSettings;

/// Resolve the default settings file (`~/.switchboard/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchboard").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<SwitchboardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid final
/// configuration is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchboardSettings> {
    let mut settings = load_file_layer(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<SwitchboardSettings> {
    let defaults = serde_json::to_value(SwitchboardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SWITCHBOARD_*` process environment overrides.
pub fn apply_env_overrides(settings: &mut SwitchboardSettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range, booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut SwitchboardSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHBOARD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("SWITCHBOARD_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_MAX_CONNECTIONS", 1, 10_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_HEARTBEAT_INTERVAL_MS", 100, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_HEARTBEAT_TIMEOUT_MS", 100, 3_600_000) {
        settings.server.heartbeat_timeout_ms = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }

    // ── Hub ─────────────────────────────────────────────────────────
    if let Some(v) = env.usize("SWITCHBOARD_SHARD_COUNT", 0, 4096) {
        settings.hub.shard_count = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_SHARD_INBOX_CAPACITY", 1, 1_048_576) {
        settings.hub.shard_inbox_capacity = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_OUTBOUND_QUEUE_CAPACITY", 1, 1_048_576) {
        settings.hub.outbound_queue_capacity = v;
    }
    if let Some(v) = env.u64("SWITCHBOARD_SLOW_CONSUMER_THRESHOLD", 1, 10_000) {
        // range-checked above, always fits
        settings.hub.slow_consumer_threshold = u32::try_from(v).unwrap_or(u32::MAX);
    }
    if let Some(v) = env.u64("SWITCHBOARD_MAX_BACKLOG_AGE_MS", 1, 3_600_000) {
        settings.hub.max_backlog_age_ms = v;
    }

    // ── Requests ────────────────────────────────────────────────────
    if let Some(v) = env.u64("SWITCHBOARD_HANDLER_TIMEOUT_MS", 1, 3_600_000) {
        settings.rpc.handler_timeout_ms = v;
    }
    if let Some(v) = env.usize("SWITCHBOARD_MAX_INFLIGHT_REQUESTS", 1, 10_000) {
        settings.rpc.max_inflight_requests = v;
    }

    // ── Cluster ─────────────────────────────────────────────────────
    if let Some(v) = env.bool("SWITCHBOARD_CLUSTER_ENABLED") {
        settings.cluster.enabled = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_NODE_ID") {
        settings.cluster.node_id = v;
    }
    if let Some(v) = env.string("SWITCHBOARD_CLUSTER_PEERS") {
        settings.cluster.peers = parse_list(&v);
    }
    if let Some(v) = env.string("SWITCHBOARD_CLUSTER_SECRET") {
        settings.cluster.secret = Some(v);
    }

    // ── Auth / logging ──────────────────────────────────────────────
    if let Some(v) = env.string("SWITCHBOARD_SESSIONS_FILE") {
        settings.auth.sessions_file = Some(v);
    }
    if let Some(v) = env.string("SWITCHBOARD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("SWITCHBOARD_LOG_JSON") {
        settings.logging.json = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Split a comma-separated list, trimming entries and dropping empty ones.
pub fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}
