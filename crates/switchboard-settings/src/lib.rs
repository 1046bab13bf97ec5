//! # switchboard-settings
//!
//! Layered configuration for the Switchboard server.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`SwitchboardSettings::default()`]
//! 2. **Settings file**: `~/.switchboard/settings.json` or `--config`, deep-merged over defaults
//! 3. **Environment variables**: `SWITCHBOARD_*` overrides (highest priority)
//!
//! There is no global instance: the binary loads settings once and passes
//! the pieces each component needs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path,
    settings_path,
};
pub use types::*;
