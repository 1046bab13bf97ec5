//! `tracing` subscriber setup.
//!
//! All crates log through `tracing` macros with structured fields
//! (`conn_id`, `user_id`, `action`, `seq`, `shard`). The binary installs the
//! subscriber once at startup; `RUST_LOG` takes precedence over the
//! configured level.

use tracing_subscriber::EnvFilter;

/// Output format for the stderr subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl LogFormat {
    /// Pick the format from a `json` flag.
    pub fn from_json_flag(json: bool) -> Self {
        if json { Self::Json } else { Self::Compact }
    }
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Initialize the global tracing subscriber writing to stderr.
///
/// Subsequent calls are no-ops.
pub fn init_subscriber(level: &str, format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr);

    // try_init fails only when a global subscriber already exists
    let _ = match format {
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}
