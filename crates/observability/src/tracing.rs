//! Tracing/logging initialization.
//!
//! The filter comes from `RUST_LOG` and defaults to `info`. Library crates only
//! emit events; installing a subscriber is left to the binary.

use serde::Deserialize;
use tracing_subscriber::EnvFilter;

/// Shape of emitted log lines.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// One JSON object per line, with timestamps.
    #[default]
    Json,
    /// Human-readable multi-line output for local runs.
    Pretty,
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global subscriber. Later calls (or an already installed
/// subscriber) leave the existing one in place.
pub fn init(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_thread_names(true);

    let _ = match format {
        LogFormat::Json => builder
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
}
