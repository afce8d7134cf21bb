//! Shared CLI utilities for the spec-metrics binary.

pub mod backend;

use std::path::Path;

use crate::config::CollectorConfig;
use crate::error::Result;

/// Initialize tracing/logging to stderr.
///
/// If `disable` is true, no output is produced.
/// Otherwise respects `RUST_LOG` env var, defaulting to WARN.
pub fn init_logging(disable: bool) {
    use tracing_subscriber::EnvFilter;

    if disable {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Build the collector config from an optional JSON file plus flag overrides.
///
/// Flags win over the file; the result is validated either way.
pub fn load_config(
    file: Option<&Path>,
    interval_s: Option<f64>,
    pin_memory: Option<bool>,
) -> Result<CollectorConfig> {
    let mut config = match file {
        Some(path) => CollectorConfig::from_json_file(path)?,
        None => CollectorConfig::default(),
    };
    if let Some(seconds) = interval_s {
        config = config.interval(seconds);
    }
    if let Some(pinned) = pin_memory {
        config = config.pin_memory(pinned);
    }
    config.validate()?;
    Ok(config)
}
