//! Collector configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MetricsError, Result};

/// Default minimum wall-clock time between two metric copies.
pub const DEFAULT_COLLECT_INTERVAL_S: f64 = 5.0;

/// Configuration for [`AsyncMetricsCollector`](crate::AsyncMetricsCollector).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Minimum seconds between two issued copies.
    pub collect_interval_s: f64,
    /// Force pinned (`Some(true)`) or pageable (`Some(false)`) host mirrors.
    /// `None` uses pinned memory whenever the backend supports it.
    pub pin_memory: Option<bool>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            collect_interval_s: DEFAULT_COLLECT_INTERVAL_S,
            pin_memory: None,
        }
    }
}

impl CollectorConfig {
    /// Set the collection interval in seconds.
    pub fn interval(mut self, seconds: f64) -> Self {
        self.collect_interval_s = seconds;
        self
    }

    /// Force pinned or pageable host mirrors.
    pub fn pin_memory(mut self, pinned: bool) -> Self {
        self.pin_memory = Some(pinned);
        self
    }

    /// Check that the interval is a finite, non-negative number of seconds.
    pub fn validate(&self) -> Result<()> {
        if !self.collect_interval_s.is_finite() || self.collect_interval_s < 0.0 {
            return Err(MetricsError::InvalidConfig(format!(
                "collect_interval_s must be finite and >= 0, got {}",
                self.collect_interval_s
            )));
        }
        Ok(())
    }

    /// Load and validate a JSON config file. Missing keys take their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: CollectorConfig = serde_json::from_str(&text)?;
        config.validate()?;
        info!(
            path = %path.display(),
            interval_s = config.collect_interval_s,
            pin_memory = ?config.pin_memory,
            "Loaded collector config"
        );
        Ok(config)
    }
}
