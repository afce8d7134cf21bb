use thiserror::Error;

/// Result type alias for metrics collection operations.
pub type Result<T> = std::result::Result<T, MetricsError>;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("{backend} runtime not available: {reason}")]
    BackendUnavailable {
        backend: &'static str,
        reason: String,
    },

    #[error("{backend} {op} failed: {message}")]
    Device {
        backend: &'static str,
        op: &'static str,
        message: String,
    },

    #[error("{backend} backend received a {handle} created by another backend")]
    ForeignHandle {
        backend: &'static str,
        handle: &'static str,
    },

    #[error("Invalid device rank {rank}: {count} device(s) visible")]
    InvalidRank { rank: usize, count: usize },

    #[error("Invalid branch length: {0} (must be at least 1)")]
    InvalidBranchLength(usize),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MetricsError {
    /// Shorthand for a failed backend call.
    pub(crate) fn device(backend: &'static str, op: &'static str, message: impl Into<String>) -> Self {
        MetricsError::Device {
            backend,
            op,
            message: message.into(),
        }
    }
}
