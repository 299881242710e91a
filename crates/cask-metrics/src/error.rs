use std::path::PathBuf;

/// Errors from metrics operations.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The storage directory cannot be read; metrics are unknown, not zero.
    #[error("metrics not available for {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A metrics properties file holds a malformed value.
    #[error("malformed metrics file {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },

    /// Soft quota configuration rejected by validation.
    #[error("invalid soft quota: {0}")]
    InvalidQuota(String),

    /// The periodic job service has no runtime to run on.
    #[error("no async runtime available: {0}")]
    NoRuntime(String),

    /// I/O error while persisting counters.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for metrics operations.
pub type MetricsResult<T> = Result<T, MetricsError>;
