use std::path::PathBuf;

use cask_metadata::MetadataError;
use cask_metrics::MetricsError;
use cask_types::{BlobId, TypeError};

use crate::fileops::FileOpError;

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Operation requires a started store.
    #[error("blob store {0} is not started")]
    NotStarted(String),

    /// Operation requires a store that is not started.
    #[error("blob store {0} must be stopped first")]
    StillStarted(String),

    /// No live blob with this id.
    #[error("blob {0} not found")]
    NotFound(BlobId),

    /// A failure while operating on one blob. Request-fatal; not retried.
    #[error("blob {id}: {source}")]
    Blob {
        id: BlobId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Freshly assigned id already has content on disk.
    #[error("blob id collision: {0} already exists")]
    Collision(BlobId),

    #[error("cannot find a free blob id after {0} attempts")]
    NoFreeBlobId(u32),

    /// `metadata.properties` names a type this engine does not handle.
    #[error("unsupported blob store type {found:?} in {path}")]
    UnsupportedType { found: Option<String>, path: PathBuf },

    #[error("invalid blob id: {0}")]
    InvalidId(#[from] TypeError),

    /// Direct-path blob name or listing prefix that cannot be used.
    #[error("invalid direct path {path:?}: {reason}")]
    InvalidDirectPath { path: String, reason: &'static str },

    #[error(transparent)]
    FileOp(#[from] FileOpError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Attach a blob id to an underlying failure.
    pub fn blob(id: &BlobId, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Blob {
            id: id.clone(),
            source: source.into(),
        }
    }

    /// The blob this error concerns, where known.
    pub fn blob_id(&self) -> Option<&BlobId> {
        match self {
            Self::NotFound(id) | Self::Blob { id, .. } | Self::Collision(id) => Some(id),
            _ => None,
        }
    }
}

/// Result alias for blob store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store configuration rejected before any store is activated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("blob store name must not be empty")]
    EmptyName,

    #[error("blob store {0} has an empty path")]
    EmptyPath(String),

    #[error("blob store {0}: path must not contain '..'")]
    PathTraversal(String),

    #[error("duplicate blob store name {0}")]
    DuplicateName(String),

    #[error("blob stores {first} and {second} share the path {path}")]
    DuplicatePath {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error("blob store {first} at {outer} contains blob store {second} at {inner}")]
    NestedPath {
        outer: PathBuf,
        inner: PathBuf,
        first: String,
        second: String,
    },

    #[error("blob store {name}: metrics flush interval must be at least 1 second")]
    FlushInterval { name: String },

    #[error("blob store {name}: {source}")]
    Quota {
        name: String,
        #[source]
        source: MetricsError,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}
