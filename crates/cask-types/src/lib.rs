//! Foundation types for the Cask blob store.
//!
//! Every other Cask crate depends on `cask-types`. Nothing in here performs
//! I/O; these are the values that flow between the metadata store, the
//! metrics store and the storage engine.
//!
//! # Key Types
//!
//! - [`BlobId`]: Opaque blob identifier (UUID v7, optionally `tmp$`-prefixed,
//!   or `path$<name>` for direct-path blobs)
//! - [`Headers`]: Ordered header map with nullable values and reserved keys
//! - [`BlobMetrics`]: Creation time, content length and SHA-1 of one blob
//! - [`StoreMetrics`]: Aggregate, eventually consistent view of a whole store
//! - [`LifecycleState`]: `Creating → Alive → MarkedForDeletion`

pub mod error;
pub mod headers;
pub mod id;
pub mod metrics;
pub mod state;

pub use error::TypeError;
pub use headers::{
    Headers, BLOB_NAME_HEADER, CONTENT_TYPE_HEADER, CREATED_BY_HEADER, CREATED_BY_IP_HEADER,
    DIRECT_PATH_BLOB_HEADER, TEMPORARY_BLOB_HEADER,
};
pub use id::{BlobId, DIRECT_PATH_BLOB_ID_PREFIX, TEMPORARY_BLOB_ID_PREFIX};
pub use metrics::{BlobMetrics, StoreMetrics};
pub use state::LifecycleState;
