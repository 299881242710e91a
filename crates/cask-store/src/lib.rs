//! File-based blob storage engine for Cask.
//!
//! A [`FileBlobStore`] persists arbitrary binary blobs under one root
//! directory. Each blob is a content file plus an attributes sidecar, placed
//! by a [`LocationStrategy`] derived from the blob id. Lifecycle state lives
//! in a [`BlobMetadataStore`](cask_metadata::BlobMetadataStore) and store
//! totals in a [`FileMetricsStore`](cask_metrics::FileMetricsStore).
//!
//! # Write Protocol
//!
//! 1. Register the id in state `Creating`.
//! 2. Stream content into the ingest directory, hashing as it goes.
//! 3. Write the attributes sidecar next to it.
//! 4. Move both into place: atomic rename where the filesystem allows,
//!    plain move otherwise.
//! 5. Mark `Alive` and count the blob in the metrics.
//!
//! Any failure removes every file of the attempt and its metadata.
//!
//! # Deletion
//!
//! Soft deletes mark blobs `MarkedForDeletion` and leave the files;
//! [`FileBlobStore::compact_with_report`] purges them later. Hard deletes
//! remove everything immediately. A compaction given a [`BlobUsageChecker`]
//! restores marked blobs that are still referenced instead of purging them.
//!
//! # Direct-Path Blobs
//!
//! A blob created with `BlobStore.direct-path: true` gets the id
//! `path$<blob-name>` and lives at `content/directpath/<blob-name>`.
//! Creating it again overwrites the previous content in place.

pub mod blob;
pub mod config;
pub mod directories;
pub mod error;
pub mod fileops;
pub mod location;
pub mod retry;
pub mod store;
pub mod traits;

pub use blob::{Blob, BlobStream, FileBlob, ReaderGuard, ReaderRegistry};
pub use config::{validate_configs, CaskConfig, StoreConfig, DEFAULT_NODE_ID};
pub use directories::{ApplicationDirectories, FixedDirectories, BLOBS_DIRECTORY};
pub use error::{ConfigError, StoreError, StoreResult};
pub use fileops::{FileOpError, FileOpResult, FileOperations, SimpleFileOperations, StreamMetrics};
pub use location::{
    BlobIdLocationResolver, DateBasedLocationStrategy, DirectPathLocationStrategy, LayoutKind,
    LocationStrategy, TemporaryLocationStrategy, VolumeChapterLocationStrategy,
    BLOB_ATTRIBUTE_SUFFIX, BLOB_CONTENT_SUFFIX, DIRECT_PATH_DIR, TEMPORARY_DIR,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use store::{
    CompactReport, FileBlobStore, FileBlobStoreBuilder, StoreState, SweepReport,
    CONTENT_DIRECTORY, FILE_V1, INGEST_DIRECTORY, METADATA_FILENAME,
};
pub use traits::{BlobStore, BlobUsageChecker};
