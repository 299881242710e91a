use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use cask_metadata::BlobAttributes;
use cask_types::{BlobId, Headers, StoreMetrics};

use crate::blob::Blob;
use crate::error::StoreResult;

/// Blob storage engine.
///
/// All implementations must satisfy these invariants:
/// - `get` only ever returns blobs in state `Alive`.
/// - A failed create leaves no content, attributes or metadata behind.
/// - Deleting an unknown or already deleted blob is `Ok(false)`, not an error.
/// - Metrics are eventually consistent: additions and deletions are visible
///   in `metrics()` immediately and on disk after the next flush.
pub trait BlobStore: Send + Sync {
    /// Ingest a stream, computing its size and SHA-1.
    fn create(&self, data: &mut dyn Read, headers: Headers) -> StoreResult<Arc<dyn Blob>>;

    /// Ingest an existing file whose size and SHA-1 are already known.
    ///
    /// The file is hard-linked where possible, so later changes to `source`
    /// show through in the blob.
    fn create_from_file(
        &self,
        source: &Path,
        headers: Headers,
        size: u64,
        sha1: &str,
    ) -> StoreResult<Arc<dyn Blob>>;

    /// New blob with the content and metrics of `source` and fresh `headers`.
    fn copy(&self, source: &BlobId, headers: Headers) -> StoreResult<Arc<dyn Blob>>;

    /// The blob if it is `Alive`.
    fn get(&self, id: &BlobId) -> StoreResult<Option<Arc<dyn Blob>>>;

    /// The blob if its files still exist, even when marked for deletion.
    fn get_including_deleted(&self, id: &BlobId) -> StoreResult<Option<Arc<dyn Blob>>>;

    /// Mark for deletion. Files stay until [`compact`](Self::compact).
    fn delete(&self, id: &BlobId, reason: &str) -> StoreResult<bool>;

    /// Remove files and metadata now, regardless of open streams.
    fn delete_hard(&self, id: &BlobId) -> StoreResult<bool>;

    /// Purge blobs marked for deletion.
    fn compact(&self) -> StoreResult<()>;

    /// Restore a blob marked for deletion if `in_use` still references it.
    ///
    /// Returns whether the blob was (or, with `dry_run`, would be) restored.
    /// Without a checker nothing is restored.
    fn undelete(
        &self,
        in_use: Option<&dyn BlobUsageChecker>,
        id: &BlobId,
        dry_run: bool,
    ) -> StoreResult<bool>;

    /// Replace the attributes of an existing blob, adjusting the metrics
    /// when its state or size changes. `Ok(false)` if there is no such blob.
    fn set_blob_attributes(&self, id: &BlobId, attributes: BlobAttributes) -> StoreResult<bool>;

    fn metrics(&self) -> StoreResult<StoreMetrics>;

    /// Whether an attributes file exists for `id`, in any state.
    fn exists(&self, id: &BlobId) -> bool;

    /// Writable and with free space left.
    fn is_storage_available(&self) -> bool;
}

/// Answers whether a blob marked for deletion is still referenced, so
/// compaction restores it instead of purging it.
pub trait BlobUsageChecker: Send + Sync {
    fn in_use(&self, store: &str, id: &BlobId, blob_name: Option<&str>) -> bool;
}
