use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cask_types::{BlobId, BlobMetrics, Headers};

use crate::error::{StoreError, StoreResult};
use crate::fileops::{FileOpError, FileOperations};

/// A stored blob: identity, headers, metrics and readable content.
///
/// Holding a `Blob` or one of its streams does not keep the blob alive; a
/// hard delete removes it regardless.
pub trait Blob: Send + Sync {
    fn id(&self) -> &BlobId;

    fn headers(&self) -> &Headers;

    fn metrics(&self) -> &BlobMetrics;

    /// Open a fresh stream over the content.
    fn input_stream(&self) -> StoreResult<Box<dyn Read + Send>>;
}

/// Open content streams per blob, so compaction can skip blobs in use.
#[derive(Debug, Default)]
pub struct ReaderRegistry {
    open: Mutex<HashMap<BlobId, usize>>,
}

impl ReaderRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquire(self: &Arc<Self>, id: &BlobId) -> ReaderGuard {
        *self
            .open
            .lock()
            .expect("reader registry mutex poisoned")
            .entry(id.clone())
            .or_insert(0) += 1;
        ReaderGuard {
            registry: Arc::clone(self),
            id: id.clone(),
        }
    }

    pub fn open_readers(&self, id: &BlobId) -> usize {
        self.open
            .lock()
            .expect("reader registry mutex poisoned")
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    fn release(&self, id: &BlobId) {
        let mut open = self.open.lock().expect("reader registry mutex poisoned");
        if let Some(count) = open.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                open.remove(id);
            }
        }
    }
}

/// Registration of one open stream. Released on drop.
#[derive(Debug)]
pub struct ReaderGuard {
    registry: Arc<ReaderRegistry>,
    id: BlobId,
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.registry.release(&self.id);
    }
}

/// Content stream of a [`FileBlob`].
#[derive(Debug)]
pub struct BlobStream {
    file: File,
    _guard: ReaderGuard,
}

impl Read for BlobStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

/// Blob backed by a content file in a [`FileBlobStore`](crate::FileBlobStore).
pub struct FileBlob {
    id: BlobId,
    headers: Headers,
    metrics: BlobMetrics,
    content_path: PathBuf,
    readers: Arc<ReaderRegistry>,
    file_ops: Arc<dyn FileOperations>,
}

impl FileBlob {
    pub(crate) fn new(
        id: BlobId,
        headers: Headers,
        metrics: BlobMetrics,
        content_path: PathBuf,
        readers: Arc<ReaderRegistry>,
        file_ops: Arc<dyn FileOperations>,
    ) -> Self {
        Self {
            id,
            headers,
            metrics,
            content_path,
            readers,
            file_ops,
        }
    }

    pub fn content_path(&self) -> &Path {
        &self.content_path
    }

    /// Open the content as a concrete [`BlobStream`].
    pub fn open(&self) -> StoreResult<BlobStream> {
        let file = self.file_ops.open_input(&self.content_path).map_err(|e| match e {
            FileOpError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound => {
                StoreError::blob(&self.id, "blob has been deleted")
            }
            other => StoreError::blob(&self.id, other),
        })?;
        Ok(BlobStream {
            file,
            _guard: self.readers.acquire(&self.id),
        })
    }
}

impl Blob for FileBlob {
    fn id(&self) -> &BlobId {
        &self.id
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn metrics(&self) -> &BlobMetrics {
        &self.metrics
    }

    fn input_stream(&self) -> StoreResult<Box<dyn Read + Send>> {
        Ok(Box::new(self.open()?))
    }
}

impl std::fmt::Debug for FileBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlob")
            .field("id", &self.id)
            .field("content_path", &self.content_path)
            .field("size", &self.metrics.content_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileops::SimpleFileOperations;

    fn blob(path: PathBuf, readers: &Arc<ReaderRegistry>) -> FileBlob {
        FileBlob::new(
            BlobId::new(),
            Headers::new(),
            BlobMetrics::now(None, 3),
            path,
            Arc::clone(readers),
            Arc::new(SimpleFileOperations),
        )
    }

    #[test]
    fn streams_are_counted_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bytes");
        std::fs::write(&path, b"abc").unwrap();
        let readers = ReaderRegistry::new();
        let blob = blob(path, &readers);

        let mut first = blob.input_stream().unwrap();
        let second = blob.open().unwrap();
        assert_eq!(readers.open_readers(blob.id()), 2);

        let mut buf = String::new();
        first.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "abc");

        drop(first);
        drop(second);
        assert_eq!(readers.open_readers(blob.id()), 0);
    }

    #[test]
    fn missing_content_reports_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let readers = ReaderRegistry::new();
        let blob = blob(dir.path().join("gone.bytes"), &readers);
        let err = blob.input_stream().err().unwrap();
        assert_eq!(err.blob_id(), Some(blob.id()));
        assert!(err.to_string().contains("deleted"));
        assert_eq!(readers.open_readers(blob.id()), 0);
    }
}
