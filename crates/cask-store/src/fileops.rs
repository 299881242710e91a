use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Size and SHA-1 of content written in a single pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMetrics {
    pub size: u64,
    /// Lowercase hex digest.
    pub sha1: String,
}

/// Errors from file primitives.
///
/// `AtomicMoveNotSupported` and `HardLinkNotSupported` are distinct so that
/// callers can fall back instead of failing.
#[derive(Debug, thiserror::Error)]
pub enum FileOpError {
    #[error("atomic move from {src} to {dst} not supported: {reason}")]
    AtomicMoveNotSupported {
        src: PathBuf,
        dst: PathBuf,
        reason: String,
    },

    #[error("hard link from {src} to {dst} not supported: {reason}")]
    HardLinkNotSupported {
        src: PathBuf,
        dst: PathBuf,
        reason: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileOpError {
    pub fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result alias for file primitives.
pub type FileOpResult<T> = Result<T, FileOpError>;

/// Low-level durable file primitives used by the engine.
///
/// Every operation writing to `dst` creates missing parent directories.
pub trait FileOperations: Send + Sync {
    /// Stream `data` into a new file, computing size and SHA-1 on the way.
    /// The file is fsynced before returning.
    fn create(&self, path: &Path, data: &mut dyn Read) -> FileOpResult<StreamMetrics>;

    /// Add a second directory entry for `src` at `dst`.
    fn hard_link(&self, src: &Path, dst: &Path) -> FileOpResult<()>;

    /// Copy bytes from `src` to a new file at `dst`.
    fn copy(&self, src: &Path, dst: &Path) -> FileOpResult<()>;

    /// Move `src` to `dst`, copying and deleting when a rename is impossible.
    fn move_file(&self, src: &Path, dst: &Path) -> FileOpResult<()>;

    /// Rename `src` to `dst` atomically, or fail with
    /// [`FileOpError::AtomicMoveNotSupported`].
    fn move_atomic(&self, src: &Path, dst: &Path) -> FileOpResult<()>;

    fn exists(&self, path: &Path) -> bool;

    /// Delete a file. Returns `false` when there was nothing to delete.
    fn delete(&self, path: &Path) -> FileOpResult<bool>;

    /// Delete a file, logging instead of failing.
    fn delete_quietly(&self, path: &Path) -> bool {
        match self.delete(path) {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "quiet delete failed");
                false
            }
        }
    }

    /// Remove every empty directory under and including `dir`.
    ///
    /// Returns `true` when `dir` itself is gone afterwards. Files are never
    /// touched.
    fn delete_empty_directory(&self, dir: &Path) -> FileOpResult<bool>;

    fn open_input(&self, path: &Path) -> FileOpResult<File>;
}

/// [`FileOperations`] over `std::fs`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleFileOperations;

impl SimpleFileOperations {
    fn ensure_parent(path: &Path) -> FileOpResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FileOpError::io(parent, e))?;
        }
        Ok(())
    }

    fn copy_and_sync(src: &Path, dst: &Path) -> FileOpResult<()> {
        fs::copy(src, dst).map_err(|e| FileOpError::io(src, e))?;
        File::open(dst)
            .and_then(|f| f.sync_all())
            .map_err(|e| FileOpError::io(dst, e))
    }
}

impl FileOperations for SimpleFileOperations {
    fn create(&self, path: &Path, data: &mut dyn Read) -> FileOpResult<StreamMetrics> {
        Self::ensure_parent(path)?;
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| FileOpError::io(path, e))?;
        let mut out = BufWriter::new(file);
        let mut hasher = Sha1::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match data.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(FileOpError::io(path, e)),
            };
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).map_err(|e| FileOpError::io(path, e))?;
            size += n as u64;
        }
        out.flush().map_err(|e| FileOpError::io(path, e))?;
        out.get_ref()
            .sync_all()
            .map_err(|e| FileOpError::io(path, e))?;

        let sha1 = hex::encode(hasher.finalize());
        trace!(path = %path.display(), size, %sha1, "stream written");
        Ok(StreamMetrics { size, sha1 })
    }

    fn hard_link(&self, src: &Path, dst: &Path) -> FileOpResult<()> {
        Self::ensure_parent(dst)?;
        fs::hard_link(src, dst).map_err(|e| {
            if e.kind() == io::ErrorKind::Unsupported || is_cross_device(&e) || is_not_permitted(&e) {
                FileOpError::HardLinkNotSupported {
                    src: src.to_path_buf(),
                    dst: dst.to_path_buf(),
                    reason: e.to_string(),
                }
            } else {
                FileOpError::io(dst, e)
            }
        })?;
        trace!(src = %src.display(), dst = %dst.display(), "hard linked");
        Ok(())
    }

    fn copy(&self, src: &Path, dst: &Path) -> FileOpResult<()> {
        Self::ensure_parent(dst)?;
        Self::copy_and_sync(src, dst)?;
        trace!(src = %src.display(), dst = %dst.display(), "copied");
        Ok(())
    }

    fn move_file(&self, src: &Path, dst: &Path) -> FileOpResult<()> {
        Self::ensure_parent(dst)?;
        match fs::rename(src, dst) {
            Ok(()) => Ok(()),
            Err(e) if is_cross_device(&e) => {
                debug!(src = %src.display(), dst = %dst.display(), "rename crosses devices; copying");
                Self::copy_and_sync(src, dst)?;
                fs::remove_file(src).map_err(|e| FileOpError::io(src, e))
            }
            Err(e) => Err(FileOpError::io(src, e)),
        }
    }

    fn move_atomic(&self, src: &Path, dst: &Path) -> FileOpResult<()> {
        Self::ensure_parent(dst)?;
        fs::rename(src, dst).map_err(|e| {
            if is_cross_device(&e) || e.kind() == io::ErrorKind::Unsupported {
                FileOpError::AtomicMoveNotSupported {
                    src: src.to_path_buf(),
                    dst: dst.to_path_buf(),
                    reason: e.to_string(),
                }
            } else {
                FileOpError::io(src, e)
            }
        })
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn delete(&self, path: &Path) -> FileOpResult<bool> {
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FileOpError::io(path, e)),
        }
    }

    fn delete_empty_directory(&self, dir: &Path) -> FileOpResult<bool> {
        if !dir.exists() {
            return Ok(true);
        }
        for entry in WalkDir::new(dir).contents_first(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                FileOpError::Io {
                    path,
                    source: e.into(),
                }
            })?;
            if !entry.file_type().is_dir() {
                continue;
            }
            match fs::remove_dir(entry.path()) {
                Ok(()) => trace!(dir = %entry.path().display(), "removed empty directory"),
                // Non-empty: holds files, or a child that held files.
                Err(_) if entry.path().read_dir().map(|mut d| d.next().is_some()).unwrap_or(false) => {}
                Err(e) => return Err(FileOpError::io(entry.path(), e)),
            }
        }
        Ok(!dir.exists())
    }

    fn open_input(&self, path: &Path) -> FileOpResult<File> {
        File::open(path).map_err(|e| FileOpError::io(path, e))
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(not(unix))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn is_not_permitted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EPERM) | Some(libc::EMLINK))
}

#[cfg(not(unix))]
fn is_not_permitted(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::PermissionDenied
}
