use cask_types::{BlobId, TypeError};

/// Errors from metadata store operations.
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    /// No record exists for the blob.
    #[error("no metadata for blob {0}")]
    NotFound(BlobId),

    /// A record already exists for the blob.
    #[error("metadata for blob {0} already exists")]
    AlreadyExists(BlobId),

    /// The record does not start with the expected magic bytes.
    #[error("invalid record magic: {0:02x?}")]
    BadMagic([u8; 4]),

    /// The record was written by a newer, incompatible format.
    #[error("unsupported record version {0}")]
    UnsupportedVersion(u16),

    /// The record body does not match its checksum.
    #[error("record checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    /// The record is structurally invalid.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Type(#[from] TypeError),

    /// I/O error from the journal file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for metadata operations.
pub type MetadataResult<T> = Result<T, MetadataError>;
