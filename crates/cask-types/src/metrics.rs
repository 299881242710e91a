use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-blob metrics, computed once at write time.
///
/// Zero values are legal: `created_ms == 0` means unknown, and an empty blob
/// has `content_size == 0`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobMetrics {
    /// Creation time in milliseconds since the UNIX epoch.
    pub created_ms: i64,
    /// SHA-1 of the content, lowercase hex.
    pub sha1: Option<String>,
    /// Content length in bytes.
    pub content_size: u64,
}

impl BlobMetrics {
    pub fn new(created_ms: i64, sha1: Option<String>, content_size: u64) -> Self {
        Self {
            created_ms,
            sha1,
            content_size,
        }
    }

    /// Metrics stamped with the current wall-clock time.
    pub fn now(sha1: Option<String>, content_size: u64) -> Self {
        let created_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self::new(created_ms, sha1, content_size)
    }

    /// Creation time, if known.
    pub fn created(&self) -> Option<DateTime<Utc>> {
        if self.created_ms == 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.created_ms)
    }
}

/// Aggregate view over a whole store.
///
/// Derived and eventually consistent: counters are flushed periodically and
/// summed across all nodes sharing the storage root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub blob_count: u64,
    pub total_size: u64,
    /// Free bytes on the volume holding the store.
    pub available_space: u64,
}

impl StoreMetrics {
    pub fn new(blob_count: u64, total_size: u64, available_space: u64) -> Self {
        Self {
            blob_count,
            total_size,
            available_space,
        }
    }
}
