use serde::{Deserialize, Serialize};

use cask_types::BlobId;

/// Suffix of the content file.
pub const BLOB_CONTENT_SUFFIX: &str = ".bytes";
/// Suffix of the attributes sidecar.
pub const BLOB_ATTRIBUTE_SUFFIX: &str = ".properties";
/// Directory (relative to the content root) holding temporary blobs.
pub const TEMPORARY_DIR: &str = "tmp";
/// Directory (relative to the content root) holding direct-path blobs.
pub const DIRECT_PATH_DIR: &str = "directpath";

const VOLUMES: u32 = 43;
const CHAPTERS: u32 = 47;

/// Maps a blob id to a relative storage path, without suffix.
///
/// Pure and deterministic: no I/O, same id always yields the same path.
pub trait LocationStrategy: Send + Sync {
    fn location(&self, id: &BlobId) -> String;
}

/// `vol-NN/chap-NN/<id>`, spreading permanent blobs over 43 × 47 directories.
#[derive(Clone, Copy, Debug, Default)]
pub struct VolumeChapterLocationStrategy;

impl LocationStrategy for VolumeChapterLocationStrategy {
    fn location(&self, id: &BlobId) -> String {
        let hash = crc32fast::hash(id.as_str().as_bytes());
        let vol = hash % VOLUMES + 1;
        let chap = hash % CHAPTERS + 1;
        format!("vol-{vol:02}/chap-{chap:02}/{id}")
    }
}

/// `tmp/<id>`: all temporary blobs in one reserved directory.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemporaryLocationStrategy;

impl LocationStrategy for TemporaryLocationStrategy {
    fn location(&self, id: &BlobId) -> String {
        format!("{TEMPORARY_DIR}/{id}")
    }
}

/// `directpath/<blob-name>` for `path$<blob-name>` ids.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectPathLocationStrategy;

impl LocationStrategy for DirectPathLocationStrategy {
    fn location(&self, id: &BlobId) -> String {
        match id.direct_path_name() {
            Some(name) => format!("{DIRECT_PATH_DIR}/{name}"),
            None => format!("{DIRECT_PATH_DIR}/{id}"),
        }
    }
}

/// `yyyy/MM/dd/HH/mm/<id>` from the creation time embedded in the id.
///
/// Ids without an embedded time fall back to volume/chapter placement.
#[derive(Clone, Copy, Debug, Default)]
pub struct DateBasedLocationStrategy;

impl LocationStrategy for DateBasedLocationStrategy {
    fn location(&self, id: &BlobId) -> String {
        match id.created_at() {
            Some(at) => format!("{}/{id}", at.format("%Y/%m/%d/%H/%M")),
            None => VolumeChapterLocationStrategy.location(id),
        }
    }
}

/// Layout used for permanent blobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LayoutKind {
    #[default]
    VolumeChapter,
    DateBased,
}

/// Chooses the temporary strategy for `tmp$` ids, the direct-path strategy
/// for `path$` ids and the configured permanent strategy otherwise.
pub struct BlobIdLocationResolver {
    permanent: Box<dyn LocationStrategy>,
    temporary: TemporaryLocationStrategy,
    direct_path: DirectPathLocationStrategy,
}

impl BlobIdLocationResolver {
    pub fn new(layout: LayoutKind) -> Self {
        let permanent: Box<dyn LocationStrategy> = match layout {
            LayoutKind::VolumeChapter => Box::new(VolumeChapterLocationStrategy),
            LayoutKind::DateBased => Box::new(DateBasedLocationStrategy),
        };
        Self {
            permanent,
            temporary: TemporaryLocationStrategy,
            direct_path: DirectPathLocationStrategy,
        }
    }

    pub fn with_strategy(permanent: Box<dyn LocationStrategy>) -> Self {
        Self {
            permanent,
            temporary: TemporaryLocationStrategy,
            direct_path: DirectPathLocationStrategy,
        }
    }

    pub fn location(&self, id: &BlobId) -> String {
        if id.is_temporary() {
            self.temporary.location(id)
        } else if id.is_direct_path() {
            self.direct_path.location(id)
        } else {
            self.permanent.location(id)
        }
    }
}

impl Default for BlobIdLocationResolver {
    fn default() -> Self {
        Self::new(LayoutKind::default())
    }
}

impl std::fmt::Debug for BlobIdLocationResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobIdLocationResolver").finish_non_exhaustive()
    }
}
