use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use cask_metadata::{
    record, BlobAttributes, BlobMetadataStore, CompactStats, JournalMetadataStore, JournalSync,
    MetadataError, JOURNAL_FILE_NAME,
};
use cask_metrics::{
    available_space, FileMetricsStore, NodeAccess, PeriodicJobService, Properties, QuotaService,
    SoftQuotaService, StaticNodeAccess, TokioJobService,
};
use cask_types::{BlobId, BlobMetrics, Headers, LifecycleState, StoreMetrics};

use crate::blob::{Blob, FileBlob, ReaderRegistry};
use crate::config::StoreConfig;
use crate::directories::ApplicationDirectories;
use crate::error::{ConfigError, StoreError, StoreResult};
use crate::fileops::{FileOpError, FileOperations, SimpleFileOperations};
use crate::location::{
    BlobIdLocationResolver, BLOB_ATTRIBUTE_SUFFIX, BLOB_CONTENT_SUFFIX, DIRECT_PATH_DIR, TEMPORARY_DIR,
};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::traits::{BlobStore, BlobUsageChecker};

/// Type marker file at the store root.
pub const METADATA_FILENAME: &str = "metadata.properties";
pub const TYPE_KEY: &str = "type";
pub const FILE_V1: &str = "file/1";
/// Directory under the root holding all blob files.
pub const CONTENT_DIRECTORY: &str = "content";
/// Directory under the temporary directory holding in-flight ingests.
pub const INGEST_DIRECTORY: &str = ".ingest";

/// Store lifecycle: `New → Started ⇄ Stopped`, `Failed` when start fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreState {
    New,
    Started,
    Stopped,
    Failed,
}

/// Outcome of [`FileBlobStore::compact_with_report`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CompactReport {
    /// Blobs whose files and metadata were removed.
    pub purged: usize,
    /// Blobs skipped because a stream over them is still open.
    pub deferred: usize,
    /// Blobs restored because they are still in use.
    pub undeleted: usize,
    pub metadata: CompactStats,
}

/// Outcome of [`FileBlobStore::sweep_temporary`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub blobs: usize,
    pub ingest_files: usize,
}

enum Source<'a> {
    /// Hash and count while writing.
    Stream(&'a mut dyn Read),
    /// Trusted size and hash; hard link, else copy.
    File {
        path: &'a Path,
        size: u64,
        sha1: &'a str,
    },
    /// Content of an existing blob; hard link while the store allows it.
    Blob { path: &'a Path, metrics: BlobMetrics },
}

/// Blob store keeping content and attributes as files under one root.
///
/// ```text
/// <root>/metadata.properties              type=file/1
/// <root>/metadata.journal                 lifecycle metadata
/// <root>/<node-id>-metrics.properties     per-node counters
/// <root>/content/vol-NN/chap-NN/<id>.bytes|.properties
/// <root>/content/tmp/<tmp$id>.bytes|.properties
/// <root>/content/tmp/.ingest/...          in-flight writes
/// <root>/content/directpath/<name>.bytes|.properties
/// ```
///
/// A blob is written to the ingest directory first and moved into place, so
/// its final path only ever holds complete content.
pub struct FileBlobStore {
    name: String,
    root: PathBuf,
    content_dir: PathBuf,
    ingest_dir: PathBuf,
    config: StoreConfig,
    resolver: BlobIdLocationResolver,
    file_ops: Arc<dyn FileOperations>,
    metadata: Arc<dyn BlobMetadataStore>,
    metrics: Arc<FileMetricsStore>,
    jobs: Option<Arc<dyn PeriodicJobService>>,
    live: RwLock<HashMap<BlobId, Arc<FileBlob>>>,
    readers: Arc<ReaderRegistry>,
    supports_atomic_move: AtomicBool,
    supports_hard_link_copy: AtomicBool,
    rebuild_pending: AtomicBool,
    state: RwLock<StoreState>,
}

/// Builder for [`FileBlobStore`]. Every collaborator has a default.
pub struct FileBlobStoreBuilder {
    config: StoreConfig,
    root: Option<PathBuf>,
    dirs: Option<Arc<dyn ApplicationDirectories>>,
    file_ops: Option<Arc<dyn FileOperations>>,
    metadata: Option<Arc<dyn BlobMetadataStore>>,
    node: Option<Arc<dyn NodeAccess>>,
    quota_service: Option<Arc<dyn QuotaService>>,
    jobs: Option<Arc<dyn PeriodicJobService>>,
}

impl FileBlobStoreBuilder {
    /// Use `root` instead of resolving the configured path.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Resolve a relative configured path against these directories.
    pub fn directories(mut self, dirs: Arc<dyn ApplicationDirectories>) -> Self {
        self.dirs = Some(dirs);
        self
    }

    pub fn file_operations(mut self, file_ops: Arc<dyn FileOperations>) -> Self {
        self.file_ops = Some(file_ops);
        self
    }

    /// Replace the journal under the root with another metadata store.
    pub fn metadata_store(mut self, metadata: Arc<dyn BlobMetadataStore>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn node(mut self, node: Arc<dyn NodeAccess>) -> Self {
        self.node = Some(node);
        self
    }

    pub fn quota_service(mut self, service: Arc<dyn QuotaService>) -> Self {
        self.quota_service = Some(service);
        self
    }

    /// Scheduler for the metrics flush. Defaults to the current Tokio
    /// runtime, if any, at start.
    pub fn job_service(mut self, jobs: Arc<dyn PeriodicJobService>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    /// Validate the configuration, create the directories and open metadata.
    pub fn build(self) -> StoreResult<FileBlobStore> {
        let config = self.config;
        config.validate()?;

        let root = match (self.root, &self.dirs) {
            (Some(root), _) => root,
            (None, Some(dirs)) => config.resolve_path(dirs.as_ref()),
            (None, None) => config.path.clone(),
        };
        let content_dir = root.join(CONTENT_DIRECTORY);
        let ingest_dir = content_dir.join(TEMPORARY_DIR).join(INGEST_DIRECTORY);
        fs::create_dir_all(&ingest_dir)?;

        let quota_service: Arc<dyn QuotaService> = match self.quota_service {
            Some(service) => service,
            None => Arc::new(SoftQuotaService),
        };
        let node: Arc<dyn NodeAccess> = match self.node {
            Some(node) => node,
            None => Arc::new(StaticNodeAccess::new(config.node_id())),
        };
        let mut metrics = FileMetricsStore::new(&root, &config.name, node);
        if let Some(soft) = &config.soft_quota {
            quota_service
                .validate_soft_quota_config(soft)
                .map_err(|source| ConfigError::Quota {
                    name: config.name.clone(),
                    source,
                })?;
            metrics = metrics.with_quota(quota_service, soft.clone());
        }

        let (metadata, rebuild): (Arc<dyn BlobMetadataStore>, bool) = match self.metadata {
            Some(metadata) => (metadata, false),
            None => {
                let missing = !root.join(JOURNAL_FILE_NAME).exists();
                let sync = if config.sync_metadata {
                    JournalSync::EveryWrite
                } else {
                    JournalSync::OsDefault
                };
                let journal = JournalMetadataStore::open(&root, sync)?;
                (Arc::new(journal) as Arc<dyn BlobMetadataStore>, missing)
            }
        };

        Ok(FileBlobStore {
            name: config.name.clone(),
            root,
            content_dir,
            ingest_dir,
            resolver: BlobIdLocationResolver::new(config.layout),
            config,
            file_ops: self
                .file_ops
                .unwrap_or_else(|| Arc::new(SimpleFileOperations)),
            metadata,
            metrics: Arc::new(metrics),
            jobs: self.jobs,
            live: RwLock::new(HashMap::new()),
            readers: ReaderRegistry::new(),
            supports_atomic_move: AtomicBool::new(true),
            supports_hard_link_copy: AtomicBool::new(true),
            rebuild_pending: AtomicBool::new(rebuild),
            state: RwLock::new(StoreState::New),
        })
    }
}

impl FileBlobStore {
    pub fn builder(config: StoreConfig) -> FileBlobStoreBuilder {
        FileBlobStoreBuilder {
            config,
            root: None,
            dirs: None,
            file_ops: None,
            metadata: None,
            node: None,
            quota_service: None,
            jobs: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_dir(&self) -> &Path {
        &self.content_dir
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn state(&self) -> StoreState {
        *self.state.read().expect("lock poisoned")
    }

    pub fn metadata(&self) -> &Arc<dyn BlobMetadataStore> {
        &self.metadata
    }

    pub fn metrics_store(&self) -> &Arc<FileMetricsStore> {
        &self.metrics
    }

    pub fn supports_atomic_move(&self) -> bool {
        self.supports_atomic_move.load(Ordering::SeqCst)
    }

    pub fn supports_hard_link_copy(&self) -> bool {
        self.supports_hard_link_copy.load(Ordering::SeqCst)
    }

    // ---------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------

    /// Check the type marker, recover from an unclean shutdown and start
    /// the metrics flush. Starting a started store is a no-op.
    pub fn start(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if *state == StoreState::Started {
            return Ok(());
        }
        match self.do_start() {
            Ok(()) => {
                *state = StoreState::Started;
                info!(store = %self.name, root = %self.root.display(), "blob store started");
                Ok(())
            }
            Err(e) => {
                *state = StoreState::Failed;
                error!(store = %self.name, error = %e, "blob store failed to start");
                Err(e)
            }
        }
    }

    fn do_start(&self) -> StoreResult<()> {
        self.check_type_marker()?;
        if self.rebuild_pending.swap(false, Ordering::SeqCst) {
            self.rebuild_metadata()?;
        }
        self.purge_incomplete()?;

        let jobs = match &self.jobs {
            Some(jobs) => Some(Arc::clone(jobs)),
            None => TokioJobService::current()
                .ok()
                .map(|jobs| Arc::new(jobs) as Arc<dyn PeriodicJobService>),
        };
        match jobs {
            Some(jobs) => self
                .metrics
                .start(jobs.as_ref(), self.config.flush_interval())?,
            None => {
                debug!(store = %self.name, "no job service; metrics flush on stop only");
                self.metrics.load()?;
            }
        }
        Ok(())
    }

    /// Flush metrics and stop serving requests.
    pub fn stop(&self) -> StoreResult<()> {
        let mut state = self.state.write().expect("lock poisoned");
        if *state != StoreState::Started {
            return Err(StoreError::NotStarted(self.name.clone()));
        }
        if let Err(e) = self.metrics.stop() {
            warn!(store = %self.name, error = %e, "final metrics flush failed");
        }
        self.live.write().expect("lock poisoned").clear();
        *state = StoreState::Stopped;
        info!(store = %self.name, "blob store stopped");
        Ok(())
    }

    /// Delete the store's own files from disk.
    ///
    /// Only proceeds when the content tree holds no files. Removes the
    /// metrics files, type marker and metadata journal, then the root if
    /// nothing else is left in it.
    pub fn remove(&self) -> StoreResult<()> {
        if self.state() == StoreState::Started {
            return Err(StoreError::StillStarted(self.name.clone()));
        }
        if !self.file_ops.delete_empty_directory(&self.content_dir)? {
            warn!(
                store = %self.name,
                dir = %self.content_dir.display(),
                "content directory is not empty; blob store files left in place"
            );
            return Ok(());
        }

        self.metrics.remove()?;
        self.file_ops.delete(&self.root.join(METADATA_FILENAME))?;
        self.file_ops.delete(&self.root.join(JOURNAL_FILE_NAME))?;
        self.file_ops
            .delete_quietly(&self.root.join(format!("{JOURNAL_FILE_NAME}.tmp")));
        if self.file_ops.delete_empty_directory(&self.root)? {
            info!(store = %self.name, root = %self.root.display(), "blob store removed");
        } else {
            warn!(store = %self.name, root = %self.root.display(), "unable to delete non-empty blob store directory");
        }
        Ok(())
    }

    fn ensure_started(&self) -> StoreResult<()> {
        if self.state() == StoreState::Started {
            Ok(())
        } else {
            Err(StoreError::NotStarted(self.name.clone()))
        }
    }

    fn check_type_marker(&self) -> StoreResult<()> {
        let path = self.root.join(METADATA_FILENAME);
        if path.exists() {
            let props = Properties::load(&path)?;
            match props.get(TYPE_KEY) {
                Some(FILE_V1) => Ok(()),
                found => Err(StoreError::UnsupportedType {
                    found: found.map(str::to_string),
                    path,
                }),
            }
        } else {
            let mut props = Properties::new();
            props.set(TYPE_KEY, FILE_V1);
            props.store(&path)?;
            Ok(())
        }
    }

    /// Re-register every attributes file the metadata store does not know.
    fn rebuild_metadata(&self) -> StoreResult<usize> {
        let mut rebuilt = 0;
        let mut alive_sizes = Vec::new();
        for (id, path) in self.attribute_files(true)? {
            let attributes = match self.read_attributes(&path) {
                Ok(Some(attributes)) => attributes,
                Ok(None) => continue,
                Err(e) => {
                    warn!(blob = %id, error = %e, "skipping unreadable attributes during rebuild");
                    continue;
                }
            };
            if self.metadata.get(&id)?.is_some() {
                continue;
            }
            if attributes.is_alive() {
                alive_sizes.push(attributes.metrics.content_size);
            }
            self.metadata.add_with_id(&id, attributes)?;
            rebuilt += 1;
        }

        // Counters are lost too when no node has ever flushed.
        if self.metrics.backing_files()?.is_empty() {
            for size in alive_sizes {
                self.metrics.record_addition(size);
            }
        }
        if rebuilt > 0 {
            info!(store = %self.name, rebuilt, "metadata rebuilt from attribute files");
        }
        Ok(rebuilt)
    }

    /// Drop blobs a crash left in `Creating`, and stale ingest files.
    fn purge_incomplete(&self) -> StoreResult<()> {
        let mut purged = 0;
        for id in self.metadata.find_with_state(LifecycleState::Creating) {
            self.file_ops.delete_quietly(&self.content_path(&id));
            self.file_ops.delete_quietly(&self.attribute_path(&id));
            self.metadata.delete(&id)?;
            purged += 1;
        }
        for entry in fs::read_dir(&self.ingest_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                self.file_ops.delete_quietly(&entry.path());
            }
        }
        if purged > 0 {
            warn!(store = %self.name, purged, "purged blobs left incomplete by an unclean shutdown");
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Paths and attribute files
    // ---------------------------------------------------------------

    pub fn content_path(&self, id: &BlobId) -> PathBuf {
        self.content_dir
            .join(format!("{}{BLOB_CONTENT_SUFFIX}", self.resolver.location(id)))
    }

    pub fn attribute_path(&self, id: &BlobId) -> PathBuf {
        self.content_dir
            .join(format!("{}{BLOB_ATTRIBUTE_SUFFIX}", self.resolver.location(id)))
    }

    fn ingest_paths(&self, id: &BlobId) -> (PathBuf, PathBuf) {
        let stem = format!("{}.{}", id.as_str().replace('/', "~"), uuid::Uuid::new_v4());
        (
            self.ingest_dir.join(format!("{stem}{BLOB_CONTENT_SUFFIX}")),
            self.ingest_dir.join(format!("{stem}{BLOB_ATTRIBUTE_SUFFIX}")),
        )
    }

    fn read_attributes(&self, path: &Path) -> StoreResult<Option<BlobAttributes>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(record::decode(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace an attributes file in place via temp file and rename.
    fn write_attributes(&self, path: &Path, attributes: &BlobAttributes) -> StoreResult<()> {
        let parent = path.parent().unwrap_or(&self.content_dir);
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&record::encode(attributes))?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    fn put_metadata(&self, id: &BlobId, attributes: BlobAttributes) -> StoreResult<()> {
        match self.metadata.update(id, attributes.clone()) {
            Err(MetadataError::NotFound(_)) => Ok(self.metadata.add_with_id(id, attributes)?),
            other => Ok(other?),
        }
    }

    /// Attributes files on disk, sorted by id. Never includes in-flight ingests.
    fn attribute_files(&self, include_temporary: bool) -> StoreResult<Vec<(BlobId, PathBuf)>> {
        self.attribute_files_under(&self.content_dir, include_temporary)
    }

    fn attribute_files_under(
        &self,
        dir: &Path,
        include_temporary: bool,
    ) -> StoreResult<Vec<(BlobId, PathBuf)>> {
        let mut found = Vec::new();
        if !dir.exists() {
            return Ok(found);
        }
        let temporary_dir = self.content_dir.join(TEMPORARY_DIR);
        let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
            if !e.file_type().is_dir() {
                return true;
            }
            e.path() != self.ingest_dir.as_path()
                && (include_temporary || e.path() != temporary_dir.as_path())
        });
        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(id) = self.attribute_file_id(entry.path()) {
                found.push((id, entry.into_path()));
            }
        }
        found.sort();
        Ok(found)
    }

    /// The blob id an attributes file belongs to. Direct-path ids come from
    /// the path below `directpath/`, all others from the file name.
    fn attribute_file_id(&self, path: &Path) -> Option<BlobId> {
        let relative = path.strip_prefix(&self.content_dir).ok()?;
        let mut parts = relative
            .iter()
            .map(|part| part.to_str())
            .collect::<Option<Vec<_>>>()?;
        let stem = parts.pop()?.strip_suffix(BLOB_ATTRIBUTE_SUFFIX)?;
        let parsed = if parts.first() == Some(&DIRECT_PATH_DIR) {
            parts.remove(0);
            parts.push(stem);
            BlobId::direct_path(&parts.join("/"))
        } else {
            BlobId::parse(stem)
        };
        match parsed {
            Ok(id) => Some(id),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "ignoring foreign attributes file");
                None
            }
        }
    }

    // ---------------------------------------------------------------
    // Ingestion
    // ---------------------------------------------------------------

    /// Register a fresh id, rerolling while its content path is taken.
    fn allocate(&self, headers: &Headers) -> StoreResult<BlobId> {
        let retries = self.config.collision_retries.max(1);
        let policy = RetryPolicy::immediate(retries);
        let result = retry_with_backoff(
            &policy,
            |e: &StoreError| matches!(e, StoreError::Collision(_)),
            |_| -> StoreResult<BlobId> {
                let id = self
                    .metadata
                    .add(BlobAttributes::new(headers.clone(), BlobMetrics::default()))?;
                if self.file_ops.exists(&self.content_path(&id)) {
                    warn!(store = %self.name, blob = %id, "blob id collision; trying another id");
                    self.metadata.delete(&id)?;
                    return Err(StoreError::Collision(id));
                }
                Ok(id)
            },
        );
        match result {
            Err(StoreError::Collision(_)) => Err(StoreError::NoFreeBlobId(retries)),
            other => other,
        }
    }

    fn ingest(&self, headers: Headers, source: Source<'_>) -> StoreResult<Arc<FileBlob>> {
        self.ensure_started()?;
        if headers.is_direct_path() {
            return self.ingest_direct_path(headers, source);
        }
        let id = self.allocate(&headers)?;
        let (tmp_content, tmp_attributes) = self.ingest_paths(&id);
        let content = self.content_path(&id);
        let attributes = self.attribute_path(&id);

        let staged = [tmp_content.as_path(), tmp_attributes.as_path()];
        let placed = [content.as_path(), attributes.as_path()];
        match self.write_blob(&id, headers, source, staged, placed) {
            Ok(blob) => Ok(blob),
            Err(e) => {
                for path in [&tmp_content, &tmp_attributes, &content, &attributes] {
                    self.file_ops.delete_quietly(path);
                }
                if let Err(me) = self.metadata.delete(&id) {
                    warn!(blob = %id, error = %me, "failed to drop metadata of failed blob");
                }
                Err(match e {
                    e @ StoreError::Blob { .. } => e,
                    other => StoreError::blob(&id, other),
                })
            }
        }
    }

    /// Create or overwrite the blob at `directpath/<blob-name>`.
    ///
    /// An existing blob keeps its files until the new ones are moved over
    /// them; a failed overwrite leaves it as it was.
    fn ingest_direct_path(&self, headers: Headers, source: Source<'_>) -> StoreResult<Arc<FileBlob>> {
        let name = headers.blob_name().ok_or_else(|| StoreError::InvalidDirectPath {
            path: String::new(),
            reason: "direct-path blobs need a blob name",
        })?;
        let id = BlobId::direct_path(name)?;
        let previous = self.metadata.get(&id)?;
        if previous.is_none() {
            self.metadata
                .add_with_id(&id, BlobAttributes::new(headers.clone(), BlobMetrics::default()))?;
        }

        let (tmp_content, tmp_attributes) = self.ingest_paths(&id);
        let content = self.content_path(&id);
        let attributes = self.attribute_path(&id);
        let staged = [tmp_content.as_path(), tmp_attributes.as_path()];
        let placed = [content.as_path(), attributes.as_path()];
        match self.write_blob(&id, headers, source, staged, placed) {
            Ok(blob) => {
                if let Some(old) = previous.filter(BlobAttributes::is_alive) {
                    self.metrics.record_deletion(old.metrics.content_size);
                    debug!(store = %self.name, blob = %id, "direct-path blob overwritten");
                }
                Ok(blob)
            }
            Err(e) => {
                self.file_ops.delete_quietly(&tmp_content);
                self.file_ops.delete_quietly(&tmp_attributes);
                if previous.is_none() {
                    self.file_ops.delete_quietly(&content);
                    self.file_ops.delete_quietly(&attributes);
                    if let Err(me) = self.metadata.delete(&id) {
                        warn!(blob = %id, error = %me, "failed to drop metadata of failed blob");
                    }
                }
                Err(match e {
                    e @ StoreError::Blob { .. } => e,
                    other => StoreError::blob(&id, other),
                })
            }
        }
    }

    fn write_blob(
        &self,
        id: &BlobId,
        headers: Headers,
        source: Source<'_>,
        [tmp_content, tmp_attributes]: [&Path; 2],
        [content, attributes_path]: [&Path; 2],
    ) -> StoreResult<Arc<FileBlob>> {
        let metrics = match source {
            Source::Stream(data) => {
                let written = self.file_ops.create(tmp_content, data)?;
                BlobMetrics::now(Some(written.sha1), written.size)
            }
            Source::File { path, size, sha1 } => {
                if let Err(e) = self.file_ops.hard_link(path, tmp_content) {
                    debug!(blob = %id, error = %e, "hard link failed; copying source file");
                    self.file_ops.copy(path, tmp_content)?;
                }
                BlobMetrics::now(Some(sha1.to_string()), size)
            }
            Source::Blob { path, metrics } => {
                self.link_or_copy_blob(id, path, tmp_content)?;
                metrics
            }
        };

        let mut attributes = BlobAttributes::new(headers, metrics);
        let record = record::encode(&attributes);
        self.file_ops.create(tmp_attributes, &mut &record[..])?;

        self.move_into_place(tmp_content, content)?;
        self.move_into_place(tmp_attributes, attributes_path)?;

        attributes.state = LifecycleState::Alive;
        self.write_attributes(attributes_path, &attributes)?;
        self.metadata.update(id, attributes.clone())?;

        let size = attributes.metrics.content_size;
        let blob = self.make_blob(id, &attributes);
        self.live
            .write()
            .expect("lock poisoned")
            .insert(id.clone(), Arc::clone(&blob));
        self.metrics.record_addition(size);
        debug!(store = %self.name, blob = %id, size, "blob created");
        Ok(blob)
    }

    fn link_or_copy_blob(&self, id: &BlobId, src: &Path, dst: &Path) -> StoreResult<()> {
        if self.supports_hard_link_copy.load(Ordering::SeqCst) {
            match self.file_ops.hard_link(src, dst) {
                Ok(()) => return Ok(()),
                Err(FileOpError::HardLinkNotSupported { reason, .. }) => {
                    self.supports_hard_link_copy.store(false, Ordering::SeqCst);
                    warn!(
                        store = %self.name,
                        blob = %id,
                        %reason,
                        "hard links not supported; copying blobs from now on"
                    );
                }
                Err(e) => {
                    debug!(store = %self.name, blob = %id, error = %e, "hard link failed; copying this blob");
                }
            }
        }
        self.file_ops.copy(src, dst)?;
        Ok(())
    }

    fn move_into_place(&self, src: &Path, dst: &Path) -> StoreResult<()> {
        if self.supports_atomic_move.load(Ordering::SeqCst) {
            match self.file_ops.move_atomic(src, dst) {
                Ok(()) => return Ok(()),
                Err(FileOpError::AtomicMoveNotSupported { reason, .. }) => {
                    self.supports_atomic_move.store(false, Ordering::SeqCst);
                    warn!(
                        store = %self.name,
                        %reason,
                        "atomic move not supported; using plain move from now on"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.file_ops.move_file(src, dst)?;
        Ok(())
    }

    fn make_blob(&self, id: &BlobId, attributes: &BlobAttributes) -> Arc<FileBlob> {
        Arc::new(FileBlob::new(
            id.clone(),
            attributes.headers.clone(),
            attributes.metrics.clone(),
            self.content_path(id),
            Arc::clone(&self.readers),
            Arc::clone(&self.file_ops),
        ))
    }

    // ---------------------------------------------------------------
    // Lookup and deletion
    // ---------------------------------------------------------------

    fn lookup(&self, id: &BlobId, include_deleted: bool) -> StoreResult<Option<Arc<FileBlob>>> {
        if let Some(blob) = self.live.read().expect("lock poisoned").get(id) {
            return Ok(Some(Arc::clone(blob)));
        }
        let Some(attributes) = self.metadata.get(id)? else {
            return Ok(None);
        };
        let visible = match attributes.state {
            LifecycleState::Alive => true,
            LifecycleState::MarkedForDeletion => include_deleted,
            LifecycleState::Creating => false,
        };
        if !visible {
            return Ok(None);
        }
        if !self.file_ops.exists(&self.content_path(id)) {
            warn!(store = %self.name, blob = %id, "metadata present but content missing");
            return Ok(None);
        }

        let blob = self.make_blob(id, &attributes);
        if attributes.is_alive() {
            let mut live = self.live.write().expect("lock poisoned");
            return Ok(Some(Arc::clone(live.entry(id.clone()).or_insert(blob))));
        }
        Ok(Some(blob))
    }

    fn soft_delete(&self, id: &BlobId, reason: &str) -> StoreResult<bool> {
        let path = self.attribute_path(id);
        let mut attributes = match self.read_attributes(&path) {
            Ok(Some(attributes)) => attributes,
            Ok(None) => {
                debug!(blob = %id, "no attributes file; deleting hard");
                return self.hard_delete(id);
            }
            Err(e) => {
                warn!(store = %self.name, blob = %id, error = %e, "corrupt attributes; deleting hard");
                return self.hard_delete(id);
            }
        };
        if !attributes.is_alive() {
            return Ok(false);
        }

        attributes.mark_deleted(reason);
        let size = attributes.metrics.content_size;
        self.write_attributes(&path, &attributes)?;
        self.put_metadata(id, attributes)?;
        self.live.write().expect("lock poisoned").remove(id);
        self.metrics.record_deletion(size);
        debug!(store = %self.name, blob = %id, reason, "blob marked for deletion");
        Ok(true)
    }

    /// Returns whether content was deleted.
    fn hard_delete(&self, id: &BlobId) -> StoreResult<bool> {
        let known = match self.metadata.get(id)? {
            Some(attributes) => Some(attributes),
            None => self.read_attributes(&self.attribute_path(id)).ok().flatten(),
        };

        let deleted = self.purge_files(id)?;
        if let Some(attributes) = known {
            if deleted && attributes.is_alive() {
                self.metrics.record_deletion(attributes.metrics.content_size);
            }
        }
        debug!(store = %self.name, blob = %id, deleted, "blob deleted hard");
        Ok(deleted)
    }

    /// Remove content, attributes, metadata and the live entry.
    fn purge_files(&self, id: &BlobId) -> StoreResult<bool> {
        let deleted = self.file_ops.delete(&self.content_path(id))?;
        self.file_ops.delete(&self.attribute_path(id))?;
        self.metadata.delete(id)?;
        self.live.write().expect("lock poisoned").remove(id);
        Ok(deleted)
    }

    // ---------------------------------------------------------------
    // Maintenance
    // ---------------------------------------------------------------

    /// Purge blobs marked for deletion, then compact the metadata.
    ///
    /// Blobs with an open stream obtained from this store are kept for the
    /// next compaction.
    pub fn compact_with_report(&self) -> StoreResult<CompactReport> {
        self.run_compaction(None)
    }

    /// Like [`compact_with_report`](Self::compact_with_report), but marked
    /// blobs that `in_use` still references are restored instead of purged.
    pub fn compact_restoring(&self, in_use: &dyn BlobUsageChecker) -> StoreResult<CompactReport> {
        self.run_compaction(Some(in_use))
    }

    fn run_compaction(&self, in_use: Option<&dyn BlobUsageChecker>) -> StoreResult<CompactReport> {
        self.ensure_started()?;
        let mut report = CompactReport::default();
        for id in self.metadata.find_with_state(LifecycleState::MarkedForDeletion) {
            match self.metadata.get(&id)? {
                Some(attributes) if attributes.is_deleted() => {}
                _ => continue,
            }
            if self.readers.open_readers(&id) > 0 {
                debug!(blob = %id, "blob still being read; deferring purge");
                report.deferred += 1;
                continue;
            }
            match self.restore_if_in_use(in_use, &id, false) {
                Ok(true) => {
                    report.undeleted += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => warn!(store = %self.name, blob = %id, error = %e, "cannot check blob for restore; purging"),
            }
            self.purge_files(&id)?;
            report.purged += 1;
        }
        report.metadata = self.metadata.compact()?;
        info!(
            store = %self.name,
            purged = report.purged,
            deferred = report.deferred,
            undeleted = report.undeleted,
            metadata_reclaimed = report.metadata.reclaimed,
            "compaction complete"
        );
        Ok(report)
    }

    fn restore_if_in_use(
        &self,
        in_use: Option<&dyn BlobUsageChecker>,
        id: &BlobId,
        dry_run: bool,
    ) -> StoreResult<bool> {
        let Some(checker) = in_use else {
            return Ok(false);
        };
        let path = self.attribute_path(id);
        let Some(mut attributes) = self.read_attributes(&path)? else {
            return Ok(false);
        };
        if !attributes.is_deleted() || !checker.in_use(&self.name, id, attributes.headers.blob_name()) {
            return Ok(false);
        }
        if dry_run {
            info!(store = %self.name, blob = %id, "blob in use; would be restored");
            return Ok(true);
        }

        attributes.restore();
        let size = attributes.metrics.content_size;
        self.write_attributes(&path, &attributes)?;
        self.put_metadata(id, attributes)?;
        self.metrics.record_addition(size);
        info!(store = %self.name, blob = %id, "blob in use; restored");
        Ok(true)
    }

    fn replace_attributes(&self, id: &BlobId, attributes: BlobAttributes) -> StoreResult<bool> {
        if attributes.state == LifecycleState::Creating {
            return Err(StoreError::blob(id, "attributes of a stored blob cannot be in state creating"));
        }
        let path = self.attribute_path(id);
        let Some(previous) = self.read_attributes(&path)? else {
            return Ok(false);
        };
        let (old_size, new_size) = (previous.metrics.content_size, attributes.metrics.content_size);
        let (was_alive, is_alive) = (previous.is_alive(), attributes.is_alive());

        self.write_attributes(&path, &attributes)?;
        self.put_metadata(id, attributes)?;
        self.live.write().expect("lock poisoned").remove(id);
        if was_alive && (!is_alive || old_size != new_size) {
            self.metrics.record_deletion(old_size);
        }
        if is_alive && (!was_alive || old_size != new_size) {
            self.metrics.record_addition(new_size);
        }
        debug!(store = %self.name, blob = %id, "blob attributes replaced");
        Ok(true)
    }

    /// Hard-delete temporary blobs and ingest leftovers older than `max_age`.
    pub fn sweep_temporary(&self, max_age: Duration) -> StoreResult<SweepReport> {
        self.ensure_started()?;
        let mut report = SweepReport::default();
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return Ok(report);
        };

        for (id, path) in self.attribute_files(true)? {
            if !id.is_temporary() {
                continue;
            }
            let created = match id.created_at() {
                Some(at) => SystemTime::from(at),
                None => match fs::metadata(&path).and_then(|m| m.modified()) {
                    Ok(modified) => modified,
                    Err(_) => continue,
                },
            };
            if created < cutoff && self.hard_delete(&id)? {
                report.blobs += 1;
            }
        }

        for entry in fs::read_dir(&self.ingest_dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_file() && meta.modified()? < cutoff && self.file_ops.delete_quietly(&entry.path()) {
                report.ingest_files += 1;
            }
        }

        info!(
            store = %self.name,
            blobs = report.blobs,
            ingest_files = report.ingest_files,
            "temporary sweep complete"
        );
        Ok(report)
    }

    /// Persist pending metrics now instead of waiting for the next tick.
    pub fn flush_metrics(&self) -> StoreResult<()> {
        Ok(self.metrics.flush()?)
    }

    // ---------------------------------------------------------------
    // Inspection
    // ---------------------------------------------------------------

    /// Ids of every permanent and direct-path blob with an attributes file,
    /// in any state.
    pub fn blob_ids(&self) -> StoreResult<Vec<BlobId>> {
        Ok(self
            .attribute_files(false)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Ids of the direct-path blobs at or below `prefix`, a relative
    /// directory under `directpath/`. `""` and `"."` list them all.
    pub fn direct_path_blob_ids(&self, prefix: &str) -> StoreResult<Vec<BlobId>> {
        self.ensure_started()?;
        let invalid = |reason| StoreError::InvalidDirectPath {
            path: prefix.to_string(),
            reason,
        };
        if prefix.starts_with(['/', '\\']) {
            return Err(invalid("prefix must be relative"));
        }
        if prefix.split(['/', '\\']).any(|seg| seg == "..") {
            return Err(invalid("prefix must not contain '..'"));
        }
        let mut dir = self.content_dir.join(DIRECT_PATH_DIR);
        let trimmed = prefix.trim_end_matches('/');
        if !trimmed.is_empty() && trimmed != "." {
            dir.push(trimmed);
        }
        Ok(self
            .attribute_files_under(&dir, false)?
            .into_iter()
            .map(|(id, _)| id)
            .filter(BlobId::is_direct_path)
            .collect())
    }

    /// Ids in `state` according to the metadata store.
    pub fn blob_ids_with_state(&self, state: LifecycleState) -> Vec<BlobId> {
        self.metadata.find_with_state(state).collect()
    }

    /// Attributes as recorded in the blob's attributes file.
    pub fn blob_attributes(&self, id: &BlobId) -> StoreResult<Option<BlobAttributes>> {
        self.read_attributes(&self.attribute_path(id))
    }

    pub fn bytes_exist(&self, id: &BlobId) -> bool {
        self.file_ops.exists(&self.content_path(id))
    }
}

impl BlobStore for FileBlobStore {
    fn create(&self, data: &mut dyn Read, headers: Headers) -> StoreResult<Arc<dyn Blob>> {
        Ok(self.ingest(headers, Source::Stream(data))?)
    }

    fn create_from_file(
        &self,
        source: &Path,
        headers: Headers,
        size: u64,
        sha1: &str,
    ) -> StoreResult<Arc<dyn Blob>> {
        Ok(self.ingest(
            headers,
            Source::File {
                path: source,
                size,
                sha1,
            },
        )?)
    }

    fn copy(&self, source: &BlobId, headers: Headers) -> StoreResult<Arc<dyn Blob>> {
        self.ensure_started()?;
        let original = self
            .lookup(source, false)?
            .ok_or_else(|| StoreError::NotFound(source.clone()))?;
        Ok(self.ingest(
            headers,
            Source::Blob {
                path: original.content_path(),
                metrics: original.metrics().clone(),
            },
        )?)
    }

    fn get(&self, id: &BlobId) -> StoreResult<Option<Arc<dyn Blob>>> {
        self.ensure_started()?;
        Ok(self.lookup(id, false)?.map(|blob| blob as Arc<dyn Blob>))
    }

    fn get_including_deleted(&self, id: &BlobId) -> StoreResult<Option<Arc<dyn Blob>>> {
        self.ensure_started()?;
        Ok(self.lookup(id, true)?.map(|blob| blob as Arc<dyn Blob>))
    }

    fn delete(&self, id: &BlobId, reason: &str) -> StoreResult<bool> {
        self.ensure_started()?;
        self.soft_delete(id, reason)
    }

    fn delete_hard(&self, id: &BlobId) -> StoreResult<bool> {
        self.ensure_started()?;
        self.hard_delete(id)
    }

    fn compact(&self) -> StoreResult<()> {
        self.compact_with_report().map(|_| ())
    }

    fn undelete(
        &self,
        in_use: Option<&dyn BlobUsageChecker>,
        id: &BlobId,
        dry_run: bool,
    ) -> StoreResult<bool> {
        self.ensure_started()?;
        self.restore_if_in_use(in_use, id, dry_run)
    }

    fn set_blob_attributes(&self, id: &BlobId, attributes: BlobAttributes) -> StoreResult<bool> {
        self.ensure_started()?;
        self.replace_attributes(id, attributes)
    }

    fn metrics(&self) -> StoreResult<StoreMetrics> {
        Ok(self.metrics.metrics()?)
    }

    fn exists(&self, id: &BlobId) -> bool {
        self.file_ops.exists(&self.attribute_path(id))
    }

    fn is_storage_available(&self) -> bool {
        let writable = fs::metadata(&self.content_dir)
            .map(|m| !m.permissions().readonly())
            .unwrap_or(false);
        writable && available_space(&self.content_dir).map_or(false, |space| space > 0)
    }
}

impl std::fmt::Debug for FileBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlobStore")
            .field("name", &self.name)
            .field("root", &self.root)
            .field("state", &self.state())
            .field("live", &self.live.read().map(|l| l.len()).unwrap_or(0))
            .field("supports_atomic_move", &self.supports_atomic_move())
            .field("supports_hard_link_copy", &self.supports_hard_link_copy())
            .finish()
    }
}
