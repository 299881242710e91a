use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, info, warn};

use cask_types::StoreMetrics;

use crate::disk;
use crate::error::{MetricsError, MetricsResult};
use crate::node::NodeAccess;
use crate::properties::Properties;
use crate::quota::{QuotaResult, QuotaService, SoftQuotaConfig};
use crate::scheduler::{JobHandle, PeriodicJobService};

/// Suffix of every per-node metrics file.
pub const METRICS_FILE_SUFFIX: &str = "-metrics.properties";
pub const BLOB_COUNT_KEY: &str = "blobCount";
pub const TOTAL_SIZE_KEY: &str = "totalSize";

/// Counters last written to this node's file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Totals {
    blob_count: i64,
    total_size: i64,
}

struct QuotaCheck {
    service: Arc<dyn QuotaService>,
    config: SoftQuotaConfig,
}

/// Store metrics backed by per-node properties files.
///
/// `record_addition` / `record_deletion` only update atomic deltas. `flush`
/// folds the deltas into this node's file, subtracting exactly what it
/// wrote, so increments racing with a flush are kept for the next one. A
/// failed flush leaves the deltas untouched.
///
/// A node file holds signed totals: a node that deletes blobs another node
/// created persists negative values. Only the aggregate is clamped at zero.
pub struct FileMetricsStore {
    dir: PathBuf,
    store_name: String,
    node: Arc<dyn NodeAccess>,
    quota: Option<QuotaCheck>,
    pending_count: AtomicI64,
    pending_size: AtomicI64,
    /// Held for the whole flush; serializes writers of this node's file.
    persisted: Mutex<Totals>,
    last_quota: Mutex<Option<QuotaResult>>,
    job: Mutex<Option<JobHandle>>,
}

impl FileMetricsStore {
    pub fn new(dir: impl Into<PathBuf>, store_name: impl Into<String>, node: Arc<dyn NodeAccess>) -> Self {
        Self {
            dir: dir.into(),
            store_name: store_name.into(),
            node,
            quota: None,
            pending_count: AtomicI64::new(0),
            pending_size: AtomicI64::new(0),
            persisted: Mutex::new(Totals::default()),
            last_quota: Mutex::new(None),
            job: Mutex::new(None),
        }
    }

    /// Check `config` with `service` after every flush.
    pub fn with_quota(mut self, service: Arc<dyn QuotaService>, config: SoftQuotaConfig) -> Self {
        self.quota = Some(QuotaCheck { service, config });
        self
    }

    /// Path of this node's metrics file.
    pub fn node_file(&self) -> PathBuf {
        self.dir
            .join(format!("{}{METRICS_FILE_SUFFIX}", self.node.id()))
    }

    /// Load this node's persisted counters. Call before recording anything.
    pub fn load(&self) -> MetricsResult<()> {
        let path = self.node_file();
        let totals = if path.exists() {
            read_totals(&path)?
        } else {
            Totals::default()
        };
        *self.persisted.lock().expect("metrics mutex poisoned") = totals;
        debug!(
            node = self.node.id(),
            blob_count = totals.blob_count,
            total_size = totals.total_size,
            "node metrics loaded"
        );
        Ok(())
    }

    /// Load counters and schedule the periodic flush.
    ///
    /// The scheduled task holds only a weak reference; dropping the store
    /// ends the job.
    pub fn start(
        self: &Arc<Self>,
        jobs: &dyn PeriodicJobService,
        interval: Duration,
    ) -> MetricsResult<()> {
        self.load()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = jobs.schedule(
            &format!("{}-metrics-flush", self.store_name),
            interval,
            Arc::new(move || {
                if let Some(store) = weak.upgrade() {
                    if let Err(e) = store.flush() {
                        warn!(store = %store.store_name, error = %e, "metrics flush failed; will retry");
                    }
                }
            }),
        );
        *self.job.lock().expect("metrics mutex poisoned") = Some(handle);

        if let Ok(metrics) = self.metrics() {
            info!(
                store = %self.store_name,
                blob_count = metrics.blob_count,
                total_size = metrics.total_size,
                "metrics store started"
            );
        }
        Ok(())
    }

    /// Cancel the periodic job and flush what is pending.
    pub fn stop(&self) -> MetricsResult<()> {
        if let Some(job) = self.job.lock().expect("metrics mutex poisoned").take() {
            job.cancel();
        }
        self.flush()
    }

    pub fn record_addition(&self, size: u64) {
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        self.pending_size.fetch_add(size as i64, Ordering::SeqCst);
    }

    pub fn record_deletion(&self, size: u64) {
        self.pending_count.fetch_sub(1, Ordering::SeqCst);
        self.pending_size.fetch_sub(size as i64, Ordering::SeqCst);
    }

    /// Persist pending deltas, then run the quota check.
    pub fn flush(&self) -> MetricsResult<()> {
        let mut persisted = self.persisted.lock().expect("metrics mutex poisoned");
        let count_delta = self.pending_count.load(Ordering::SeqCst);
        let size_delta = self.pending_size.load(Ordering::SeqCst);

        if count_delta != 0 || size_delta != 0 || !self.node_file().exists() {
            let next = Totals {
                blob_count: persisted.blob_count + count_delta,
                total_size: persisted.total_size + size_delta,
            };
            let mut props = Properties::new();
            props.set(BLOB_COUNT_KEY, next.blob_count);
            props.set(TOTAL_SIZE_KEY, next.total_size);
            props.store(&self.node_file())?;

            self.pending_count.fetch_sub(count_delta, Ordering::SeqCst);
            self.pending_size.fetch_sub(size_delta, Ordering::SeqCst);
            *persisted = next;
            debug!(
                node = self.node.id(),
                blob_count = next.blob_count,
                total_size = next.total_size,
                "metrics flushed"
            );
        }
        drop(persisted);

        self.check_quota()?;
        Ok(())
    }

    /// Evaluate the configured soft quota against current metrics.
    pub fn check_quota(&self) -> MetricsResult<Option<QuotaResult>> {
        let Some(quota) = &self.quota else {
            return Ok(None);
        };
        let metrics = self.metrics()?;
        let result = quota
            .service
            .check_quota(&self.store_name, &quota.config, &metrics);
        *self.last_quota.lock().expect("metrics mutex poisoned") = Some(result.clone());
        Ok(Some(result))
    }

    /// Result of the most recent quota check.
    pub fn last_quota_result(&self) -> Option<QuotaResult> {
        self.last_quota.lock().expect("metrics mutex poisoned").clone()
    }

    /// Every node's metrics file under the store directory.
    pub fn backing_files(&self) -> MetricsResult<Vec<PathBuf>> {
        let entries = fs::read_dir(&self.dir).map_err(|source| MetricsError::Unavailable {
            path: self.dir.clone(),
            source,
        })?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let is_metrics = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.ends_with(METRICS_FILE_SUFFIX));
            if is_metrics && entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Aggregate metrics across all nodes, including unflushed local deltas.
    ///
    /// Fails with [`MetricsError::Unavailable`] when the store directory
    /// cannot be read.
    pub fn metrics(&self) -> MetricsResult<StoreMetrics> {
        let own = self.node_file();
        let persisted = *self.persisted.lock().expect("metrics mutex poisoned");
        let mut blob_count = persisted.blob_count + self.pending_count.load(Ordering::SeqCst);
        let mut total_size = persisted.total_size + self.pending_size.load(Ordering::SeqCst);

        for path in self.backing_files()? {
            if path == own {
                continue;
            }
            let totals = read_totals(&path)?;
            blob_count += totals.blob_count;
            total_size += totals.total_size;
        }

        let available_space = match disk::available_space(&self.dir) {
            Ok(space) => space,
            Err(source) => {
                return Err(MetricsError::Unavailable {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        Ok(StoreMetrics::new(
            blob_count.max(0) as u64,
            total_size.max(0) as u64,
            available_space,
        ))
    }

    /// Delete every node's metrics file and reset local counters.
    pub fn remove(&self) -> MetricsResult<()> {
        if let Some(job) = self.job.lock().expect("metrics mutex poisoned").take() {
            job.cancel();
        }
        let mut persisted = self.persisted.lock().expect("metrics mutex poisoned");
        if self.dir.exists() {
            for path in self.backing_files()? {
                fs::remove_file(&path)?;
                debug!(path = %path.display(), "metrics file removed");
            }
        }
        *persisted = Totals::default();
        self.pending_count.store(0, Ordering::SeqCst);
        self.pending_size.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Debug for FileMetricsStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileMetricsStore")
            .field("dir", &self.dir)
            .field("store_name", &self.store_name)
            .field("node", &self.node.id())
            .field("pending_count", &self.pending_count.load(Ordering::Relaxed))
            .field("pending_size", &self.pending_size.load(Ordering::Relaxed))
            .finish()
    }
}

fn read_totals(path: &Path) -> MetricsResult<Totals> {
    let props = Properties::load(path)?;
    let field = |key: &str| -> MetricsResult<i64> {
        match props.get(key) {
            None => Ok(0),
            Some(raw) => raw.parse().map_err(|_| MetricsError::Malformed {
                path: path.to_path_buf(),
                reason: format!("{key}={raw} is not an integer"),
            }),
        }
    };
    Ok(Totals {
        blob_count: field(BLOB_COUNT_KEY)?,
        total_size: field(TOTAL_SIZE_KEY)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::StaticNodeAccess;
    use crate::quota::{QuotaType, SoftQuotaService};
    use crate::scheduler::TokioJobService;

    fn store(dir: &Path, node: &str) -> FileMetricsStore {
        FileMetricsStore::new(dir, "test", Arc::new(StaticNodeAccess::new(node)))
    }

    #[test]
    fn counts_converge_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = store(dir.path(), "node-a");
        metrics.load().unwrap();
        for _ in 0..10 {
            metrics.record_addition(100);
        }
        for _ in 0..4 {
            metrics.record_deletion(100);
        }
        metrics.flush().unwrap();
        let m = metrics.metrics().unwrap();
        assert_eq!(m.blob_count, 6);
        assert_eq!(m.total_size, 600);
        drop(metrics);

        let reloaded = store(dir.path(), "node-a");
        reloaded.load().unwrap();
        let m = reloaded.metrics().unwrap();
        assert_eq!(m.blob_count, 6);
        assert_eq!(m.total_size, 600);

        let props = Properties::load(&dir.path().join("node-a-metrics.properties")).unwrap();
        assert_eq!(props.get(BLOB_COUNT_KEY), Some("6"));
        assert_eq!(props.get(TOTAL_SIZE_KEY), Some("600"));
    }

    #[test]
    fn unflushed_deltas_are_visible() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = store(dir.path(), "n");
        metrics.record_addition(10);
        assert_eq!(metrics.metrics().unwrap().blob_count, 1);
        assert!(!metrics.node_file().exists());
    }

    #[test]
    fn sums_all_nodes() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path(), "a");
        let b = store(dir.path(), "b");
        a.record_addition(5);
        a.flush().unwrap();
        b.record_addition(7);
        b.record_addition(7);
        b.flush().unwrap();

        let fresh = store(dir.path(), "c");
        fresh.load().unwrap();
        let m = fresh.metrics().unwrap();
        assert_eq!(m.blob_count, 3);
        assert_eq!(m.total_size, 19);
        assert_eq!(fresh.backing_files().unwrap().len(), 2);
    }

    #[test]
    fn failed_flush_keeps_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("store");
        fs::create_dir(&root).unwrap();
        let metrics = store(&root, "n");
        metrics.record_addition(42);

        fs::remove_dir(&root).unwrap();
        assert!(metrics.flush().is_err());

        fs::create_dir(&root).unwrap();
        metrics.flush().unwrap();
        let m = metrics.metrics().unwrap();
        assert_eq!(m.blob_count, 1);
        assert_eq!(m.total_size, 42);
    }

    #[test]
    fn deletions_on_another_node_persist_negative_totals() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path(), "a");
        a.load().unwrap();
        a.record_addition(10);
        a.flush().unwrap();

        let b = store(dir.path(), "b");
        b.load().unwrap();
        b.record_deletion(10);
        b.flush().unwrap();

        let props = Properties::load(&b.node_file()).unwrap();
        assert_eq!(props.get(BLOB_COUNT_KEY), Some("-1"));
        assert_eq!(props.get(TOTAL_SIZE_KEY), Some("-10"));

        let reloaded = store(dir.path(), "a");
        reloaded.load().unwrap();
        let m = reloaded.metrics().unwrap();
        assert_eq!(m.blob_count, 0);
        assert_eq!(m.total_size, 0);

        let b_again = store(dir.path(), "b");
        b_again.load().unwrap();
        assert_eq!(b_again.metrics().unwrap().blob_count, 0);
    }

    #[test]
    fn missing_directory_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = store(&dir.path().join("gone"), "n");
        assert!(matches!(
            metrics.metrics(),
            Err(MetricsError::Unavailable { .. })
        ));
    }

    #[test]
    fn quota_checked_on_flush() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = store(dir.path(), "n").with_quota(
            Arc::new(SoftQuotaService),
            SoftQuotaConfig {
                quota_type: QuotaType::SpaceUsed,
                limit: 10,
            },
        );
        metrics.record_addition(5);
        metrics.flush().unwrap();
        assert!(!metrics.last_quota_result().unwrap().violation);

        metrics.record_addition(6);
        metrics.flush().unwrap();
        assert!(metrics.last_quota_result().unwrap().violation);
    }

    #[test]
    fn remove_deletes_all_node_files() {
        let dir = tempfile::tempdir().unwrap();
        let a = store(dir.path(), "a");
        let b = store(dir.path(), "b");
        a.record_addition(1);
        a.flush().unwrap();
        b.record_addition(1);
        b.flush().unwrap();

        a.remove().unwrap();
        assert!(a.backing_files().unwrap().is_empty());
        assert_eq!(a.metrics().unwrap().blob_count, 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(store(dir.path(), "n"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for i in 0..500 {
                        m.record_addition(1);
                        if i % 100 == 0 {
                            m.flush().unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        metrics.flush().unwrap();
        assert_eq!(metrics.metrics().unwrap().blob_count, 4000);
        let props = Properties::load(&metrics.node_file()).unwrap();
        assert_eq!(props.get(BLOB_COUNT_KEY), Some("4000"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_flush_persists() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = Arc::new(store(dir.path(), "n"));
        let jobs = TokioJobService::current().unwrap();
        metrics.start(&jobs, Duration::from_millis(20)).unwrap();

        metrics.record_addition(3);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let props = Properties::load(&metrics.node_file()).unwrap();
        assert_eq!(props.get(BLOB_COUNT_KEY), Some("1"));
        metrics.stop().unwrap();
    }
}
