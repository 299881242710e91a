use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{MetricsError, MetricsResult};

/// Unit of periodic work. Runs on a blocking-capable thread.
pub type PeriodicTask = Arc<dyn Fn() + Send + Sync + 'static>;

/// Runs a task on a fixed interval until cancelled.
pub trait PeriodicJobService: Send + Sync {
    /// Schedule `task` every `interval`, first run one interval from now.
    fn schedule(&self, name: &str, interval: Duration, task: PeriodicTask) -> JobHandle;
}

/// Cancels a scheduled job. Dropping the handle cancels it too.
pub struct JobHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the job to stop after any in-flight run completes.
    pub fn cancel(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel and wait for the job loop to exit.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                warn!(job = %self.name, error = %e, "periodic job ended abnormally");
            }
        }
    }
}

impl Drop for JobHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("name", &self.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

/// [`PeriodicJobService`] running jobs as tasks on a Tokio runtime.
#[derive(Clone, Debug)]
pub struct TokioJobService {
    handle: Handle,
}

impl TokioJobService {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Use the runtime of the calling context.
    pub fn current() -> MetricsResult<Self> {
        Handle::try_current()
            .map(Self::new)
            .map_err(|e| MetricsError::NoRuntime(e.to_string()))
    }
}

impl PeriodicJobService for TokioJobService {
    fn schedule(&self, name: &str, interval: Duration, task: PeriodicTask) -> JobHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let job = name.to_string();

        let join = self.handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(job = %job, interval_ms = interval.as_millis() as u64, "periodic job started");
            loop {
                tokio::select! {
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            info!(job = %job, "periodic job shutting down");
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        let task = Arc::clone(&task);
                        if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                            warn!(job = %job, error = %e, "periodic job run panicked");
                        } else {
                            debug!(job = %job, "periodic job run complete");
                        }
                    }
                }
            }
        });

        JobHandle {
            name: name.to_string(),
            shutdown,
            join: Some(join),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_on_interval_until_cancelled() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let service = TokioJobService::current().unwrap();
        let handle = service.schedule(
            "count",
            Duration::from_millis(20),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 runs, saw {seen}");

        handle.shutdown().await;
        let after = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[test]
    fn current_without_runtime_fails() {
        assert!(matches!(
            TokioJobService::current(),
            Err(MetricsError::NoRuntime(_))
        ));
    }
}
