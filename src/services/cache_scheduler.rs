use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::SchedulerConfig;
use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::events::EventBus;
use crate::services::cache_service::CacheWarmer;
use crate::services::cache_worker::CacheWorker;
use crate::services::indexing_service::SkipMatcher;

/// Owns the fixed pool of cache workers.
pub struct CacheScheduler {
    catalog: Catalog,
    warmer: Arc<dyn CacheWarmer>,
    config: SchedulerConfig,
    skip: SkipMatcher,
    events: EventBus,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl CacheScheduler {
    pub fn new(
        catalog: Catalog,
        warmer: Arc<dyn CacheWarmer>,
        config: SchedulerConfig,
        skip_patterns: &[String],
        events: EventBus,
    ) -> Self {
        Self {
            catalog,
            warmer,
            config,
            skip: SkipMatcher::new(skip_patterns),
            events,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Recovers jobs orphaned by a previous process, then spawns `worker_count` workers.
    pub async fn start(&self) -> Result<usize, AppError> {
        let recovered = self
            .catalog
            .call(repository::recover_interrupted_jobs)
            .await?;
        if recovered > 0 {
            tracing::warn!(recovered, "requeued cache jobs interrupted by a previous run");
        }

        for n in 1..=self.config.worker_count.max(1) {
            let worker = CacheWorker::new(
                format!("worker-{n}"),
                self.catalog.clone(),
                Arc::clone(&self.warmer),
                self.config.clone(),
                self.skip.clone(),
                self.events.clone(),
            );
            tracing::debug!(worker = worker.id(), "spawning cache worker");
            let token = self.shutdown.child_token();
            self.tracker.spawn(worker.run(token));
        }
        tracing::info!(
            workers = self.config.worker_count,
            per_worker = self.config.max_concurrent_files,
            "cache scheduler started"
        );
        Ok(recovered)
    }

    /// Signals every worker and waits for them to release or finish their jobs.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("cache scheduler stopped");
    }
}
