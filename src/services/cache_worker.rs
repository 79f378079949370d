use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::events::{Event, EventBus};
use crate::models::cache_job::{CacheJob, ItemStatus, JobProgress, JobStatus};
use crate::models::file_entry::CacheStatusUpdate;
use crate::services::cache_service::{self, CacheWarmer};
use crate::services::indexing_service::SkipMatcher;

/// Why a worker left a job's item loop.
#[derive(Debug, Clone, PartialEq)]
pub enum JobExit {
    Completed { failed_files: u64 },
    Paused,
    Cancelled,
    Released,
    Failed(String),
}

/// One named polling loop of the scheduler pool.
pub struct CacheWorker {
    id: String,
    catalog: Catalog,
    warmer: Arc<dyn CacheWarmer>,
    config: SchedulerConfig,
    skip: SkipMatcher,
    events: EventBus,
}

impl CacheWorker {
    pub fn new(
        id: String,
        catalog: Catalog,
        warmer: Arc<dyn CacheWarmer>,
        config: SchedulerConfig,
        skip: SkipMatcher,
        events: EventBus,
    ) -> Self {
        Self {
            id,
            catalog,
            warmer,
            config,
            skip,
            events,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Polls for jobs until `shutdown` fires. Runs one job at a time.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::debug!(worker = %self.id, "cache worker started");
        while !shutdown.is_cancelled() {
            let worker_id = self.id.clone();
            let claimed = self
                .catalog
                .call(move |conn| repository::claim_next_job(conn, &worker_id, Utc::now()))
                .await;
            match claimed {
                Ok(Some(job)) => {
                    let exit = self.process_job(job, &shutdown).await;
                    tracing::debug!(worker = %self.id, ?exit, "left cache job");
                }
                Ok(None) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(worker = %self.id, error = %e, "failed to poll for cache jobs");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval()) => {}
                    }
                }
            }
        }
        tracing::debug!(worker = %self.id, "cache worker stopped");
    }

    /// Drives a claimed job to completion, pause, cancellation or release.
    pub async fn process_job(&self, job: CacheJob, shutdown: &CancellationToken) -> JobExit {
        tracing::info!(worker = %self.id, job_id = %job.id, files = job.total_files, "processing cache job");
        match self.item_loop(&job, shutdown).await {
            Ok(exit) => exit,
            Err(e) => {
                let message = e.to_string();
                tracing::error!(worker = %self.id, job_id = %job.id, error = %message, "cache job failed");
                let id = job.id.clone();
                let msg = message.clone();
                if let Err(e) = self
                    .catalog
                    .call(move |conn| repository::fail_job(conn, &id, &msg, Utc::now()))
                    .await
                {
                    tracing::error!(job_id = %job.id, error = %e, "could not record job failure");
                }
                self.events.emit(Event::JobFailed {
                    job_id: job.id.clone(),
                    error: message.clone(),
                });
                JobExit::Failed(message)
            }
        }
    }

    async fn item_loop(
        &self,
        job: &CacheJob,
        shutdown: &CancellationToken,
    ) -> Result<JobExit, AppError> {
        let max_in_flight = self.config.max_concurrent_files.max(1);
        let mut in_flight: JoinSet<(String, Result<u64, AppError>)> = JoinSet::new();
        let mut batch = CacheBatch::new(job.id.clone());
        let mut last_status_check = Instant::now();
        let mut exhausted = false;
        let mut interrupted: Option<JobExit> = None;

        loop {
            if last_status_check.elapsed() >= self.config.status_check_interval() {
                last_status_check = Instant::now();
                interrupted = self.interruption(&job.id).await?;
            }
            if interrupted.is_none() && shutdown.is_cancelled() {
                interrupted = Some(JobExit::Released);
            }
            if interrupted.is_some() {
                break;
            }

            let free = max_in_flight.saturating_sub(in_flight.len());
            if free > 0 && !exhausted {
                let (id, worker) = (job.id.clone(), self.id.clone());
                let claimed = self
                    .catalog
                    .call(move |conn| {
                        repository::claim_pending_items(conn, &id, &worker, free, Utc::now())
                    })
                    .await?;
                if claimed.len() < free {
                    exhausted = true;
                }
                for item in claimed {
                    self.events.emit(Event::FileStarted {
                        job_id: job.id.clone(),
                        path: item.file_path.clone(),
                    });
                    let warmer = Arc::clone(&self.warmer);
                    in_flight.spawn(async move {
                        let result = warmer.warm(&PathBuf::from(&item.file_path)).await;
                        (item.file_path, result)
                    });
                }
            }

            if in_flight.is_empty() {
                break;
            }

            tokio::select! {
                joined = in_flight.join_next() => {
                    if let Some(joined) = joined {
                        self.record_result(joined, &mut batch).await?;
                    }
                }
                _ = tokio::time::sleep(self.config.status_check_interval()) => {}
                _ = shutdown.cancelled() => {}
            }

            self.maybe_flush(&mut batch, false).await?;
        }

        // In-flight reads always finish.
        while let Some(joined) = in_flight.join_next().await {
            self.record_result(joined, &mut batch).await?;
        }
        self.maybe_flush(&mut batch, true).await?;
        let progress = self.publish_progress(&job.id).await?;
        if interrupted.is_none() {
            // Pause and cancel can land between two status checks.
            interrupted = self.interruption(&job.id).await?;
        }

        match interrupted {
            Some(JobExit::Released) => {
                let (id, worker) = (job.id.clone(), self.id.clone());
                self.catalog
                    .call(move |conn| repository::release_job(conn, &id, &worker))
                    .await?;
                tracing::info!(worker = %self.id, job_id = %job.id, "released cache job on shutdown");
                Ok(JobExit::Released)
            }
            Some(exit) => {
                tracing::info!(worker = %self.id, job_id = %job.id, ?exit, "cache job interrupted");
                Ok(exit)
            }
            None => self.finalize(job, progress).await,
        }
    }

    /// Re-reads the job row. `None` while the job is still running under this worker.
    async fn interruption(&self, job_id: &str) -> Result<Option<JobExit>, AppError> {
        let id = job_id.to_string();
        let holder = self
            .catalog
            .call(move |conn| repository::job_holder(conn, &id))
            .await?;
        match holder {
            Some((JobStatus::Running, Some(worker))) if worker == self.id => Ok(None),
            Some((JobStatus::Cancelled, _)) => Ok(Some(JobExit::Cancelled)),
            // A paused job may already be resumed and held by another worker.
            Some((JobStatus::Paused | JobStatus::Pending | JobStatus::Running, _)) => {
                Ok(Some(JobExit::Paused))
            }
            other => Err(AppError::InvalidState(format!(
                "job {job_id} changed to {other:?} while running"
            ))),
        }
    }

    async fn record_result(
        &self,
        joined: Result<(String, Result<u64, AppError>), tokio::task::JoinError>,
        batch: &mut CacheBatch,
    ) -> Result<(), AppError> {
        let (path, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::error!(worker = %self.id, error = %e, "cache read task panicked");
                return Ok(());
            }
        };

        let (status, error) = match &result {
            Ok(_) => (ItemStatus::Completed, None),
            Err(e) => (ItemStatus::Failed, Some(e.to_string())),
        };
        let (id, worker, item_path, message) = (
            batch.job_id.clone(),
            self.id.clone(),
            path.clone(),
            error.clone(),
        );
        let owned = self
            .catalog
            .call(move |conn| {
                repository::update_item_status(
                    conn,
                    &id,
                    &item_path,
                    status,
                    &worker,
                    message.as_deref(),
                    Utc::now(),
                )
            })
            .await?;

        if !owned {
            tracing::debug!(worker = %self.id, path = %path, "item no longer held by this worker");
        }

        match result {
            Ok(bytes) => {
                batch.updates.push(CacheStatusUpdate {
                    path: path.clone(),
                    cached: true,
                    job_id: batch.job_id.clone(),
                });
                self.events.emit(Event::FileCompleted {
                    job_id: batch.job_id.clone(),
                    path,
                    bytes,
                });
            }
            Err(_) => {
                let error = error.unwrap_or_default();
                tracing::debug!(worker = %self.id, path = %path, error = %error, "cache read failed");
                self.events.emit(Event::FileFailed {
                    job_id: batch.job_id.clone(),
                    path,
                    error,
                });
            }
        }
        batch.since_progress += 1;
        Ok(())
    }

    /// Writes batched cache state and progress on their own cadences.
    async fn maybe_flush(&self, batch: &mut CacheBatch, force: bool) -> Result<(), AppError> {
        let flush_due = batch.updates.len() >= self.config.cache_flush_every.max(1)
            || batch.last_flush.elapsed() >= self.config.cache_flush_interval();
        if !batch.updates.is_empty() && (force || flush_due) {
            let updates = std::mem::take(&mut batch.updates);
            let mount_root = self
                .config
                .mount_root
                .as_ref()
                .map(|p| p.to_string_lossy().to_string());
            let written = self
                .catalog
                .call(move |conn| {
                    repository::update_cache_status_batch(
                        conn,
                        &updates,
                        mount_root.as_deref(),
                        Utc::now(),
                    )
                })
                .await?;
            tracing::debug!(job_id = %batch.job_id, written, "flushed cache state");
            batch.last_flush = Instant::now();
        }

        let progress_due = batch.since_progress >= self.config.progress_every.max(1)
            || (batch.since_progress > 0
                && batch.last_progress.elapsed() >= self.config.progress_interval());
        if !force && progress_due {
            self.publish_progress(&batch.job_id).await?;
            batch.since_progress = 0;
            batch.last_progress = Instant::now();
        }
        Ok(())
    }

    async fn publish_progress(&self, job_id: &str) -> Result<JobProgress, AppError> {
        let id = job_id.to_string();
        let progress = self
            .catalog
            .call(move |conn| repository::update_job_progress(conn, &id))
            .await?;
        self.events.emit(Event::JobProgress {
            job_id: progress.job_id.clone(),
            total_files: progress.total_files,
            completed_files: progress.completed_files,
            failed_files: progress.failed_files,
            percentage: progress.percentage(),
        });
        Ok(progress)
    }

    async fn finalize(&self, job: &CacheJob, progress: JobProgress) -> Result<JobExit, AppError> {
        let accounted = progress.completed_files + progress.failed_files;
        if accounted < progress.total_files {
            return Err(AppError::Cache(format!(
                "{} of {} files unaccounted for after the item loop drained",
                progress.total_files - accounted,
                progress.total_files
            )));
        }

        let (mut marked, mut rejected) = (0u64, 0u64);
        if progress.failed_files == 0 {
            for dir in &job.directory_paths {
                match cache_service::mark_directory_cached_if_valid(
                    &self.catalog,
                    dir,
                    &job.id,
                    &self.skip,
                )
                .await
                {
                    Ok(true) => marked += 1,
                    Ok(false) => {
                        rejected += 1;
                        tracing::warn!(job_id = %job.id, dir = %dir, "directory changed since caching; not marked");
                    }
                    Err(e) => {
                        rejected += 1;
                        tracing::warn!(job_id = %job.id, dir = %dir, error = %e, "directory revalidation failed");
                    }
                }
            }
        }

        let id = job.id.clone();
        self.catalog
            .call(move |conn| repository::complete_job(conn, &id, marked, rejected, Utc::now()))
            .await?;
        self.events.emit(Event::JobCompleted {
            job_id: job.id.clone(),
            completed_files: progress.completed_files,
            failed_files: progress.failed_files,
            directories_marked: marked,
            directories_rejected: rejected,
        });
        tracing::info!(
            worker = %self.id,
            job_id = %job.id,
            completed = progress.completed_files,
            failed = progress.failed_files,
            directories_marked = marked,
            directories_rejected = rejected,
            "cache job completed"
        );
        Ok(JobExit::Completed {
            failed_files: progress.failed_files,
        })
    }
}

struct CacheBatch {
    job_id: String,
    updates: Vec<CacheStatusUpdate>,
    last_flush: Instant,
    since_progress: usize,
    last_progress: Instant,
}

impl CacheBatch {
    fn new(job_id: String) -> Self {
        Self {
            job_id,
            updates: Vec::new(),
            last_flush: Instant::now(),
            since_progress: 0,
            last_progress: Instant::now(),
        }
    }
}
