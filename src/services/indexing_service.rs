use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::{CrawlerConfig, DeletionSafetyConfig};
use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::events::{Event, EventBus};
use crate::models::file_entry::CatalogEntry;
use crate::models::session::{SessionCounts, SessionStatus};
use crate::scope_path;
use crate::services::directory_size_service::{self, DirectorySizeQueue};
use crate::services::search_service::{ResilientIndexWriter, SearchIndex};

const TUNE_EVERY_FLUSHES: usize = 5;
const SLOW_FLUSH: Duration = Duration::from_secs(5);
const FAST_FLUSH: Duration = Duration::from_secs(1);
pub const STOPPED_MESSAGE: &str = "crawl stopped";

/// What happened to deletion reconciliation at the end of a crawl.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeletionOutcome {
    Deleted { count: usize },
    SkippedStopped,
    SkippedNoFiles,
    SkippedValidation { reason: String },
    SafetyBrake { percentage: f64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct CrawlSummary {
    pub session_id: String,
    pub root_path: String,
    pub counts: SessionCounts,
    pub deletion: DeletionOutcome,
    pub directories_resized: usize,
    pub index_failures: u64,
    pub index_disabled: bool,
    pub stopped: bool,
    pub duration_ms: u64,
}

/// Snapshot of the crawler for status queries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlStatus {
    pub running: bool,
    pub session_id: Option<String>,
    pub root_path: Option<String>,
    pub counts: SessionCounts,
    pub batch_size: usize,
}

/// Checks whether a finished walk is trustworthy enough to infer deletions from.
pub fn validate_session(counts: &SessionCounts, safety: &DeletionSafetyConfig) -> Result<(), String> {
    let processed = counts.files_processed;
    if processed < safety.min_processed {
        return Err(format!(
            "only {processed} entries processed (minimum {})",
            safety.min_processed
        ));
    }
    let completion = (counts.files_indexed + counts.files_skipped) as f64 / processed as f64;
    if completion < safety.min_completion_rate {
        return Err(format!(
            "completion rate {completion:.3} below {}",
            safety.min_completion_rate
        ));
    }
    let error_rate = counts.errors as f64 / processed as f64;
    if error_rate > safety.max_error_rate {
        return Err(format!(
            "error rate {error_rate:.3} above {}",
            safety.max_error_rate
        ));
    }
    Ok(())
}

/// Adapts the flush batch size to observed flush latency.
#[derive(Debug)]
pub struct BatchTuner {
    initial: usize,
    current: usize,
    floor: usize,
    window_total: Duration,
    window_len: usize,
    window_errors: bool,
}

impl BatchTuner {
    pub fn new(initial: usize, floor: usize) -> Self {
        let initial = initial.max(1);
        Self {
            initial,
            current: initial,
            floor: floor.clamp(1, initial),
            window_total: Duration::ZERO,
            window_len: 0,
            window_errors: false,
        }
    }

    pub fn size(&self) -> usize {
        self.current
    }

    /// Records one flush. Returns the new size when a tuning step changed it.
    pub fn record(&mut self, elapsed: Duration, had_errors: bool) -> Option<usize> {
        self.window_total += elapsed;
        self.window_len += 1;
        self.window_errors |= had_errors;
        if self.window_len < TUNE_EVERY_FLUSHES {
            return None;
        }

        let average = self.window_total / self.window_len as u32;
        let healthy = !self.window_errors;
        self.window_total = Duration::ZERO;
        self.window_len = 0;
        self.window_errors = false;

        let previous = self.current;
        if average > SLOW_FLUSH {
            self.current = ((self.current as f64 * 0.8) as usize).max(self.floor);
        } else if average < FAST_FLUSH && healthy {
            self.current = ((self.current as f64 * 1.2) as usize).min(self.initial * 2);
        }
        (self.current != previous).then_some(self.current)
    }
}

/// Rate limit for progress notifications.
#[derive(Debug)]
pub struct ProgressThrottle {
    interval: Duration,
    every: u64,
    last_at: Option<Instant>,
    last_count: u64,
}

impl ProgressThrottle {
    pub fn new(interval: Duration, every: u64) -> Self {
        Self {
            interval,
            every: every.max(1),
            last_at: None,
            last_count: 0,
        }
    }

    pub fn should_emit(&mut self, processed: u64, now: Instant) -> bool {
        let due = match self.last_at {
            None => processed > 0,
            Some(at) => {
                now.duration_since(at) >= self.interval
                    || processed.saturating_sub(self.last_count) >= self.every
            }
        };
        if due {
            self.last_at = Some(now);
            self.last_count = processed;
        }
        due
    }
}

/// Directory-name globs the walk never descends into.
#[derive(Debug, Clone)]
pub struct SkipMatcher {
    patterns: Vec<glob::Pattern>,
}

impl SkipMatcher {
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "ignoring invalid skip pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Patterns containing `/` match the full path, the rest match the directory name.
    pub fn is_skipped(&self, name: &str, path: &str) -> bool {
        self.patterns.iter().any(|p| {
            if p.as_str().contains('/') {
                p.matches(path)
            } else {
                p.matches(name)
            }
        })
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    indexed: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> SessionCounts {
        SessionCounts {
            files_processed: self.processed.load(Ordering::Relaxed),
            files_indexed: self.indexed.load(Ordering::Relaxed),
            files_skipped: self.skipped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            files_deleted: 0,
        }
    }
}

struct FlushOutcome {
    changed: Vec<CatalogEntry>,
    elapsed: Duration,
}

/// Walks roots into the catalog and the search index. One crawl at a time.
pub struct Crawler {
    catalog: Catalog,
    search: Option<Arc<dyn SearchIndex>>,
    config: CrawlerConfig,
    events: EventBus,
    running: Arc<AtomicBool>,
    status: Arc<Mutex<CrawlStatus>>,
    cancel: Mutex<Option<CancellationToken>>,
    task: Mutex<Option<JoinHandle<Result<CrawlSummary, AppError>>>>,
}

impl Crawler {
    pub fn new(
        catalog: Catalog,
        search: Option<Arc<dyn SearchIndex>>,
        config: CrawlerConfig,
        events: EventBus,
    ) -> Self {
        Self {
            catalog,
            search,
            config,
            events,
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(CrawlStatus::default())),
            cancel: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> CrawlStatus {
        self.status
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Begins a crawl of `root` and returns its session id without waiting for it.
    pub async fn start(&self, root: &str) -> Result<String, AppError> {
        scope_path::validate_path(root)?;
        let root = scope_path::normalize(root);
        let metadata = tokio::fs::metadata(&root)
            .await
            .map_err(|e| AppError::NotFound(format!("crawl root {root}: {e}")))?;
        if !metadata.is_dir() {
            return Err(AppError::InvalidState(format!("crawl root is not a directory: {root}")));
        }

        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let current = self.status().session_id.unwrap_or_default();
            return Err(AppError::AlreadyRunning(current));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = {
            let id = session_id.clone();
            let root = root.clone();
            let root_entry = CatalogEntry::from_metadata(root.clone(), &metadata);
            self.catalog
                .call(move |conn| {
                    let session = repository::create_session(conn, &id, &root, Utc::now())?;
                    repository::ensure_root_entry(conn, &root_entry, &id)?;
                    Ok(session)
                })
                .await
        };
        if let Err(e) = session {
            self.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(|p| p.into_inner()) = Some(cancel.clone());
        {
            let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
            *status = CrawlStatus {
                running: true,
                session_id: Some(session_id.clone()),
                root_path: Some(root.clone()),
                counts: SessionCounts::default(),
                batch_size: self.config.batch_size,
            };
        }

        let writer = self.search.clone().map(|index| {
            Arc::new(ResilientIndexWriter::new(
                index,
                self.config.index_retry_attempts,
                self.config.index_retry_base_delay(),
            ))
        });
        let run = CrawlRun {
            session_id: session_id.clone(),
            root,
            catalog: self.catalog.clone(),
            config: self.config.clone(),
            events: self.events.clone(),
            writer,
            cancel,
            skip: SkipMatcher::new(&self.config.skip_patterns),
            counters: Arc::new(Counters::default()),
            status: Arc::clone(&self.status),
        };
        let running = Arc::clone(&self.running);
        let status = Arc::clone(&self.status);
        let handle = tokio::spawn(async move {
            let result = run.execute().await;
            status.lock().unwrap_or_else(|p| p.into_inner()).running = false;
            running.store(false, Ordering::SeqCst);
            result
        });
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);

        tracing::info!(session_id = %session_id, "crawl started");
        Ok(session_id)
    }

    /// Requests cooperative cancellation; in-flight batches still drain.
    pub fn stop(&self) -> bool {
        match self.cancel.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            Some(token) if self.is_running() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Awaits the most recently started crawl. `None` when there is nothing to wait for.
    pub async fn wait(&self) -> Option<Result<CrawlSummary, AppError>> {
        let handle = self.task.lock().unwrap_or_else(|p| p.into_inner()).take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(AppError::General(format!("crawl task failed: {e}"))),
        })
    }
}

struct CrawlRun {
    session_id: String,
    root: String,
    catalog: Catalog,
    config: CrawlerConfig,
    events: EventBus,
    writer: Option<Arc<ResilientIndexWriter>>,
    cancel: CancellationToken,
    skip: SkipMatcher,
    counters: Arc<Counters>,
    status: Arc<Mutex<CrawlStatus>>,
}

impl CrawlRun {
    async fn execute(self) -> Result<CrawlSummary, AppError> {
        let started = Instant::now();
        let mut affected = DirectorySizeQueue::new();

        let walked = self.walk(&mut affected).await;
        let stopped = self.cancel.is_cancelled();

        match walked {
            Err(e) => {
                let message = e.to_string();
                tracing::error!(session_id = %self.session_id, error = %message, "crawl failed");
                self.fail(&message).await;
                self.events.emit(Event::CrawlError {
                    session_id: self.session_id.clone(),
                    root_path: self.root.clone(),
                    message,
                });
                Err(e)
            }
            Ok(()) if stopped => {
                tracing::warn!(session_id = %self.session_id, "crawl stopped before completion");
                self.fail(STOPPED_MESSAGE).await;
                self.events.emit(Event::CrawlError {
                    session_id: self.session_id.clone(),
                    root_path: self.root.clone(),
                    message: STOPPED_MESSAGE.to_string(),
                });
                Ok(self.summary(
                    self.counters.snapshot(),
                    DeletionOutcome::SkippedStopped,
                    0,
                    true,
                    started.elapsed(),
                ))
            }
            Ok(()) => match self.finish(affected, started).await {
                Ok(summary) => Ok(summary),
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(session_id = %self.session_id, error = %message, "crawl finalization failed");
                    self.fail(&message).await;
                    self.events.emit(Event::CrawlError {
                        session_id: self.session_id.clone(),
                        root_path: self.root.clone(),
                        message,
                    });
                    Err(e)
                }
            },
        }
    }

    async fn walk(&self, affected: &mut DirectorySizeQueue) -> Result<(), AppError> {
        let mut tuner = BatchTuner::new(self.config.batch_size, self.config.min_batch_size);
        let mut throttle = ProgressThrottle::new(
            self.config.progress_interval(),
            self.config.progress_every_files,
        );
        let mut flushes: JoinSet<Result<FlushOutcome, AppError>> = JoinSet::new();
        let mut index_tasks: JoinSet<()> = JoinSet::new();
        let mut batch: Vec<CatalogEntry> = Vec::new();
        let mut since_yield = 0usize;
        let mut stack: Vec<(PathBuf, usize)> = vec![(PathBuf::from(&self.root), 0)];

        while let Some((dir, depth)) = stack.pop() {
            if self.cancel.is_cancelled() {
                break;
            }

            let children = match self.list_directory(&dir).await {
                Ok(children) => children,
                Err(e) if depth == 0 => return Err(e.into()),
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(path = %dir.display(), error = %e, "failed to read directory");
                    continue;
                }
            };

            let count = children.len();
            let stats = stat_all(children, self.config.stat_concurrency).await;
            if stats.lost > 0 {
                self.counters.processed.fetch_add(stats.lost, Ordering::Relaxed);
                self.counters.errors.fetch_add(stats.lost, Ordering::Relaxed);
            }
            for (path, stat) in stats.results {
                self.counters.processed.fetch_add(1, Ordering::Relaxed);
                match stat {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(meta) => {
                        let path_str = path.to_string_lossy().to_string();
                        if meta.is_dir()
                            && self.config.max_depth.map_or(true, |max| depth + 1 < max)
                        {
                            stack.push((path, depth + 1));
                        }
                        batch.push(CatalogEntry::from_metadata(path_str, &meta));
                    }
                    Err(e) => {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(path = %path.display(), error = %e, "stat failed");
                    }
                }
            }

            if batch.len() >= tuner.size() {
                let full = std::mem::take(&mut batch);
                self.dispatch_flush(full, &mut flushes, &mut index_tasks, &mut tuner, affected)
                    .await?;
            }

            let processed = self.counters.processed.load(Ordering::Relaxed);
            if throttle.should_emit(processed, Instant::now()) {
                self.publish_progress(tuner.size());
            }

            since_yield += count;
            if since_yield >= self.config.yield_every.max(1) {
                since_yield = 0;
                tokio::task::yield_now().await;
            }
        }

        if !batch.is_empty() {
            self.dispatch_flush(batch, &mut flushes, &mut index_tasks, &mut tuner, affected)
                .await?;
        }
        while let Some(joined) = flushes.join_next().await {
            let outcome = joined.map_err(|e| AppError::General(format!("flush task failed: {e}")))??;
            self.absorb_flush(outcome, &mut index_tasks, &mut tuner, affected);
        }
        while index_tasks.join_next().await.is_some() {}

        self.publish_progress(tuner.size());
        Ok(())
    }

    /// Names of the entries in `dir`, minus skipped subdirectories.
    /// Skipping happens on the directory entry type, before any stat.
    async fn list_directory(&self, dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut reader = tokio::fs::read_dir(dir).await?;
        let mut children = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                let name = entry.file_name().to_string_lossy().to_string();
                if self.skip.is_skipped(&name, &path.to_string_lossy()) {
                    continue;
                }
            }
            children.push(path);
        }
        Ok(children)
    }

    async fn dispatch_flush(
        &self,
        batch: Vec<CatalogEntry>,
        flushes: &mut JoinSet<Result<FlushOutcome, AppError>>,
        index_tasks: &mut JoinSet<()>,
        tuner: &mut BatchTuner,
        affected: &mut DirectorySizeQueue,
    ) -> Result<(), AppError> {
        while flushes.len() >= self.config.max_parallel_batches.max(1) {
            if let Some(joined) = flushes.join_next().await {
                let outcome =
                    joined.map_err(|e| AppError::General(format!("flush task failed: {e}")))??;
                self.absorb_flush(outcome, index_tasks, tuner, affected);
            }
        }

        let catalog = self.catalog.clone();
        let session_id = self.session_id.clone();
        let counters = Arc::clone(&self.counters);
        flushes.spawn(async move {
            let started = Instant::now();
            let (changed, unchanged) = catalog
                .call(move |conn| {
                    let (changed, unchanged) = repository::filter_needs_indexing(conn, batch)?;
                    repository::upsert_entries(conn, &changed, &session_id)?;
                    repository::touch_session(conn, &unchanged, &session_id)?;
                    Ok((changed, unchanged.len()))
                })
                .await?;
            counters
                .indexed
                .fetch_add(changed.len() as u64, Ordering::Relaxed);
            counters
                .skipped
                .fetch_add(unchanged as u64, Ordering::Relaxed);
            Ok(FlushOutcome {
                changed,
                elapsed: started.elapsed(),
            })
        });
        Ok(())
    }

    /// Catalog write is done; queue affected directories and hand the batch to the index.
    fn absorb_flush(
        &self,
        outcome: FlushOutcome,
        index_tasks: &mut JoinSet<()>,
        tuner: &mut BatchTuner,
        affected: &mut DirectorySizeQueue,
    ) {
        let mut parents: HashSet<&str> = HashSet::new();
        for entry in &outcome.changed {
            if entry.is_directory {
                affected.push(&entry.path);
            }
            if let Some(parent) = entry.parent_path.as_deref() {
                if parents.insert(parent) {
                    affected.push_ancestors(&entry.path, &self.root);
                }
            }
        }

        let had_errors = self.writer.as_ref().is_some_and(|w| w.is_disabled());
        if let Some(size) = tuner.record(outcome.elapsed, had_errors) {
            tracing::debug!(batch_size = size, "crawl batch size tuned");
            self.status.lock().unwrap_or_else(|p| p.into_inner()).batch_size = size;
        }

        if let Some(writer) = self.writer.clone() {
            if !outcome.changed.is_empty() && !writer.is_disabled() {
                let changed = outcome.changed;
                index_tasks.spawn(async move {
                    writer.index_batch(&changed).await;
                });
            }
        }
    }

    async fn finish(
        &self,
        mut affected: DirectorySizeQueue,
        started: Instant,
    ) -> Result<CrawlSummary, AppError> {
        let mut counts = self.counters.snapshot();

        let deletion = if counts.files_processed == 0 {
            DeletionOutcome::SkippedNoFiles
        } else if let Err(reason) = validate_session(&counts, &self.config.safety) {
            tracing::warn!(session_id = %self.session_id, %reason, "deletion skipped: session validation failed");
            DeletionOutcome::SkippedValidation { reason }
        } else {
            self.reconcile_deletions(&mut affected, &mut counts).await?
        };

        let sizes = directory_size_service::recompute(&self.catalog, affected, &self.config).await?;

        {
            let id = self.session_id.clone();
            let finished = counts.clone();
            self.catalog
                .call(move |conn| {
                    repository::finish_session(
                        conn,
                        &id,
                        SessionStatus::Completed,
                        &finished,
                        None,
                        Utc::now(),
                    )
                })
                .await?;
        }

        let elapsed = started.elapsed();
        let deletion_skipped = match &deletion {
            DeletionOutcome::Deleted { .. } => None,
            other => Some(format!("{other:?}")),
        };
        self.events.emit(Event::CrawlComplete {
            session_id: self.session_id.clone(),
            root_path: self.root.clone(),
            counts: counts.clone(),
            deletion_skipped,
            duration_ms: elapsed.as_millis() as u64,
        });
        tracing::info!(
            session_id = %self.session_id,
            processed = counts.files_processed,
            indexed = counts.files_indexed,
            skipped = counts.files_skipped,
            deleted = counts.files_deleted,
            errors = counts.errors,
            "crawl completed"
        );
        Ok(self.summary(counts, deletion, sizes.resized, false, elapsed))
    }

    async fn reconcile_deletions(
        &self,
        affected: &mut DirectorySizeQueue,
        counts: &mut SessionCounts,
    ) -> Result<DeletionOutcome, AppError> {
        let root = self.root.clone();
        let id = self.session_id.clone();
        let (stale, total) = self
            .catalog
            .call(move |conn| {
                Ok((
                    repository::count_stale_in_scope(conn, &root, &id)?,
                    repository::count_in_scope(conn, &root)?,
                ))
            })
            .await?;
        if stale == 0 || total == 0 {
            return Ok(DeletionOutcome::Deleted { count: 0 });
        }

        let percentage = stale as f64 / total as f64 * 100.0;
        if percentage > self.config.safety.max_deletion_percentage {
            tracing::warn!(
                session_id = %self.session_id,
                stale,
                total,
                percentage,
                "deletion aborted by safety brake"
            );
            return Ok(DeletionOutcome::SafetyBrake { percentage });
        }

        let root = self.root.clone();
        let id = self.session_id.clone();
        let deleted = self
            .catalog
            .call(move |conn| repository::delete_where_session_not(conn, &root, &id))
            .await?;

        for entry in &deleted {
            affected.push_ancestors(&entry.path, &self.root);
        }
        if let Some(writer) = &self.writer {
            let paths: Vec<String> = deleted.iter().map(|d| d.path.clone()).collect();
            writer.delete_paths(&paths).await;
        }

        counts.files_deleted = deleted.len() as u64;
        tracing::info!(session_id = %self.session_id, deleted = deleted.len(), "deleted entries missing from disk");
        Ok(DeletionOutcome::Deleted {
            count: deleted.len(),
        })
    }

    /// Marks the session failed and untags its entries so the next crawl does not infer deletions from it.
    async fn fail(&self, message: &str) {
        let id = self.session_id.clone();
        let message = message.to_string();
        let counts = self.counters.snapshot();
        let result = self
            .catalog
            .call(move |conn| {
                repository::finish_session(
                    conn,
                    &id,
                    SessionStatus::Failed,
                    &counts,
                    Some(&message),
                    Utc::now(),
                )?;
                repository::reset_session_tags(conn, &id)
            })
            .await;
        if let Err(e) = result {
            tracing::error!(session_id = %self.session_id, error = %e, "failed to clean up crawl session");
        }
    }

    fn publish_progress(&self, batch_size: usize) {
        let counts = self.counters.snapshot();
        {
            let mut status = self.status.lock().unwrap_or_else(|p| p.into_inner());
            status.counts = counts.clone();
            status.batch_size = batch_size;
        }
        self.events.emit(Event::CrawlProgress {
            session_id: self.session_id.clone(),
            root_path: self.root.clone(),
            files_processed: counts.files_processed,
            files_indexed: counts.files_indexed,
            files_skipped: counts.files_skipped,
            errors: counts.errors,
            batch_size,
        });
    }

    fn summary(
        &self,
        counts: SessionCounts,
        deletion: DeletionOutcome,
        directories_resized: usize,
        stopped: bool,
        elapsed: Duration,
    ) -> CrawlSummary {
        CrawlSummary {
            session_id: self.session_id.clone(),
            root_path: self.root.clone(),
            counts,
            deletion,
            directories_resized,
            index_failures: self.writer.as_ref().map_or(0, |w| w.failures()),
            index_disabled: self.writer.as_ref().is_some_and(|w| w.is_disabled()),
            stopped,
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Stat results for one directory's children.
struct StatBatch {
    results: Vec<(PathBuf, std::io::Result<std::fs::Metadata>)>,
    /// Stat tasks that panicked; their paths are unknown.
    lost: u64,
}

impl StatBatch {
    fn record(
        &mut self,
        joined: Result<(PathBuf, std::io::Result<std::fs::Metadata>), tokio::task::JoinError>,
    ) {
        match joined {
            Ok(done) => self.results.push(done),
            Err(e) => {
                tracing::warn!(error = %e, "stat task failed");
                self.lost += 1;
            }
        }
    }
}

/// Stats `paths` with at most `limit` calls in flight.
async fn stat_all(paths: Vec<PathBuf>, limit: usize) -> StatBatch {
    stat_all_with(paths, limit, |path| async move {
        tokio::fs::symlink_metadata(path).await
    })
    .await
}

async fn stat_all_with<F, Fut>(paths: Vec<PathBuf>, limit: usize, stat: F) -> StatBatch
where
    F: Fn(PathBuf) -> Fut,
    Fut: Future<Output = std::io::Result<std::fs::Metadata>> + Send + 'static,
{
    let limit = limit.max(1);
    let mut batch = StatBatch {
        results: Vec::with_capacity(paths.len()),
        lost: 0,
    };
    let mut tasks = JoinSet::new();
    for path in paths {
        if tasks.len() >= limit {
            if let Some(joined) = tasks.join_next().await {
                batch.record(joined);
            }
        }
        let pending = stat(path.clone());
        tasks.spawn(async move { (path, pending.await) });
    }
    while let Some(joined) = tasks.join_next().await {
        batch.record(joined);
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::search::{BulkDeleteResult, BulkIndexResult, SearchResult};
    use crate::services::search_service::SqliteSearchIndex;
    use async_trait::async_trait;
    use std::fs;

    fn test_config() -> CrawlerConfig {
        CrawlerConfig {
            batch_size: 2,
            min_batch_size: 1,
            index_retry_base_delay_ms: 1,
            size_staleness_secs: 0,
            size_batch_pause_ms: 0,
            safety: DeletionSafetyConfig {
                min_processed: 1,
                ..DeletionSafetyConfig::default()
            },
            ..CrawlerConfig::default()
        }
    }

    fn root_str(dir: &tempfile::TempDir) -> String {
        dir.path().to_string_lossy().to_string()
    }

    async fn crawl(crawler: &Crawler, root: &str) -> CrawlSummary {
        crawler.start(root).await.unwrap();
        crawler.wait().await.unwrap().unwrap()
    }

    struct DownIndex;

    #[async_trait]
    impl SearchIndex for DownIndex {
        async fn bulk_index(&self, _: &[CatalogEntry]) -> Result<BulkIndexResult, AppError> {
            Err(AppError::SearchIndex("connection refused".to_string()))
        }
        async fn bulk_delete_by_paths(&self, _: &[String]) -> Result<BulkDeleteResult, AppError> {
            Err(AppError::SearchIndex("connection refused".to_string()))
        }
        async fn search(&self, _: &str, _: usize) -> Result<Vec<SearchResult>, AppError> {
            Err(AppError::SearchIndex("connection refused".to_string()))
        }
    }

    #[test]
    fn test_validate_session_thresholds() {
        let safety = DeletionSafetyConfig::default();
        let healthy = SessionCounts {
            files_processed: 100,
            files_indexed: 50,
            files_skipped: 48,
            errors: 2,
            files_deleted: 0,
        };
        assert!(validate_session(&healthy, &safety).is_ok());

        let too_few = SessionCounts {
            files_processed: 5,
            files_indexed: 5,
            ..SessionCounts::default()
        };
        assert!(validate_session(&too_few, &safety).is_err());

        let error_heavy = SessionCounts {
            files_processed: 100,
            files_indexed: 94,
            errors: 6,
            ..SessionCounts::default()
        };
        assert!(validate_session(&error_heavy, &safety).is_err());

        let incomplete = SessionCounts {
            files_processed: 100,
            files_indexed: 80,
            ..SessionCounts::default()
        };
        assert!(validate_session(&incomplete, &safety).is_err());
    }

    #[test]
    fn test_batch_tuner_shrinks_and_grows() {
        let mut tuner = BatchTuner::new(5000, 1000);
        for _ in 0..4 {
            assert_eq!(tuner.record(Duration::from_secs(6), false), None);
        }
        assert_eq!(tuner.record(Duration::from_secs(6), false), Some(4000));

        let mut tuner = BatchTuner::new(5000, 1000);
        for _ in 0..5 {
            tuner.record(Duration::from_millis(100), false);
        }
        assert_eq!(tuner.size(), 6000);

        // never beyond twice the initial size
        for _ in 0..50 {
            tuner.record(Duration::from_millis(100), false);
        }
        assert_eq!(tuner.size(), 10_000);

        // unhealthy windows do not grow
        let mut tuner = BatchTuner::new(5000, 1000);
        for _ in 0..5 {
            tuner.record(Duration::from_millis(100), true);
        }
        assert_eq!(tuner.size(), 5000);
    }

    #[test]
    fn test_batch_tuner_respects_floor() {
        let mut tuner = BatchTuner::new(1100, 1000);
        for _ in 0..10 {
            tuner.record(Duration::from_secs(10), false);
        }
        assert_eq!(tuner.size(), 1000);
    }

    #[test]
    fn test_progress_throttle() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(2), 5000);
        let t0 = Instant::now();
        assert!(!throttle.should_emit(0, t0));
        assert!(throttle.should_emit(1, t0));
        assert!(!throttle.should_emit(10, t0 + Duration::from_millis(500)));
        assert!(throttle.should_emit(5001, t0 + Duration::from_millis(600)));
        assert!(throttle.should_emit(5002, t0 + Duration::from_secs(3)));
    }

    #[test]
    fn test_skip_matcher() {
        let matcher = SkipMatcher::new(&[
            ".*".to_string(),
            "node_modules".to_string(),
            "/data/archive/*".to_string(),
        ]);
        assert!(matcher.is_skipped(".git", "/data/.git"));
        assert!(matcher.is_skipped("node_modules", "/data/app/node_modules"));
        assert!(matcher.is_skipped("2019", "/data/archive/2019"));
        assert!(!matcher.is_skipped("src", "/data/app/src"));
    }

    #[tokio::test]
    async fn test_crawl_catalogs_tree_and_computes_sizes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("a.txt"), "aaa").unwrap();
        fs::write(dir.path().join("sub/b.txt"), "bbbbb").unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), "x").unwrap();

        let catalog = Catalog::open_in_memory().unwrap();
        let index: Arc<dyn SearchIndex> = Arc::new(SqliteSearchIndex::open_in_memory().unwrap());
        let crawler = Crawler::new(catalog.clone(), Some(index.clone()), test_config(), EventBus::new());
        let root = root_str(&dir);

        let summary = crawl(&crawler, &root).await;
        assert!(!summary.stopped);
        assert_eq!(summary.counts.files_processed, 3);
        assert_eq!(summary.counts.files_indexed, 3);
        assert_eq!(summary.counts.errors, 0);

        let skipped = format!("{root}/node_modules");
        assert!(catalog
            .call(move |conn| repository::get_by_path(conn, &skipped))
            .await
            .unwrap()
            .is_none());

        let root_for_query = root.clone();
        let root_entry = catalog
            .call(move |conn| repository::get_by_path(conn, &root_for_query))
            .await
            .unwrap()
            .unwrap();
        let size = root_entry.computed_size.unwrap();
        assert_eq!((size.total_bytes, size.file_count), (8, 2));

        let hits = index.search("b.txt", 10).await.unwrap();
        assert!(hits.iter().any(|h| h.file_path.ends_with("sub/b.txt")));

        let session = catalog
            .call(move |conn| repository::latest_session(conn, Some(&root)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_recrawl_of_unchanged_tree_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a.txt"), "aaa").unwrap();
        fs::write(dir.path().join("sub/b.txt"), "bbb").unwrap();

        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(catalog.clone(), None, test_config(), EventBus::new());
        let root = root_str(&dir);

        crawl(&crawler, &root).await;
        let path = format!("{root}/a.txt");
        let query = path.clone();
        catalog
            .call(move |conn| {
                conn.execute("UPDATE files SET cached = 1 WHERE path = ?1", [&query])?;
                Ok(())
            })
            .await
            .unwrap();

        let second = crawl(&crawler, &root).await;
        assert_eq!(second.counts.files_indexed, 0);
        assert_eq!(second.counts.files_skipped, 3);
        assert_eq!(second.deletion, DeletionOutcome::Deleted { count: 0 });

        let entry = catalog
            .call(move |conn| repository::get_by_path(conn, &path))
            .await
            .unwrap()
            .unwrap();
        assert!(entry.cached);
        assert_eq!(entry.last_seen_session_id.as_deref(), Some(second.session_id.as_str()));
    }

    #[tokio::test]
    async fn test_deleted_files_are_reconciled() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..4 {
            fs::write(dir.path().join(format!("f{i}.txt")), "data").unwrap();
        }

        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(catalog.clone(), None, test_config(), EventBus::new());
        let root = root_str(&dir);
        crawl(&crawler, &root).await;

        fs::remove_file(dir.path().join("f0.txt")).unwrap();
        let summary = crawl(&crawler, &root).await;
        assert_eq!(summary.deletion, DeletionOutcome::Deleted { count: 1 });
        assert_eq!(summary.counts.files_deleted, 1);

        let gone = format!("{root}/f0.txt");
        assert!(catalog
            .call(move |conn| repository::get_by_path(conn, &gone))
            .await
            .unwrap()
            .is_none());

        let root_query = root.clone();
        let root_entry = catalog
            .call(move |conn| repository::get_by_path(conn, &root_query))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(root_entry.computed_size.unwrap().file_count, 3);
    }

    #[tokio::test]
    async fn test_recrawl_indexes_new_file_and_drops_deleted_one() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "aaa").unwrap();
        fs::write(dir.path().join("b.txt"), "bbbbb").unwrap();
        fs::write(dir.path().join("c.txt"), "cc").unwrap();

        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(catalog.clone(), None, test_config(), EventBus::new());
        let root = root_str(&dir);
        let first = crawl(&crawler, &root).await;
        assert_eq!(first.counts.files_indexed, 3);

        fs::remove_file(dir.path().join("c.txt")).unwrap();
        fs::write(dir.path().join("d.txt"), "dddd").unwrap();
        let second = crawl(&crawler, &root).await;
        assert_eq!(second.counts.files_indexed, 1);
        assert_eq!(second.counts.files_skipped, 2);
        assert_eq!(second.counts.files_deleted, 1);
        assert_eq!(second.deletion, DeletionOutcome::Deleted { count: 1 });

        let root_query = root.clone();
        let root_entry = catalog
            .call(move |conn| repository::get_by_path(conn, &root_query))
            .await
            .unwrap()
            .unwrap();
        let size = root_entry.computed_size.unwrap();
        assert_eq!((size.total_bytes, size.file_count), (12, 3));

        let id = second.session_id.clone();
        let session = catalog
            .call(move |conn| repository::get_session(conn, &id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_panicked_stat_counts_as_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("ok.txt"), "x").unwrap();
        let paths = vec![dir.path().join("ok.txt"), dir.path().join("boom")];

        let stats = stat_all_with(paths, 1, |path: PathBuf| async move {
            if path.ends_with("boom") {
                panic!("stat blew up");
            }
            tokio::fs::symlink_metadata(path).await
        })
        .await;
        assert_eq!(stats.lost, 1);
        assert_eq!(stats.results.len(), 1);
        assert!(stats.results[0].1.is_ok());
    }

    #[tokio::test]
    async fn test_safety_brake_blocks_mass_deletion() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            fs::write(dir.path().join(format!("f{i}.txt")), "data").unwrap();
        }

        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(catalog.clone(), None, test_config(), EventBus::new());
        let root = root_str(&dir);
        crawl(&crawler, &root).await;

        for i in 0..5 {
            fs::remove_file(dir.path().join(format!("f{i}.txt"))).unwrap();
        }
        let summary = crawl(&crawler, &root).await;
        assert!(matches!(summary.deletion, DeletionOutcome::SafetyBrake { .. }));

        let count_root = root.clone();
        let remaining = catalog
            .call(move |conn| repository::count_in_scope(conn, &count_root))
            .await
            .unwrap();
        assert_eq!(remaining, 7);
    }

    #[tokio::test]
    async fn test_small_crawl_skips_deletion_under_default_thresholds() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let catalog = Catalog::open_in_memory().unwrap();
        let config = CrawlerConfig {
            safety: DeletionSafetyConfig::default(),
            ..test_config()
        };
        let crawler = Crawler::new(catalog, None, config, EventBus::new());

        let summary = crawl(&crawler, &root_str(&dir)).await;
        assert_eq!(summary.counts.files_processed, 5);
        assert!(matches!(
            summary.deletion,
            DeletionOutcome::SkippedValidation { .. }
        ));
    }

    #[tokio::test]
    async fn test_failing_index_never_fails_catalog_writes() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..5 {
            fs::write(dir.path().join(format!("f{i}.txt")), "x").unwrap();
        }
        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(
            catalog.clone(),
            Some(Arc::new(DownIndex)),
            test_config(),
            EventBus::new(),
        );
        let root = root_str(&dir);

        let summary = crawl(&crawler, &root).await;
        assert!(summary.index_disabled);
        assert!(summary.index_failures >= 1);
        assert_eq!(summary.counts.files_indexed, 5);

        let total = catalog
            .call(move |conn| repository::count_in_scope(conn, &root))
            .await
            .unwrap();
        assert_eq!(total, 6);
    }

    #[tokio::test]
    async fn test_second_start_is_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..50 {
            fs::create_dir_all(dir.path().join(format!("d{i}"))).unwrap();
            fs::write(dir.path().join(format!("d{i}/f.txt")), "x").unwrap();
        }
        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(catalog, None, test_config(), EventBus::new());
        let root = root_str(&dir);

        let session = crawler.start(&root).await.unwrap();
        match crawler.start(&root).await {
            Err(AppError::AlreadyRunning(id)) => assert_eq!(id, session),
            Ok(_) => {
                // the first crawl finished before the second call; nothing to assert
                assert!(crawler.wait().await.is_some());
                return;
            }
            Err(other) => panic!("unexpected error {other}"),
        }
        crawler.wait().await.unwrap().unwrap();
        assert!(!crawler.is_running());
    }

    #[tokio::test]
    async fn test_stopped_crawl_fails_session_and_resets_tags() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..20 {
            fs::create_dir_all(dir.path().join(format!("d{i}"))).unwrap();
        }
        let catalog = Catalog::open_in_memory().unwrap();
        let crawler = Crawler::new(catalog.clone(), None, test_config(), EventBus::new());
        let root = root_str(&dir);

        crawler.start(&root).await.unwrap();
        crawler.stop();
        let summary = crawler.wait().await.unwrap().unwrap();

        if summary.stopped {
            assert_eq!(summary.deletion, DeletionOutcome::SkippedStopped);
            let id = summary.session_id.clone();
            let (session, tagged) = catalog
                .call(move |conn| {
                    let session = repository::get_session(conn, &id)?;
                    let tagged: i64 = conn.query_row(
                        "SELECT COUNT(*) FROM files WHERE last_seen_session_id = ?1",
                        [&id],
                        |row| row.get(0),
                    )?;
                    Ok((session, tagged))
                })
                .await
                .unwrap();
            let session = session.unwrap();
            assert_eq!(session.status, SessionStatus::Failed);
            assert_eq!(session.last_error.as_deref(), Some(STOPPED_MESSAGE));
            assert_eq!(tagged, 0);
        }
    }

    #[tokio::test]
    async fn test_missing_root_is_rejected() {
        let crawler = Crawler::new(
            Catalog::open_in_memory().unwrap(),
            None,
            test_config(),
            EventBus::new(),
        );
        let err = crawler.start("/definitely/not/a/real/root").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!crawler.is_running());
    }
}
