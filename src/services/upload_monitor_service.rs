use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::MonitorConfig;
use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::events::{Event, EventBus};
use crate::models::file_entry::UploadState;
use crate::models::upload::{
    HotDirectory, MonitorSnapshot, ScanStats, UploadMonitorEntry, UploadStatusReport,
};
use crate::scope_path;
use crate::services::upload_status_service::{self, UploadStatusApi};

struct HotEntry {
    hits: u32,
    last_hit: Instant,
}

/// Directories that recently produced upload hits. Bounded, idle entries expire,
/// and at capacity the least recently hit entry goes first.
pub struct HotDirectories {
    entries: HashMap<String, HotEntry>,
    capacity: usize,
    ttl: Duration,
}

impl HotDirectories {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn record(&mut self, dir: &str, now: Instant) {
        self.expire(now);
        if let Some(entry) = self.entries.get_mut(dir) {
            entry.hits = entry.hits.saturating_add(1);
            entry.last_hit = now;
            return;
        }
        if self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_hit)
                .map(|(path, _)| path.clone());
            if let Some(oldest) = oldest {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(
            dir.to_string(),
            HotEntry {
                hits: 1,
                last_hit: now,
            },
        );
    }

    /// Most active directories first; recency breaks ties.
    pub fn top(&mut self, limit: usize, now: Instant) -> Vec<HotDirectory> {
        self.expire(now);
        let mut ranked: Vec<(&String, &HotEntry)> = self.entries.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.hits
                .cmp(&a.1.hits)
                .then_with(|| b.1.last_hit.cmp(&a.1.last_hit))
        });
        ranked
            .into_iter()
            .take(limit)
            .map(|(path, e)| HotDirectory {
                path: path.clone(),
                hits: e.hits,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn expire(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.last_hit) <= ttl);
    }
}

struct MonitorState {
    active: HashMap<String, UploadMonitorEntry>,
    queue: VecDeque<String>,
    queued: HashSet<String>,
    hot: HotDirectories,
}

struct MonitorInner {
    catalog: Catalog,
    api: Arc<dyn UploadStatusApi>,
    config: MonitorConfig,
    events: EventBus,
    state: Mutex<MonitorState>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Tracks which files remote collaborators are still uploading.
#[derive(Clone)]
pub struct UploadMonitor {
    inner: Arc<MonitorInner>,
}

impl UploadMonitor {
    pub fn new(
        catalog: Catalog,
        api: Arc<dyn UploadStatusApi>,
        config: MonitorConfig,
        events: EventBus,
    ) -> Self {
        let hot = HotDirectories::new(config.hot_directory_capacity, config.hot_directory_ttl());
        Self {
            inner: Arc::new(MonitorInner {
                catalog,
                api,
                config,
                events,
                state: Mutex::new(MonitorState {
                    active: HashMap::new(),
                    queue: VecDeque::new(),
                    queued: HashSet::new(),
                    hot,
                }),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Starts watching `path`, or queues it when every watcher slot is taken.
    /// Returns false if the path was already active or queued.
    pub fn enqueue(&self, path: &str) -> bool {
        let mut state = self.state();
        if state.active.contains_key(path) || state.queued.contains(path) {
            return false;
        }
        if state.active.len() < self.inner.config.max_concurrent_monitors.max(1) {
            self.activate(&mut state, path.to_string());
        } else {
            state.queued.insert(path.to_string());
            state.queue.push_back(path.to_string());
            tracing::debug!(path, queued = state.queue.len(), "upload watcher queued");
        }
        true
    }

    pub fn is_watched(&self, path: &str) -> bool {
        let state = self.state();
        state.active.contains_key(path) || state.queued.contains(path)
    }

    /// Records upload activity in `dir` so the hot pass rescans it.
    pub fn record_activity(&self, dir: &str) {
        self.state().hot.record(dir, Instant::now());
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let mut state = self.state();
        let mut active: Vec<UploadMonitorEntry> = state.active.values().cloned().collect();
        active.sort_by(|a, b| a.path.cmp(&b.path));
        let queued = state.queue.iter().cloned().collect();
        let capacity = state.hot.capacity;
        let hot_directories = state.hot.top(capacity, Instant::now());
        MonitorSnapshot {
            active,
            queued,
            hot_directories,
        }
    }

    fn activate(&self, state: &mut MonitorState, path: String) {
        state.active.insert(
            path.clone(),
            UploadMonitorEntry {
                path: path.clone(),
                started_at: Utc::now(),
                check_count: 0,
            },
        );
        tracing::debug!(path = %path, active = state.active.len(), "upload watcher started");
        let monitor = self.clone();
        self.inner.tracker.spawn(async move { monitor.watch(path).await });
    }

    /// Frees the watcher slot for `path` and promotes queued paths into free slots.
    fn release(&self, path: &str) {
        let mut state = self.state();
        state.active.remove(path);
        let limit = self.inner.config.max_concurrent_monitors.max(1);
        while state.active.len() < limit {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            state.queued.remove(&next);
            self.activate(&mut state, next);
        }
    }

    async fn watch(self, path: String) {
        let interval = self.inner.config.watch_interval();
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            let checked = upload_status_service::check_batch(
                &self.inner.api,
                std::slice::from_ref(&path),
                &self.inner.config,
            )
            .await
            .pop()
            .map(|(_, result)| result)
            .unwrap_or_else(|| Err(AppError::UploadStatus("no lookup result".to_string())));

            if let Some(entry) = self.state().active.get_mut(&path) {
                entry.check_count += 1;
            }

            match checked {
                Ok(report) if report.is_uploading => {
                    self.persist(&path, UploadState::Uploading).await;
                }
                Ok(_) => {
                    self.persist(&path, UploadState::Complete).await;
                    self.inner.events.emit(Event::UploadCompleted { path: path.clone() });
                    tracing::info!(path = %path, "upload finished");
                    break;
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "upload status lookup failed; ending watch");
                    break;
                }
            }
        }
        self.release(&path);
    }

    async fn persist(&self, path: &str, state: UploadState) {
        let owned = path.to_string();
        let result = self
            .inner
            .catalog
            .call(move |conn| repository::set_upload_status(conn, &owned, state, Utc::now()))
            .await;
        match result {
            Ok(true) => {}
            Ok(false) => tracing::trace!(path, "upload status for uncataloged path not persisted"),
            Err(e) => tracing::warn!(path, error = %e, "failed to persist upload status"),
        }
    }

    fn detected(&self, report: &UploadStatusReport) {
        self.inner.events.emit(Event::UploadDetected {
            path: report.path.clone(),
            remote_id: report.remote_id.clone(),
        });
        tracing::info!(path = %report.path, remote_id = ?report.remote_id, "upload detected");
    }

    /// Pages the whole catalog, clearing stale statuses and persisting changes.
    pub async fn sweep_scan(&self) -> Result<ScanStats, AppError> {
        let mut stats = ScanStats::default();
        let stale_after = chrono::Duration::from_std(self.inner.config.stale_after())
            .map_err(|e| AppError::Config(e.to_string()))?;
        let cutoff = Utc::now() - stale_after;
        stats.cleared_stale = self
            .inner
            .catalog
            .call(move |conn| repository::clear_stale_upload_status(conn, cutoff))
            .await?;

        let page_size = self.inner.config.page_size.max(1);
        let mut after_id = 0i64;
        loop {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            let page = self
                .inner
                .catalog
                .call(move |conn| repository::page_files(conn, after_id, page_size))
                .await?;
            let Some((last_id, _, _)) = page.last() else {
                break;
            };
            after_id = *last_id;

            let stored: HashMap<String, Option<UploadState>> = page
                .iter()
                .map(|(_, path, state)| (path.clone(), *state))
                .collect();
            let paths: Vec<String> = page.into_iter().map(|(_, path, _)| path).collect();
            let results =
                upload_status_service::check_batch(&self.inner.api, &paths, &self.inner.config)
                    .await;

            for (path, result) in results {
                let report = match result {
                    Ok(report) => report,
                    Err(e) => {
                        stats.errors += 1;
                        tracing::debug!(path = %path, error = %e, "sweep lookup failed");
                        continue;
                    }
                };
                stats.checked += 1;
                let was_uploading = stored.get(&path).copied().flatten() == Some(UploadState::Uploading);
                if report.is_uploading {
                    stats.uploading += 1;
                    if !was_uploading {
                        stats.newly_detected += 1;
                        self.persist(&path, UploadState::Uploading).await;
                        self.detected(&report);
                    }
                    self.enqueue(&path);
                } else if was_uploading && !self.is_watched(&path) {
                    self.persist(&path, UploadState::Complete).await;
                }
            }
        }

        tracing::info!(
            checked = stats.checked,
            uploading = stats.uploading,
            newly_detected = stats.newly_detected,
            errors = stats.errors,
            cleared_stale = stats.cleared_stale,
            "upload sweep finished"
        );
        Ok(stats)
    }

    /// Checks recently modified files under every directory the upload patterns match.
    pub async fn heuristic_scan(&self) -> Result<ScanStats, AppError> {
        let patterns = self.inner.config.upload_patterns.clone();
        let dirs = tokio::task::spawn_blocking(move || expand_patterns(&patterns))
            .await
            .map_err(|e| AppError::General(format!("pattern expansion failed: {e}")))?;
        let stats = self.scan_directories(dirs).await;
        tracing::debug!(checked = stats.checked, uploading = stats.uploading, "heuristic upload scan finished");
        Ok(stats)
    }

    /// Rescans the most active hot directories.
    pub async fn hot_scan(&self) -> Result<ScanStats, AppError> {
        let dirs: Vec<PathBuf> = self
            .state()
            .hot
            .top(self.inner.config.hot_directory_limit, Instant::now())
            .into_iter()
            .map(|hot| PathBuf::from(hot.path))
            .collect();
        if dirs.is_empty() {
            return Ok(ScanStats::default());
        }
        let stats = self.scan_directories(dirs).await;
        tracing::debug!(checked = stats.checked, uploading = stats.uploading, "hot directory scan finished");
        Ok(stats)
    }

    async fn scan_directories(&self, dirs: Vec<PathBuf>) -> ScanStats {
        let mut stats = ScanStats::default();
        let max_age = self.inner.config.recent_file_age();
        for dir in dirs {
            if self.inner.shutdown.is_cancelled() {
                break;
            }
            let recent = match recent_files(&dir, max_age).await {
                Ok(recent) => recent,
                Err(e) => {
                    stats.errors += 1;
                    tracing::debug!(dir = %dir.display(), error = %e, "could not list upload directory");
                    continue;
                }
            };
            if recent.is_empty() {
                continue;
            }

            let results =
                upload_status_service::check_batch(&self.inner.api, &recent, &self.inner.config)
                    .await;
            let mut hits = 0usize;
            for (path, result) in results {
                match result {
                    Ok(report) => {
                        stats.checked += 1;
                        if !report.is_uploading {
                            continue;
                        }
                        stats.uploading += 1;
                        hits += 1;
                        if self.enqueue(&path) {
                            stats.newly_detected += 1;
                            self.persist(&path, UploadState::Uploading).await;
                            self.detected(&report);
                        }
                    }
                    Err(e) => {
                        stats.errors += 1;
                        tracing::debug!(path = %path, error = %e, "heuristic lookup failed");
                    }
                }
            }
            if hits > 0 {
                self.record_activity(&scope_path::normalize(&dir.to_string_lossy()));
            }
        }
        stats
    }

    /// Spawns the sweep, heuristic and hot-directory timers.
    pub fn start(&self) {
        let config = &self.inner.config;
        self.spawn_timer("sweep", config.sweep_interval(), |m| async move {
            m.sweep_scan().await.map(|_| ())
        });
        if !config.upload_patterns.is_empty() {
            self.spawn_timer("heuristic", config.heuristic_interval(), |m| async move {
                m.heuristic_scan().await.map(|_| ())
            });
        }
        self.spawn_timer("hot", config.hot_interval(), |m| async move {
            m.hot_scan().await.map(|_| ())
        });
        tracing::info!(
            max_watchers = config.max_concurrent_monitors,
            patterns = config.upload_patterns.len(),
            "upload monitor started"
        );
    }

    fn spawn_timer<F, Fut>(&self, name: &'static str, every: Duration, scan: F)
    where
        F: Fn(UploadMonitor) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<(), AppError>> + Send + 'static,
    {
        let monitor = self.clone();
        let shutdown = self.inner.shutdown.clone();
        self.inner.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = scan(monitor.clone()).await {
                    tracing::warn!(scan = name, error = %e, "upload scan failed");
                }
            }
        });
    }

    /// Stops timers and abandons watchers.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!("upload monitor stopped");
    }
}

/// Expands glob patterns to the directories they match.
pub fn expand_patterns(patterns: &[String]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for pattern in patterns {
        match glob::glob(pattern) {
            Ok(paths) => dirs.extend(paths.filter_map(Result::ok).filter(|p| p.is_dir())),
            Err(e) => tracing::warn!(pattern = %pattern, error = %e, "invalid upload pattern"),
        }
    }
    dirs.sort();
    dirs.dedup();
    dirs
}

/// Plain files directly inside `dir` modified within `max_age`.
async fn recent_files(dir: &std::path::Path, max_age: Duration) -> Result<Vec<String>, AppError> {
    let now = SystemTime::now();
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut recent = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        let fresh = metadata
            .modified()
            .ok()
            .and_then(|m| now.duration_since(m).ok())
            .map(|age| age <= max_age)
            .unwrap_or(true);
        if fresh {
            recent.push(entry.path().to_string_lossy().to_string());
        }
    }
    recent.sort();
    Ok(recent)
}
