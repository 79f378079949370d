use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::data::Catalog;
use crate::error::AppError;
use crate::events::EventBus;
use crate::services::activity_watcher::{self, ActivityHandle};
use crate::services::cache_scheduler::CacheScheduler;
use crate::services::cache_service::{CacheJobService, CacheWarmer, FileReadWarmer};
use crate::services::indexing_service::Crawler;
use crate::services::search_service::{SearchIndex, SqliteSearchIndex};
use crate::services::upload_monitor_service::{self, UploadMonitor};
use crate::services::upload_status_service::{CliUploadStatusApi, UploadStatusApi};

/// Everything one process owns: the catalog, the index and the three subsystems.
pub struct AppState {
    pub config: AppConfig,
    pub catalog: Catalog,
    pub search: Option<Arc<dyn SearchIndex>>,
    pub events: EventBus,
    pub crawler: Crawler,
    pub jobs: CacheJobService,
    pub scheduler: CacheScheduler,
    pub monitor: UploadMonitor,
    pub shutdown: CancellationToken,
    activity: Mutex<Option<ActivityHandle>>,
}

impl AppState {
    /// Opens the on-disk catalog and search index named by `config`.
    pub fn open(config: AppConfig) -> Result<Self, AppError> {
        let catalog = Catalog::open(&config.database_path)?;
        let search = if config.search.enabled {
            let path = search_index_path(&config);
            match SqliteSearchIndex::open(&path) {
                Ok(index) => Some(Arc::new(index) as Arc<dyn SearchIndex>),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "search index unavailable; using catalog search");
                    None
                }
            }
        } else {
            None
        };
        let status_api: Arc<dyn UploadStatusApi> =
            Arc::new(CliUploadStatusApi::new(&config.network_client));
        let warmer: Arc<dyn CacheWarmer> =
            Arc::new(FileReadWarmer::new(config.scheduler.read_chunk_bytes));
        Ok(Self::from_parts(config, catalog, search, status_api, warmer))
    }

    pub fn from_parts(
        config: AppConfig,
        catalog: Catalog,
        search: Option<Arc<dyn SearchIndex>>,
        status_api: Arc<dyn UploadStatusApi>,
        warmer: Arc<dyn CacheWarmer>,
    ) -> Self {
        let events = EventBus::new();
        let crawler = Crawler::new(
            catalog.clone(),
            search.clone(),
            config.crawler.clone(),
            events.clone(),
        );
        let jobs = CacheJobService::new(catalog.clone(), &config.crawler.skip_patterns);
        let scheduler = CacheScheduler::new(
            catalog.clone(),
            warmer,
            config.scheduler.clone(),
            &config.crawler.skip_patterns,
            events.clone(),
        );
        let monitor = UploadMonitor::new(
            catalog.clone(),
            status_api,
            config.monitor.clone(),
            events.clone(),
        );
        Self {
            config,
            catalog,
            search,
            events,
            crawler,
            jobs,
            scheduler,
            monitor,
            shutdown: CancellationToken::new(),
            activity: Mutex::new(None),
        }
    }

    /// Starts the worker pool, the monitor timers and, if enabled, the activity watcher.
    pub async fn start_background(&self) -> Result<(), AppError> {
        self.scheduler.start().await?;
        if !self.config.monitor.enabled {
            tracing::info!("upload monitor disabled");
            return Ok(());
        }
        self.monitor.start();

        if self.config.monitor.watch_activity {
            let patterns = self.config.monitor.upload_patterns.clone();
            let dirs = tokio::task::spawn_blocking(move || {
                upload_monitor_service::expand_patterns(&patterns)
            })
            .await
            .map_err(|e| AppError::General(format!("pattern expansion failed: {e}")))?;
            match activity_watcher::start_watching(self.monitor.clone(), dirs) {
                Ok(handle) => {
                    *self.activity.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
                }
                Err(e) => tracing::warn!(error = %e, "activity watcher not started"),
            }
        }
        Ok(())
    }

    /// Stops the crawl, releases running cache jobs and halts the monitor.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if self.crawler.stop() {
            tracing::info!("waiting for the running crawl to drain");
        }
        if let Some(Err(e)) = self.crawler.wait().await {
            tracing::warn!(error = %e, "crawl ended with an error during shutdown");
        }
        self.scheduler.stop().await;
        self.activity.lock().unwrap_or_else(|p| p.into_inner()).take();
        self.monitor.stop().await;
    }
}

fn search_index_path(config: &AppConfig) -> PathBuf {
    config.search.index_path.clone().unwrap_or_else(|| {
        config
            .database_path
            .with_file_name("teamcache-search.db")
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::upload::UploadStatusReport;
    use async_trait::async_trait;
    use chrono::Utc;

    pub(crate) struct IdleStatus;

    #[async_trait]
    impl UploadStatusApi for IdleStatus {
        async fn check_status(&self, path: &str) -> Result<UploadStatusReport, AppError> {
            Ok(UploadStatusReport {
                path: path.to_string(),
                is_uploading: false,
                remote_id: None,
                checked_at: Utc::now(),
            })
        }
    }

    /// In-memory state with millisecond cadences.
    pub(crate) fn test_state() -> AppState {
        let mut config = AppConfig::default();
        config.crawler.size_batch_pause_ms = 0;
        config.crawler.size_staleness_secs = 0;
        config.crawler.safety.min_processed = 1;
        config.scheduler.poll_interval_ms = 10;
        config.scheduler.status_check_interval_ms = 20;
        config.monitor.sweep_interval_secs = 3600;
        config.monitor.hot_interval_secs = 3600;
        AppState::from_parts(
            config,
            Catalog::open_in_memory().unwrap(),
            Some(Arc::new(SqliteSearchIndex::open_in_memory().unwrap())),
            Arc::new(IdleStatus),
            Arc::new(FileReadWarmer::new(4096)),
        )
    }

    #[test]
    fn search_index_defaults_beside_the_catalog() {
        let mut config = AppConfig::default();
        config.database_path = PathBuf::from("/var/lib/teamcache/catalog.db");
        assert_eq!(
            search_index_path(&config),
            PathBuf::from("/var/lib/teamcache/teamcache-search.db")
        );
        config.search.index_path = Some(PathBuf::from("/srv/index.db"));
        assert_eq!(search_index_path(&config), PathBuf::from("/srv/index.db"));
    }

    #[tokio::test]
    async fn start_and_shutdown_are_clean() {
        let state = test_state();
        state.start_background().await.unwrap();
        state.shutdown().await;
        assert!(state.shutdown.is_cancelled());
        assert!(!state.crawler.is_running());
    }

    #[tokio::test]
    async fn open_creates_catalog_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::default();
        config.database_path = dir.path().join("db").join("catalog.db");
        let state = AppState::open(config).unwrap();
        assert!(state.search.is_some());
        assert!(dir.path().join("db").join("catalog.db").exists());
        assert!(dir.path().join("db").join("teamcache-search.db").exists());
    }
}
