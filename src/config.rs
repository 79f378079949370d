//! Configuration for teamcache.
//!
//! Every field has a serde default so a partial TOML file is valid. The file is
//! looked up at `TEAMCACHE_CONFIG`, falling back to the platform config dir.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::AppError;

const CONFIG_ENV: &str = "TEAMCACHE_CONFIG";
const DATABASE_ENV: &str = "TEAMCACHE_DATABASE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Path to the catalog database
    pub database_path: PathBuf,
    pub search: SearchConfig,
    pub log: LogConfig,
    pub crawler: CrawlerConfig,
    pub scheduler: SchedulerConfig,
    pub monitor: MonitorConfig,
    pub network_client: NetworkClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub enabled: bool,
    /// Separate database for the FTS index; in-memory when unset
    pub index_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Roots crawled automatically by the binary
    pub roots: Vec<PathBuf>,
    /// Re-crawl the roots on this interval; a single crawl at startup when unset
    pub crawl_interval_secs: Option<u64>,
    pub batch_size: usize,
    pub min_batch_size: usize,
    pub max_parallel_batches: usize,
    pub max_depth: Option<usize>,
    /// Glob patterns matched against directory names (or full paths when they contain `/`)
    pub skip_patterns: Vec<String>,
    pub yield_every: usize,
    pub stat_concurrency: usize,
    pub progress_interval_ms: u64,
    pub progress_every_files: u64,
    pub index_retry_attempts: u32,
    pub index_retry_base_delay_ms: u64,
    pub size_staleness_secs: u64,
    pub size_batch_concurrency: usize,
    pub size_batch_pause_ms: u64,
    pub safety: DeletionSafetyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionSafetyConfig {
    pub max_deletion_percentage: f64,
    pub min_completion_rate: f64,
    pub max_error_rate: f64,
    pub min_processed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub worker_count: usize,
    pub max_concurrent_files: usize,
    pub poll_interval_ms: u64,
    pub status_check_interval_ms: u64,
    pub cache_flush_every: usize,
    pub cache_flush_interval_ms: u64,
    pub progress_every: usize,
    pub progress_interval_ms: u64,
    pub read_chunk_bytes: usize,
    /// Parent chains for uncataloged files stop here
    pub mount_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub sweep_interval_secs: u64,
    pub heuristic_interval_secs: u64,
    pub hot_interval_secs: u64,
    pub watch_interval_ms: u64,
    pub page_size: usize,
    pub batch_size: usize,
    pub batch_delay_ms: u64,
    pub lookup_retries: u32,
    pub lookup_retry_delay_ms: u64,
    pub max_concurrent_monitors: usize,
    pub recent_file_age_secs: u64,
    pub hot_directory_limit: usize,
    pub hot_directory_capacity: usize,
    pub hot_directory_ttl_secs: u64,
    pub upload_patterns: Vec<String>,
    pub watch_activity: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkClientConfig {
    pub program: String,
    pub status_args: Vec<String>,
    pub timeout_secs: u64,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "teamcache")
        .map(|dirs| dirs.data_dir().join("teamcache.db"))
        .unwrap_or_else(|| PathBuf::from("teamcache.db"))
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "teamcache")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            search: SearchConfig::default(),
            log: LogConfig::default(),
            crawler: CrawlerConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitor: MonitorConfig::default(),
            network_client: NetworkClientConfig::default(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            index_path: None,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "teamcache=info,teamcache_lib=info".to_string(),
            file: None,
        }
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            crawl_interval_secs: None,
            batch_size: 5000,
            min_batch_size: 1000,
            max_parallel_batches: 3,
            max_depth: None,
            skip_patterns: [
                ".*",
                "node_modules",
                "bower_components",
                "vendor",
                "target",
                "build",
                "dist",
                "out",
                "__pycache__",
                "venv",
                "Pods",
                "DerivedData",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            yield_every: 1000,
            stat_concurrency: 64,
            progress_interval_ms: 2000,
            progress_every_files: 5000,
            index_retry_attempts: 3,
            index_retry_base_delay_ms: 1000,
            size_staleness_secs: 300,
            size_batch_concurrency: 10,
            size_batch_pause_ms: 50,
            safety: DeletionSafetyConfig::default(),
        }
    }
}

impl Default for DeletionSafetyConfig {
    fn default() -> Self {
        Self {
            max_deletion_percentage: 50.0,
            min_completion_rate: 0.90,
            max_error_rate: 0.05,
            min_processed: 10,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            max_concurrent_files: 4,
            poll_interval_ms: 2000,
            status_check_interval_ms: 5000,
            cache_flush_every: 100,
            cache_flush_interval_ms: 10_000,
            progress_every: 50,
            progress_interval_ms: 5000,
            read_chunk_bytes: 1024 * 1024,
            mount_root: None,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sweep_interval_secs: 30,
            heuristic_interval_secs: 30,
            hot_interval_secs: 10,
            watch_interval_ms: 5000,
            page_size: 1000,
            batch_size: 10,
            batch_delay_ms: 100,
            lookup_retries: 1,
            lookup_retry_delay_ms: 250,
            max_concurrent_monitors: 50,
            recent_file_age_secs: 300,
            hot_directory_limit: 20,
            hot_directory_capacity: 256,
            hot_directory_ttl_secs: 900,
            upload_patterns: Vec::new(),
            watch_activity: false,
        }
    }
}

impl Default for NetworkClientConfig {
    fn default() -> Self {
        Self {
            program: "lucid".to_string(),
            status_args: vec!["file".to_string(), "--status".to_string()],
            timeout_secs: 10,
        }
    }
}

impl CrawlerConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn index_retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.index_retry_base_delay_ms)
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn status_check_interval(&self) -> Duration {
        Duration::from_millis(self.status_check_interval_ms)
    }

    pub fn cache_flush_interval(&self) -> Duration {
        Duration::from_millis(self.cache_flush_interval_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

impl MonitorConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn heuristic_interval(&self) -> Duration {
        Duration::from_secs(self.heuristic_interval_secs)
    }

    pub fn hot_interval(&self) -> Duration {
        Duration::from_secs(self.hot_interval_secs)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn recent_file_age(&self) -> Duration {
        Duration::from_secs(self.recent_file_age_secs)
    }

    pub fn hot_directory_ttl(&self) -> Duration {
        Duration::from_secs(self.hot_directory_ttl_secs)
    }

    /// Stored statuses older than twice the sweep interval are considered stale.
    pub fn stale_after(&self) -> Duration {
        self.sweep_interval() * 2
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&content).map_err(|e| AppError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Resolve the config file from the environment, defaulting when it does not exist.
    pub fn load_default() -> Result<Self, AppError> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .ok()
            .or_else(default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => Self::load(&path)?,
            _ => Self::default(),
        };

        if let Ok(db) = std::env::var(DATABASE_ENV) {
            config.database_path = PathBuf::from(db);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.crawler.batch_size == 0 || self.crawler.max_parallel_batches == 0 {
            return Err(AppError::Config(
                "crawler batch_size and max_parallel_batches must be positive".to_string(),
            ));
        }
        if self.scheduler.worker_count == 0 || self.scheduler.max_concurrent_files == 0 {
            return Err(AppError::Config(
                "scheduler worker_count and max_concurrent_files must be positive".to_string(),
            ));
        }
        if self.monitor.max_concurrent_monitors == 0 || self.monitor.batch_size == 0 {
            return Err(AppError::Config(
                "monitor max_concurrent_monitors and batch_size must be positive".to_string(),
            ));
        }
        let pct = self.crawler.safety.max_deletion_percentage;
        if !(0.0..=100.0).contains(&pct) {
            return Err(AppError::Config(format!(
                "max_deletion_percentage must be within 0..=100, got {pct}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_preserve_safety_thresholds() {
        let config = AppConfig::default();
        assert_eq!(config.crawler.safety.max_deletion_percentage, 50.0);
        assert_eq!(config.crawler.safety.min_completion_rate, 0.90);
        assert_eq!(config.crawler.safety.max_error_rate, 0.05);
        assert_eq!(config.crawler.safety.min_processed, 10);
        assert_eq!(config.crawler.max_parallel_batches, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            database_path = "/tmp/catalog.db"

            [scheduler]
            worker_count = 8

            [monitor]
            upload_patterns = ["/mnt/fs/projects/*/incoming"]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.database_path, PathBuf::from("/tmp/catalog.db"));
        assert_eq!(parsed.scheduler.worker_count, 8);
        assert_eq!(parsed.scheduler.max_concurrent_files, 4);
        assert_eq!(parsed.monitor.upload_patterns.len(), 1);
        assert_eq!(parsed.crawler.batch_size, 5000);
    }

    #[test]
    fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[crawler]\nbatch_size = 1234\n").unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.crawler.batch_size, 1234);
    }

    #[test]
    fn validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.scheduler.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn stale_after_is_twice_the_sweep_interval() {
        let config = MonitorConfig::default();
        assert_eq!(config.stale_after(), Duration::from_secs(60));
    }
}
