use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::config::{MonitorConfig, NetworkClientConfig};
use crate::error::AppError;
use crate::models::upload::UploadStatusReport;

const UPLOADING_VALUES: &[&str] = &["uploading", "in progress", "in-progress", "pending", "syncing"];
const STATE_KEYS: &[&str] = &["state", "status", "upload"];
const ID_KEYS: &[&str] = &["id", "remote id", "file id"];

/// Per-path lookup of whether a remote collaborator is still writing a file.
/// Callers rate-limit; implementations do not.
#[async_trait]
pub trait UploadStatusApi: Send + Sync {
    async fn check_status(&self, path: &str) -> Result<UploadStatusReport, AppError>;
}

/// Asks the network client's CLI: `<program> <status args…> <path>`.
pub struct CliUploadStatusApi {
    program: PathBuf,
    args: Vec<String>,
    timeout: Duration,
}

impl CliUploadStatusApi {
    pub fn new(config: &NetworkClientConfig) -> Self {
        Self {
            program: PathBuf::from(&config.program),
            args: config.status_args.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl UploadStatusApi for CliUploadStatusApi {
    async fn check_status(&self, path: &str) -> Result<UploadStatusReport, AppError> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg(path).kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| {
                AppError::UploadStatus(format!(
                    "status lookup for {path} timed out after {:?}",
                    self.timeout
                ))
            })?
            .map_err(|e| {
                AppError::UploadStatus(format!(
                    "failed to run {}: {e}",
                    self.program.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AppError::UploadStatus(format!(
                "status lookup for {path} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        parse_status_output(path, &String::from_utf8_lossy(&output.stdout))
    }
}

/// Parses `key: value` lines. Keys are case-insensitive; a missing state line is an error.
pub fn parse_status_output(path: &str, output: &str) -> Result<UploadStatusReport, AppError> {
    let mut state: Option<String> = None;
    let mut remote_id: Option<String> = None;

    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        if STATE_KEYS.contains(&key.as_str()) && state.is_none() {
            state = Some(value.to_ascii_lowercase());
        } else if ID_KEYS.contains(&key.as_str()) && remote_id.is_none() && !value.is_empty() {
            remote_id = Some(value.to_string());
        }
    }

    let state = state.ok_or_else(|| {
        AppError::UploadStatus(format!("no upload state reported for {path}"))
    })?;

    Ok(UploadStatusReport {
        path: path.to_string(),
        is_uploading: UPLOADING_VALUES.contains(&state.as_str()),
        remote_id,
        checked_at: Utc::now(),
    })
}

async fn check_with_retry(
    api: &dyn UploadStatusApi,
    path: &str,
    retries: u32,
    delay: Duration,
) -> Result<UploadStatusReport, AppError> {
    let mut attempt = 0u32;
    loop {
        match api.check_status(path).await {
            Ok(report) => return Ok(report),
            Err(e) if attempt < retries => {
                attempt += 1;
                tracing::debug!(path, attempt, error = %e, "retrying upload status lookup");
                tokio::time::sleep(delay * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Checks `paths` in chunks of `batch_size` concurrent lookups, pausing between chunks.
/// Results keep the input order.
pub async fn check_batch(
    api: &Arc<dyn UploadStatusApi>,
    paths: &[String],
    config: &MonitorConfig,
) -> Vec<(String, Result<UploadStatusReport, AppError>)> {
    let chunk = config.batch_size.max(1);
    let retry_delay = Duration::from_millis(config.lookup_retry_delay_ms);
    let pause = Duration::from_millis(config.batch_delay_ms);
    let mut results = Vec::with_capacity(paths.len());

    for (n, batch) in paths.chunks(chunk).enumerate() {
        if n > 0 && !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        let mut lookups = JoinSet::new();
        for (slot, path) in batch.iter().enumerate() {
            let api = Arc::clone(api);
            let path = path.clone();
            let retries = config.lookup_retries;
            lookups.spawn(async move {
                let result = check_with_retry(api.as_ref(), &path, retries, retry_delay).await;
                (slot, path, result)
            });
        }

        let mut done: Vec<Option<(String, Result<UploadStatusReport, AppError>)>> =
            (0..batch.len()).map(|_| None).collect();
        while let Some(joined) = lookups.join_next().await {
            match joined {
                Ok((slot, path, result)) => done[slot] = Some((path, result)),
                Err(e) => tracing::error!(error = %e, "upload status lookup task panicked"),
            }
        }
        for (slot, entry) in done.into_iter().enumerate() {
            results.push(entry.unwrap_or_else(|| {
                (
                    batch[slot].clone(),
                    Err(AppError::UploadStatus("lookup task aborted".to_string())),
                )
            }));
        }
    }
    results
}
