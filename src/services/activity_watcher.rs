use std::path::{Path, PathBuf};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::error::AppError;
use crate::scope_path;
use crate::services::upload_monitor_service::UploadMonitor;

/// Keeps the filesystem watcher alive. Dropping it stops watching.
pub struct ActivityHandle {
    _watcher: RecommendedWatcher,
}

/// Records a hot-directory hit for the parent of every created or modified path.
pub fn start_watching(monitor: UploadMonitor, dirs: Vec<PathBuf>) -> Result<ActivityHandle, AppError> {
    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in &event.paths {
                    if let Some(parent) = path.parent() {
                        monitor.record_activity(&scope_path::normalize(&parent.to_string_lossy()));
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "activity watcher error"),
        }
    })
    .map_err(|e| AppError::Watcher(e.to_string()))?;

    let mut watching = 0usize;
    for dir in dirs {
        if !Path::new(&dir).is_dir() {
            tracing::warn!(dir = %dir.display(), "not a directory; skipping activity watch");
            continue;
        }
        watcher
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| AppError::Watcher(format!("{}: {e}", dir.display())))?;
        watching += 1;
    }
    tracing::info!(dirs = watching, "activity watcher started");

    Ok(ActivityHandle { _watcher: watcher })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MonitorConfig;
    use crate::data::Catalog;
    use crate::events::EventBus;
    use crate::services::upload_status_service::CliUploadStatusApi;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_new_files_mark_their_directory_hot() {
        let dir = tempfile::tempdir().unwrap();
        let incoming = dir.path().join("incoming");
        std::fs::create_dir_all(&incoming).unwrap();

        let monitor = UploadMonitor::new(
            Catalog::open_in_memory().unwrap(),
            Arc::new(CliUploadStatusApi::new(&Default::default())),
            MonitorConfig::default(),
            EventBus::new(),
        );
        let handle = start_watching(
            monitor.clone(),
            vec![incoming.clone(), dir.path().join("missing")],
        )
        .unwrap();

        std::fs::write(incoming.join("plate.exr"), b"frame").unwrap();

        let expected = incoming.to_string_lossy().to_string();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let hot = monitor.snapshot().hot_directories;
            if hot.iter().any(|h| h.path == expected) {
                break;
            }
            assert!(Instant::now() < deadline, "no activity recorded for {expected}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        drop(handle);
    }
}
