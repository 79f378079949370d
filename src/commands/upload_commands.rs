use crate::data::repository;
use crate::error::AppError;
use crate::models::upload::{MonitorSnapshot, ScanStats};
use crate::state::AppState;

/// Active watchers with their check counts, queued paths and hot directories.
pub fn monitor_status(state: &AppState) -> MonitorSnapshot {
    state.monitor.snapshot()
}

/// Paths the catalog currently records as uploading.
pub async fn list_uploading(state: &AppState) -> Result<Vec<String>, AppError> {
    state.catalog.call(|conn| repository::list_uploading(conn)).await
}

/// Runs a sweep now instead of waiting for the next tick.
pub async fn sweep_now(state: &AppState) -> Result<ScanStats, AppError> {
    state.monitor.sweep_scan().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file_entry::{CatalogEntry, UploadState};
    use crate::state::tests::test_state;
    use chrono::Utc;

    #[tokio::test]
    async fn sweep_settles_recorded_uploads() {
        let state = test_state();
        state
            .catalog
            .call(|conn| {
                repository::upsert_entries(
                    conn,
                    &[CatalogEntry::sighted("/m/a".to_string(), false, 1, None, None)],
                    "s1",
                )?;
                repository::set_upload_status(conn, "/m/a", UploadState::Uploading, Utc::now())
            })
            .await
            .unwrap();
        assert_eq!(list_uploading(&state).await.unwrap(), vec!["/m/a"]);

        let stats = sweep_now(&state).await.unwrap();
        assert_eq!(stats.checked, 1);
        assert!(list_uploading(&state).await.unwrap().is_empty());
        assert!(monitor_status(&state).active.is_empty());
    }
}
