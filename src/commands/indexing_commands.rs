use crate::data::repository;
use crate::error::AppError;
use crate::models::session::IndexingSession;
use crate::services::indexing_service::CrawlStatus;
use crate::state::AppState;

/// Starts a crawl of `root`. Fails with `AlreadyRunning` while another crawl is active.
pub async fn start_crawl(state: &AppState, root: &str) -> Result<String, AppError> {
    state.crawler.start(root).await
}

pub fn stop_crawl(state: &AppState) -> bool {
    state.crawler.stop()
}

pub fn crawl_status(state: &AppState) -> CrawlStatus {
    state.crawler.status()
}

pub async fn get_session(state: &AppState, session_id: &str) -> Result<IndexingSession, AppError> {
    let id = session_id.to_string();
    state
        .catalog
        .call(move |conn| repository::get_session(conn, &id))
        .await?
        .ok_or_else(|| AppError::NotFound(format!("indexing session {session_id}")))
}

pub async fn latest_session(
    state: &AppState,
    root: Option<String>,
) -> Result<Option<IndexingSession>, AppError> {
    state
        .catalog
        .call(move |conn| repository::latest_session(conn, root.as_deref()))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::SessionStatus;
    use crate::state::tests::test_state;

    #[tokio::test]
    async fn crawl_round_trip_through_commands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let state = test_state();

        let session_id = start_crawl(&state, &root).await.unwrap();
        let summary = state.crawler.wait().await.unwrap().unwrap();
        assert_eq!(summary.session_id, session_id);
        assert!(!crawl_status(&state).running);

        let session = get_session(&state, &session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        let latest = latest_session(&state, Some(root)).await.unwrap().unwrap();
        assert_eq!(latest.id, session_id);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let state = test_state();
        let err = get_session(&state, "nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(!stop_crawl(&state));
    }
}
