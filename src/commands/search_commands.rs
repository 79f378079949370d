use crate::error::AppError;
use crate::models::search::SearchResult;
use crate::services::search_service;
use crate::state::AppState;

const DEFAULT_LIMIT: usize = 20;

pub async fn search(
    state: &AppState,
    query: &str,
    limit: Option<usize>,
) -> Result<Vec<SearchResult>, AppError> {
    search_service::search(
        state.search.as_ref(),
        &state.catalog,
        query,
        limit.unwrap_or(DEFAULT_LIMIT),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::tests::test_state;

    #[tokio::test]
    async fn search_finds_crawled_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hero_plate_v002.exr"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();
        let state = test_state();
        state
            .crawler
            .start(&dir.path().to_string_lossy())
            .await
            .unwrap();
        state.crawler.wait().await.unwrap().unwrap();

        let results = search(&state, "hero", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].file_name, "hero_plate_v002.exr");
        assert!(search(&state, "   ", None).await.unwrap().is_empty());
    }
}
