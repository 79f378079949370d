use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::models::file_entry::CatalogEntry;
use crate::models::search::{BulkDeleteResult, BulkIndexResult, SearchResult};

/// Best-effort secondary index over catalog entries.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn bulk_index(&self, entries: &[CatalogEntry]) -> Result<BulkIndexResult, AppError>;
    async fn bulk_delete_by_paths(&self, paths: &[String]) -> Result<BulkDeleteResult, AppError>;
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, AppError>;
}

const FTS_SCHEMA: &str = "
CREATE VIRTUAL TABLE IF NOT EXISTS files_fts USING fts5(
    path,
    name,
    parent_path,
    is_directory UNINDEXED,
    tokenize = 'unicode61'
);
";

/// FTS5 index kept in its own connection so a slow index never holds the catalog lock.
#[derive(Clone)]
pub struct SqliteSearchIndex {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteSearchIndex {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        conn.execute_batch(FTS_SCHEMA)
            .map_err(|e| AppError::SearchIndex(format!("creating fts table: {e}")))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<F, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut Connection) -> Result<T, AppError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| AppError::SearchIndex(format!("index task failed: {e}")))?
    }
}

/// Turns free text into an FTS5 expression. Input that already uses FTS5
/// syntax (quotes or boolean operators) passes through untouched.
fn to_match_expression(query: &str) -> String {
    let trimmed = query.trim();
    let has_syntax = trimmed.contains('"')
        || trimmed
            .split_whitespace()
            .any(|word| matches!(word, "AND" | "OR" | "NOT"));
    if has_syntax {
        return trimmed.to_string();
    }
    trimmed
        .split_whitespace()
        .map(|token| format!("\"{}\"*", token.replace('"', "")))
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl SearchIndex for SqliteSearchIndex {
    async fn bulk_index(&self, entries: &[CatalogEntry]) -> Result<BulkIndexResult, AppError> {
        let rows: Vec<(String, String, Option<String>, bool)> = entries
            .iter()
            .map(|e| (e.path.clone(), e.name.clone(), e.parent_path.clone(), e.is_directory))
            .collect();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut result = BulkIndexResult::default();
            {
                let mut delete = tx.prepare_cached("DELETE FROM files_fts WHERE path = ?1")?;
                let mut insert = tx.prepare_cached(
                    "INSERT INTO files_fts (path, name, parent_path, is_directory) VALUES (?1, ?2, ?3, ?4)",
                )?;
                for (path, name, parent, is_dir) in &rows {
                    let outcome = delete
                        .execute(params![path])
                        .and_then(|_| insert.execute(params![path, name, parent, is_dir]));
                    match outcome {
                        Ok(_) => result.indexed += 1,
                        Err(e) => result.errors.push(format!("{path}: {e}")),
                    }
                }
            }
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn bulk_delete_by_paths(&self, paths: &[String]) -> Result<BulkDeleteResult, AppError> {
        let paths = paths.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut result = BulkDeleteResult::default();
            {
                let mut stmt = tx.prepare_cached("DELETE FROM files_fts WHERE path = ?1")?;
                for path in &paths {
                    match stmt.execute(params![path]) {
                        Ok(n) => result.deleted += n,
                        Err(e) => result.errors.push(format!("{path}: {e}")),
                    }
                }
            }
            tx.commit()?;
            Ok(result)
        })
        .await
    }

    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, AppError> {
        let expression = to_match_expression(query);
        if expression.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT path, name, is_directory, rank FROM files_fts
                 WHERE files_fts MATCH ?1 ORDER BY rank LIMIT ?2",
            )?;
            let results = stmt
                .query_map(params![expression, limit as i64], |row| {
                    let rank: f64 = row.get(3)?;
                    Ok(SearchResult {
                        file_path: row.get(0)?,
                        file_name: row.get(1)?,
                        is_directory: row.get(2)?,
                        score: -rank,
                        match_source: "fts".to_string(),
                    })
                })
                .map_err(|e| AppError::SearchIndex(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::SearchIndex(e.to_string()))?;
            Ok(results)
        })
        .await
    }
}

/// Wraps an index with retries and a per-run kill switch.
///
/// A batch gets `attempts` tries with exponential backoff from `base_delay`.
/// Once a batch exhausts its retries the writer disables itself and every
/// later call is a no-op.
pub struct ResilientIndexWriter {
    index: Arc<dyn SearchIndex>,
    attempts: u32,
    base_delay: Duration,
    disabled: AtomicBool,
    failures: AtomicU64,
}

impl ResilientIndexWriter {
    pub fn new(index: Arc<dyn SearchIndex>, attempts: u32, base_delay: Duration) -> Self {
        Self {
            index,
            attempts: attempts.max(1),
            base_delay,
            disabled: AtomicBool::new(false),
            failures: AtomicU64::new(0),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub async fn index_batch(&self, entries: &[CatalogEntry]) -> Option<BulkIndexResult> {
        if entries.is_empty() || self.is_disabled() {
            return None;
        }
        for attempt in 0..self.attempts {
            match self.index.bulk_index(entries).await {
                Ok(result) => {
                    if !result.errors.is_empty() {
                        self.failures
                            .fetch_add(result.errors.len() as u64, Ordering::Relaxed);
                        tracing::debug!(errors = result.errors.len(), "search index rejected entries");
                    }
                    return Some(result);
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "search index batch failed");
                    if attempt + 1 < self.attempts {
                        tokio::time::sleep(self.base_delay * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        self.give_up();
        None
    }

    pub async fn delete_paths(&self, paths: &[String]) -> Option<BulkDeleteResult> {
        if paths.is_empty() || self.is_disabled() {
            return None;
        }
        for attempt in 0..self.attempts {
            match self.index.bulk_delete_by_paths(paths).await {
                Ok(result) => {
                    if !result.errors.is_empty() {
                        self.failures
                            .fetch_add(result.errors.len() as u64, Ordering::Relaxed);
                    }
                    return Some(result);
                }
                Err(e) => {
                    tracing::warn!(attempt = attempt + 1, error = %e, "search index delete failed");
                    if attempt + 1 < self.attempts {
                        tokio::time::sleep(self.base_delay * 2u32.pow(attempt)).await;
                    }
                }
            }
        }
        self.give_up();
        None
    }

    fn give_up(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        if !self.disabled.swap(true, Ordering::Relaxed) {
            tracing::warn!("search index disabled for the rest of this crawl");
        }
    }
}

/// Index-first search that falls back to catalog name/path matching.
pub async fn search(
    index: Option<&Arc<dyn SearchIndex>>,
    catalog: &Catalog,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchResult>, AppError> {
    let trimmed = query.trim().to_string();
    if trimmed.is_empty() || limit == 0 {
        return Ok(Vec::new());
    }

    if let Some(index) = index {
        match index.search(&trimmed, limit).await {
            Ok(results) => return Ok(results),
            Err(e) => tracing::warn!(error = %e, "search index query failed, using catalog"),
        }
    }

    let entries = catalog
        .call(move |conn| repository::search_by_name_or_path(conn, &trimmed, limit))
        .await?;
    Ok(entries
        .into_iter()
        .enumerate()
        .map(|(rank, entry)| SearchResult {
            file_path: entry.path,
            file_name: entry.name,
            is_directory: entry.is_directory,
            score: 1.0 / (rank as f64 + 1.0),
            match_source: "catalog".to_string(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn entry(path: &str, is_directory: bool) -> CatalogEntry {
        CatalogEntry::sighted(path.to_string(), is_directory, 1, None, None)
    }

    struct FlakyIndex {
        fail_first: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SearchIndex for FlakyIndex {
        async fn bulk_index(&self, entries: &[CatalogEntry]) -> Result<BulkIndexResult, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(AppError::SearchIndex("unreachable".to_string()));
            }
            Ok(BulkIndexResult {
                indexed: entries.len(),
                errors: Vec::new(),
            })
        }

        async fn bulk_delete_by_paths(&self, _: &[String]) -> Result<BulkDeleteResult, AppError> {
            Err(AppError::SearchIndex("unreachable".to_string()))
        }

        async fn search(&self, _: &str, _: usize) -> Result<Vec<SearchResult>, AppError> {
            Err(AppError::SearchIndex("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_fts_index_search_and_delete() {
        let index = SqliteSearchIndex::open_in_memory().unwrap();
        let result = index
            .bulk_index(&[
                entry("/docs/invoices", true),
                entry("/docs/invoices/march.pdf", false),
                entry("/docs/notes.txt", false),
            ])
            .await
            .unwrap();
        assert_eq!(result.indexed, 3);

        let hits = index.search("invoices", 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|h| h.match_source == "fts"));

        let deleted = index
            .bulk_delete_by_paths(&["/docs/invoices/march.pdf".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted.deleted, 1);
        assert_eq!(index.search("march", 10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_reindexing_replaces_rows() {
        let index = SqliteSearchIndex::open_in_memory().unwrap();
        index.bulk_index(&[entry("/a/report.txt", false)]).await.unwrap();
        index.bulk_index(&[entry("/a/report.txt", false)]).await.unwrap();
        assert_eq!(index.search("report", 10).await.unwrap().len(), 1);
    }

    #[test]
    fn test_match_expression_quotes_plain_terms() {
        assert_eq!(to_match_expression("foo bar"), "\"foo\"* \"bar\"*");
        assert_eq!(to_match_expression("foo OR bar"), "foo OR bar");
        assert_eq!(to_match_expression("   "), "");
    }

    #[tokio::test]
    async fn test_writer_retries_then_succeeds() {
        let index = Arc::new(FlakyIndex {
            fail_first: 2,
            calls: AtomicU32::new(0),
        });
        let writer = ResilientIndexWriter::new(index.clone(), 3, Duration::from_millis(1));
        let result = writer.index_batch(&[entry("/a", false)]).await;
        assert_eq!(result.unwrap().indexed, 1);
        assert_eq!(index.calls.load(Ordering::SeqCst), 3);
        assert!(!writer.is_disabled());
    }

    #[tokio::test]
    async fn test_writer_disables_after_exhausting_retries() {
        let index = Arc::new(FlakyIndex {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let writer = ResilientIndexWriter::new(index.clone(), 3, Duration::from_millis(1));
        assert!(writer.index_batch(&[entry("/a", false)]).await.is_none());
        assert!(writer.is_disabled());
        assert_eq!(writer.failures(), 1);

        // disabled writers stop calling the index
        assert!(writer.index_batch(&[entry("/b", false)]).await.is_none());
        assert_eq!(index.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_search_falls_back_to_catalog() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .call(|conn| {
                repository::upsert_entries(
                    conn,
                    &[entry("/docs/invoices.txt", false), entry("/docs/readme.md", false)],
                    "s1",
                )
            })
            .await
            .unwrap();

        let broken: Arc<dyn SearchIndex> = Arc::new(FlakyIndex {
            fail_first: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let results = search(Some(&broken), &catalog, "invoices", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].match_source, "catalog");

        let none = search(None, &catalog, "readme", 10).await.unwrap();
        assert_eq!(none[0].file_path, "/docs/readme.md");
        assert!(search(None, &catalog, "  ", 10).await.unwrap().is_empty());
    }
}
