use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::Connection;

use crate::data::migrations;
use crate::error::AppError;

/// Shared handle to the catalog database.
///
/// Every query runs on the blocking pool so async callers never hold the
/// connection across an await point.
#[derive(Clone)]
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        migrations::run_migrations(&conn)?;
        tracing::info!(path = %path.display(), "catalog opened");
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_migrations(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub async fn call<F, T>(&self, f: F) -> Result<T, AppError>
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
        .map_err(|e| AppError::General(format!("catalog task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::repository;
    use crate::models::cache_job::{CacheJob, JobStatus};
    use crate::models::file_entry::CatalogEntry;
    use chrono::Utc;
    use std::collections::HashSet;

    #[tokio::test]
    async fn call_runs_queries_off_the_runtime() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .call(|conn| {
                let entry = CatalogEntry::sighted("/m/a".to_string(), false, 4, None, None);
                repository::upsert_entries(conn, &[entry], "s1")
            })
            .await
            .unwrap();

        let found = catalog
            .call(|conn| repository::get_by_path(conn, "/m/a"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().size_bytes, 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_item_claims_hand_out_each_item_once() {
        let catalog = Catalog::open_in_memory().unwrap();
        let paths: Vec<String> = (0..5).map(|i| format!("/m/f{i}")).collect();
        let job = CacheJob {
            id: "j1".to_string(),
            status: JobStatus::Pending,
            file_paths: paths.clone(),
            directory_paths: Vec::new(),
            total_files: paths.len() as u64,
            completed_files: 0,
            failed_files: 0,
            total_bytes: 0,
            worker_id: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            last_error: None,
            directories_marked: 0,
            directories_rejected: 0,
        };
        let items: Vec<(String, Option<i64>)> =
            paths.iter().map(|p| (p.clone(), Some(1))).collect();
        catalog
            .call(move |conn| {
                repository::insert_job(conn, &job, &items)?;
                repository::claim_next_job(conn, "w0", Utc::now())
            })
            .await
            .unwrap()
            .unwrap();

        // Twelve claim cycles of the holder race four rival workers for five items.
        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..16 {
            let catalog = catalog.clone();
            let worker = if n % 4 == 3 { format!("w{n}") } else { "w0".to_string() };
            tasks.spawn(async move {
                let claimed = catalog
                    .call(move |conn| {
                        repository::claim_pending_items(conn, "j1", &worker, 1, Utc::now())
                    })
                    .await
                    .unwrap();
                (n, claimed)
            });
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        while let Some(joined) = tasks.join_next().await {
            let (n, claimed) = joined.unwrap();
            if n % 4 == 3 {
                assert!(claimed.is_empty());
            }
            for item in claimed {
                assert_eq!(item.worker_id.as_deref(), Some("w0"));
                assert!(seen.insert(item.file_path), "item claimed twice");
                total += 1;
            }
        }
        assert_eq!(total, 5);
        assert_eq!(seen, paths.into_iter().collect::<HashSet<_>>());
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("catalog.db");
        Catalog::open(&path).unwrap();
        assert!(path.exists());
    }
}
