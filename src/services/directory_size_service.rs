use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;

use crate::config::CrawlerConfig;
use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::scope_path;

/// Directories awaiting aggregate recomputation, bucketed by depth.
#[derive(Debug, Default)]
pub struct DirectorySizeQueue {
    levels: BTreeMap<usize, BTreeSet<String>>,
}

impl DirectorySizeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: &str) {
        let path = scope_path::normalize(path);
        self.levels
            .entry(scope_path::depth(&path))
            .or_default()
            .insert(path);
    }

    /// Queues the parent chain of `path` up to and including `root`.
    pub fn push_ancestors(&mut self, path: &str, root: &str) {
        for ancestor in scope_path::ancestors_within(path, root) {
            self.push(&ancestor);
        }
    }

    pub fn len(&self) -> usize {
        self.levels.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.values().all(BTreeSet::is_empty)
    }

    /// Consumes the queue into depth levels, deepest first.
    pub fn into_levels(self) -> Vec<Vec<String>> {
        self.levels
            .into_iter()
            .rev()
            .map(|(_, dirs)| dirs.into_iter().collect())
            .collect()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SizeRecomputeStats {
    pub resized: usize,
    pub fresh: usize,
    pub missing: usize,
}

enum Outcome {
    Resized,
    Fresh,
    Missing,
}

/// Recomputes aggregate sizes level by level so children settle before parents.
/// Within a level directories run in chunks of `size_batch_concurrency`.
pub async fn recompute(
    catalog: &Catalog,
    queue: DirectorySizeQueue,
    config: &CrawlerConfig,
) -> Result<SizeRecomputeStats, AppError> {
    let mut stats = SizeRecomputeStats::default();
    let staleness = chrono::Duration::seconds(config.size_staleness_secs as i64);
    let chunk = config.size_batch_concurrency.max(1);
    let pause = Duration::from_millis(config.size_batch_pause_ms);

    for level in queue.into_levels() {
        for dirs in level.chunks(chunk) {
            let mut tasks = JoinSet::new();
            for dir in dirs {
                let catalog = catalog.clone();
                let dir = dir.clone();
                tasks.spawn(async move {
                    catalog
                        .call(move |conn| {
                            let now = Utc::now();
                            if let Some(at) = repository::size_calculated_at(conn, &dir)? {
                                if now - at < staleness {
                                    return Ok(Outcome::Fresh);
                                }
                            }
                            Ok(match repository::update_directory_size(conn, &dir, now)? {
                                Some(_) => Outcome::Resized,
                                None => Outcome::Missing,
                            })
                        })
                        .await
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let outcome = joined
                    .map_err(|e| AppError::General(format!("size task failed: {e}")))??;
                match outcome {
                    Outcome::Resized => stats.resized += 1,
                    Outcome::Fresh => stats.fresh += 1,
                    Outcome::Missing => stats.missing += 1,
                }
            }
            if !pause.is_zero() {
                tokio::time::sleep(pause).await;
            }
        }
    }

    tracing::debug!(
        resized = stats.resized,
        fresh = stats.fresh,
        missing = stats.missing,
        "directory sizes recomputed"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file_entry::CatalogEntry;

    fn entry(path: &str, is_directory: bool, size: i64) -> CatalogEntry {
        CatalogEntry::sighted(path.to_string(), is_directory, size, None, None)
    }

    fn quick_config(staleness_secs: u64) -> CrawlerConfig {
        CrawlerConfig {
            size_staleness_secs: staleness_secs,
            size_batch_pause_ms: 0,
            ..CrawlerConfig::default()
        }
    }

    #[test]
    fn test_queue_orders_deepest_first_and_dedupes() {
        let mut queue = DirectorySizeQueue::new();
        queue.push_ancestors("/m/a/b/file", "/m");
        queue.push_ancestors("/m/a/other", "/m");
        queue.push("/m/a/b/");

        assert_eq!(queue.len(), 3);
        let levels = queue.into_levels();
        assert_eq!(
            levels,
            vec![
                vec!["/m/a/b".to_string()],
                vec!["/m/a".to_string()],
                vec!["/m".to_string()],
            ]
        );
    }

    #[tokio::test]
    async fn test_recompute_rolls_sizes_up_the_tree() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .call(|conn| {
                repository::upsert_entries(
                    conn,
                    &[
                        entry("/m", true, 0),
                        entry("/m/a", true, 0),
                        entry("/m/a/b", true, 0),
                        entry("/m/a/b/x", false, 100),
                        entry("/m/a/y", false, 20),
                        entry("/m/z", false, 3),
                    ],
                    "s1",
                )
            })
            .await
            .unwrap();

        let mut queue = DirectorySizeQueue::new();
        queue.push_ancestors("/m/a/b/x", "/m");
        let stats = recompute(&catalog, queue, &quick_config(0)).await.unwrap();
        assert_eq!(stats.resized, 3);

        let root = catalog
            .call(|conn| repository::get_by_path(conn, "/m"))
            .await
            .unwrap()
            .unwrap();
        let size = root.computed_size.unwrap();
        assert_eq!(size.total_bytes, 123);
        assert_eq!(size.file_count, 3);
    }

    #[tokio::test]
    async fn test_recently_computed_directories_are_skipped() {
        let catalog = Catalog::open_in_memory().unwrap();
        catalog
            .call(|conn| {
                repository::upsert_entries(
                    conn,
                    &[entry("/m", true, 0), entry("/m/f", false, 1)],
                    "s1",
                )
            })
            .await
            .unwrap();

        let mut first = DirectorySizeQueue::new();
        first.push("/m");
        recompute(&catalog, first, &quick_config(300)).await.unwrap();

        let mut second = DirectorySizeQueue::new();
        second.push("/m");
        second.push("/m/gone");
        let stats = recompute(&catalog, second, &quick_config(300)).await.unwrap();
        assert_eq!(stats.fresh, 1);
        assert_eq!(stats.missing, 1);
        assert_eq!(stats.resized, 0);
    }
}
