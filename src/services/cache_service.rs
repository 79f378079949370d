use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncReadExt;

use crate::data::{repository, Catalog};
use crate::error::AppError;
use crate::models::cache_job::{
    CacheJob, CacheJobCreated, CacheJobItem, CreateCacheJobRequest, JobPage, JobStatus,
};
use crate::scope_path;
use crate::services::indexing_service::SkipMatcher;

const DEFAULT_PAGE_LIMIT: u32 = 20;
const MAX_PAGE_LIMIT: u32 = 500;

/// Forces a file's full byte range through the network client so it lands in the local cache.
#[async_trait]
pub trait CacheWarmer: Send + Sync {
    async fn warm(&self, path: &Path) -> Result<u64, AppError>;
}

/// Reads the whole file in fixed-size chunks and discards the data.
pub struct FileReadWarmer {
    chunk_bytes: usize,
}

impl FileReadWarmer {
    pub fn new(chunk_bytes: usize) -> Self {
        Self {
            chunk_bytes: chunk_bytes.max(4096),
        }
    }
}

#[async_trait]
impl CacheWarmer for FileReadWarmer {
    async fn warm(&self, path: &Path) -> Result<u64, AppError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| AppError::Cache(format!("{}: {e}", path.display())))?;
        let mut buf = vec![0u8; self.chunk_bytes];
        let mut total = 0u64;
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| AppError::Cache(format!("{}: {e}", path.display())))?;
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        Ok(total)
    }
}

/// Files found under `dir` on disk with their current sizes.
pub fn walk_files(
    dir: &str,
    recursive: bool,
    skip: &SkipMatcher,
) -> Result<Vec<(String, i64)>, AppError> {
    let max_depth = if recursive { usize::MAX } else { 1 };
    let mut files = Vec::new();
    let walker = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !(e.file_type().is_dir()
                && skip.is_skipped(&e.file_name().to_string_lossy(), &e.path().to_string_lossy()))
        });
    for entry in walker {
        let entry = entry.map_err(|e| AppError::Io(std::io::Error::other(e.to_string())))?;
        if entry.file_type().is_file() {
            let len = entry
                .metadata()
                .map_err(|e| AppError::Io(std::io::Error::other(e.to_string())))?
                .len();
            files.push((entry.path().to_string_lossy().to_string(), len as i64));
        }
    }
    Ok(files)
}

/// Flattens a request into de-duplicated `(file, size)` targets plus the directories to mark.
fn expand_targets(
    request: &CreateCacheJobRequest,
    skip: &SkipMatcher,
) -> Result<(Vec<(String, Option<i64>)>, Vec<String>), AppError> {
    let mut seen = HashSet::new();
    let mut files = Vec::new();
    let mut directories = Vec::new();

    for raw in &request.files {
        scope_path::validate_path(raw)?;
        let path = scope_path::normalize(raw);
        let meta = std::fs::metadata(&path)
            .map_err(|e| AppError::NotFound(format!("{path}: {e}")))?;
        if meta.is_dir() {
            directories.push(path);
            continue;
        }
        if seen.insert(path.clone()) {
            files.push((path, Some(meta.len() as i64)));
        }
    }

    for raw in &request.directories {
        scope_path::validate_path(raw)?;
        let path = scope_path::normalize(raw);
        if !Path::new(&path).is_dir() {
            return Err(AppError::NotFound(format!("directory {path}")));
        }
        directories.push(path);
    }

    let mut marked = Vec::new();
    for dir in directories {
        for (file, size) in walk_files(&dir, request.recursive, skip)? {
            if seen.insert(file.clone()) {
                files.push((file, Some(size)));
            }
        }
        if !marked.contains(&dir) {
            marked.push(dir);
        }
    }
    Ok((files, marked))
}

/// Operator-facing job lifecycle. Workers own everything after creation.
#[derive(Clone)]
pub struct CacheJobService {
    catalog: Catalog,
    skip: SkipMatcher,
}

impl CacheJobService {
    pub fn new(catalog: Catalog, skip_patterns: &[String]) -> Self {
        Self {
            catalog,
            skip: SkipMatcher::new(skip_patterns),
        }
    }

    pub async fn create_job(
        &self,
        request: CreateCacheJobRequest,
    ) -> Result<CacheJobCreated, AppError> {
        if request.files.is_empty() && request.directories.is_empty() {
            return Err(AppError::InvalidState(
                "a cache job needs at least one file or directory".to_string(),
            ));
        }

        let skip = self.skip.clone();
        let (files, directories) =
            tokio::task::spawn_blocking(move || expand_targets(&request, &skip))
                .await
                .map_err(|e| AppError::General(format!("job expansion failed: {e}")))??;

        let now = Utc::now();
        let total_bytes: u64 = files.iter().filter_map(|(_, s)| *s).map(|s| s as u64).sum();
        let empty = files.is_empty();
        let job = CacheJob {
            id: uuid::Uuid::new_v4().to_string(),
            status: if empty {
                JobStatus::Completed
            } else {
                JobStatus::Pending
            },
            file_paths: files.iter().map(|(p, _)| p.clone()).collect(),
            directory_paths: directories,
            total_files: files.len() as u64,
            completed_files: 0,
            failed_files: 0,
            total_bytes,
            worker_id: None,
            created_at: now,
            started_at: None,
            completed_at: empty.then_some(now),
            last_error: None,
            directories_marked: 0,
            directories_rejected: 0,
        };

        let created = CacheJobCreated {
            job_id: job.id.clone(),
            total_files: job.total_files,
            total_bytes,
        };
        self.catalog
            .call(move |conn| repository::insert_job(conn, &job, &files))
            .await?;
        tracing::info!(
            job_id = %created.job_id,
            files = created.total_files,
            bytes = created.total_bytes,
            "cache job created"
        );
        Ok(created)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<CacheJob, AppError> {
        let id = job_id.to_string();
        self.catalog
            .call(move |conn| repository::get_job(conn, &id))
            .await?
            .ok_or_else(|| AppError::NotFound(format!("cache job {job_id}")))
    }

    pub async fn list_jobs(
        &self,
        status: Option<JobStatus>,
        page: u32,
        limit: u32,
    ) -> Result<JobPage, AppError> {
        let page = page.max(1);
        let limit = if limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            limit.min(MAX_PAGE_LIMIT)
        };
        let offset = (page - 1).saturating_mul(limit);
        let (jobs, total) = self
            .catalog
            .call(move |conn| {
                Ok((
                    repository::list_jobs(conn, status, limit, offset)?,
                    repository::count_jobs(conn, status)?,
                ))
            })
            .await?;
        Ok(JobPage {
            jobs,
            total,
            page,
            limit,
        })
    }

    pub async fn list_items(&self, job_id: &str) -> Result<Vec<CacheJobItem>, AppError> {
        let id = job_id.to_string();
        self.catalog
            .call(move |conn| repository::list_items(conn, &id))
            .await
    }

    pub async fn cancel_job(&self, job_id: &str) -> Result<(), AppError> {
        let id = job_id.to_string();
        let changed = self
            .catalog
            .call(move |conn| repository::cancel_job(conn, &id, Utc::now()))
            .await?;
        self.require_transition(job_id, changed, "cancel").await
    }

    pub async fn pause_job(&self, job_id: &str) -> Result<(), AppError> {
        let id = job_id.to_string();
        let changed = self
            .catalog
            .call(move |conn| repository::pause_job(conn, &id))
            .await?;
        self.require_transition(job_id, changed, "pause").await
    }

    pub async fn resume_job(&self, job_id: &str) -> Result<(), AppError> {
        let id = job_id.to_string();
        let changed = self
            .catalog
            .call(move |conn| repository::resume_job(conn, &id))
            .await?;
        self.require_transition(job_id, changed, "resume").await
    }

    /// Creates a fresh job over the paths a failed or cancelled job never finished.
    pub async fn requeue_job(&self, job_id: &str) -> Result<CacheJobCreated, AppError> {
        let job = self.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(AppError::InvalidState(format!(
                "only failed or cancelled jobs can be requeued (job {job_id} is {})",
                job.status
            )));
        }
        let id = job_id.to_string();
        let remaining = self
            .catalog
            .call(move |conn| repository::remaining_items(conn, &id))
            .await?;
        if remaining.is_empty() {
            return Err(AppError::InvalidState(format!(
                "job {job_id} has no unfinished files"
            )));
        }
        self.create_job(CreateCacheJobRequest {
            files: remaining.into_iter().map(|(path, _)| path).collect(),
            directories: Vec::new(),
            recursive: false,
        })
        .await
    }

    async fn require_transition(
        &self,
        job_id: &str,
        changed: bool,
        action: &str,
    ) -> Result<(), AppError> {
        if changed {
            tracing::info!(job_id, action, "cache job updated");
            return Ok(());
        }
        let job = self.get_job(job_id).await?;
        Err(AppError::InvalidState(format!(
            "cannot {action} job {job_id} in status {}",
            job.status
        )))
    }
}

/// Marks `dir` cached only if every file currently on disk beneath it is
/// cataloged as cached with its current size.
pub async fn mark_directory_cached_if_valid(
    catalog: &Catalog,
    dir: &str,
    job_id: &str,
    skip: &SkipMatcher,
) -> Result<bool, AppError> {
    let walk_dir = dir.to_string();
    let walk_skip = skip.clone();
    let files = match tokio::task::spawn_blocking(move || walk_files(&walk_dir, true, &walk_skip))
        .await
        .map_err(|e| AppError::General(format!("directory walk failed: {e}")))?
    {
        Ok(files) => files,
        Err(e) => {
            tracing::debug!(dir, error = %e, "directory unreadable during revalidation");
            return Ok(false);
        }
    };

    let dir = dir.to_string();
    let job_id = job_id.to_string();
    catalog
        .call(move |conn| {
            if !repository::files_all_cached(conn, &files)? {
                return Ok(false);
            }
            repository::set_directory_cached(conn, &dir, &job_id, Utc::now())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::file_entry::CacheStatusUpdate;
    use std::fs;

    fn service(catalog: &Catalog) -> CacheJobService {
        CacheJobService::new(catalog.clone(), &[".*".to_string(), "node_modules".to_string()])
    }

    #[tokio::test]
    async fn test_file_read_warmer_reads_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        fs::write(&path, vec![7u8; 10_000]).unwrap();

        let warmer = FileReadWarmer::new(4096);
        assert_eq!(warmer.warm(&path).await.unwrap(), 10_000);
        assert!(warmer.warm(&dir.path().join("missing")).await.is_err());
    }

    #[tokio::test]
    async fn test_create_job_expands_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested/deeper")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("a.txt"), "aa").unwrap();
        fs::write(dir.path().join("nested/b.txt"), "bbb").unwrap();
        fs::write(dir.path().join("nested/deeper/c.txt"), "c").unwrap();
        fs::write(dir.path().join("node_modules/skip.js"), "zzzz").unwrap();

        let catalog = Catalog::open_in_memory().unwrap();
        let jobs = service(&catalog);
        let root = dir.path().to_string_lossy().to_string();

        let created = jobs
            .create_job(CreateCacheJobRequest {
                files: vec![format!("{root}/a.txt")],
                directories: vec![root.clone()],
                recursive: true,
            })
            .await
            .unwrap();
        assert_eq!(created.total_files, 3);
        assert_eq!(created.total_bytes, 6);

        let job = jobs.get_job(&created.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.directory_paths, vec![root.clone()]);
        assert_eq!(jobs.list_items(&created.job_id).await.unwrap().len(), 3);

        let shallow = jobs
            .create_job(CreateCacheJobRequest {
                files: Vec::new(),
                directories: vec![format!("{root}/nested")],
                recursive: false,
            })
            .await
            .unwrap();
        assert_eq!(shallow.total_files, 1);
    }

    #[tokio::test]
    async fn test_create_job_validation() {
        let catalog = Catalog::open_in_memory().unwrap();
        let jobs = service(&catalog);

        let empty = jobs.create_job(CreateCacheJobRequest::default()).await;
        assert!(matches!(empty, Err(AppError::InvalidState(_))));

        let traversal = jobs
            .create_job(CreateCacheJobRequest {
                files: vec!["/mnt/../etc/passwd".to_string()],
                ..CreateCacheJobRequest::default()
            })
            .await;
        assert!(traversal.is_err());
    }

    #[tokio::test]
    async fn test_empty_directory_job_completes_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let jobs = service(&catalog);

        let created = jobs
            .create_job(CreateCacheJobRequest {
                directories: vec![dir.path().to_string_lossy().to_string()],
                ..CreateCacheJobRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(created.total_files, 0);
        let job = jobs.get_job(&created.job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_job_controls_and_listing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), "a").unwrap();
        let catalog = Catalog::open_in_memory().unwrap();
        let jobs = service(&catalog);
        let file = dir.path().join("a").to_string_lossy().to_string();

        let first = jobs
            .create_job(CreateCacheJobRequest {
                files: vec![file.clone()],
                ..CreateCacheJobRequest::default()
            })
            .await
            .unwrap();
        jobs.create_job(CreateCacheJobRequest {
            files: vec![file],
            ..CreateCacheJobRequest::default()
        })
        .await
        .unwrap();

        jobs.pause_job(&first.job_id).await.unwrap();
        assert!(jobs.pause_job(&first.job_id).await.is_err());
        jobs.resume_job(&first.job_id).await.unwrap();
        jobs.cancel_job(&first.job_id).await.unwrap();
        assert!(jobs.resume_job(&first.job_id).await.is_err());

        let page = jobs.list_jobs(None, 1, 1).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.jobs.len(), 1);
        let cancelled = jobs
            .list_jobs(Some(JobStatus::Cancelled), 1, 10)
            .await
            .unwrap();
        assert_eq!(cancelled.total, 1);

        let requeued = jobs.requeue_job(&first.job_id).await.unwrap();
        assert_eq!(requeued.total_files, 1);
        assert_ne!(requeued.job_id, first.job_id);
    }

    #[tokio::test]
    async fn test_directory_mark_is_revalidated_against_disk() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("a"), "aaa").unwrap();
        fs::write(dir.path().join("sub/b"), "bb").unwrap();
        let root = dir.path().to_string_lossy().to_string();

        let catalog = Catalog::open_in_memory().unwrap();
        let updates: Vec<CacheStatusUpdate> = ["a", "sub/b"]
            .iter()
            .map(|name| CacheStatusUpdate {
                path: format!("{root}/{name}"),
                cached: true,
                job_id: "j1".to_string(),
            })
            .collect();
        let mount = root.clone();
        catalog
            .call(move |conn| {
                repository::update_cache_status_batch(conn, &updates, Some(&mount), Utc::now())
            })
            .await
            .unwrap();

        let skip = SkipMatcher::new(&[]);
        assert!(mark_directory_cached_if_valid(&catalog, &root, "j1", &skip)
            .await
            .unwrap());

        fs::write(dir.path().join("a"), "grown since caching").unwrap();
        assert!(!mark_directory_cached_if_valid(&catalog, &root, "j1", &skip)
            .await
            .unwrap());

        fs::write(dir.path().join("a"), "aaa").unwrap();
        fs::write(dir.path().join("sub/new"), "n").unwrap();
        assert!(!mark_directory_cached_if_valid(&catalog, &root, "j1", &skip)
            .await
            .unwrap());
    }
}
