use crate::error::AppError;
use crate::models::cache_job::{
    CacheJob, CacheJobCreated, CacheJobItem, CreateCacheJobRequest, JobPage, JobStatus,
};
use crate::state::AppState;

pub async fn create_cache_job(
    state: &AppState,
    request: CreateCacheJobRequest,
) -> Result<CacheJobCreated, AppError> {
    state.jobs.create_job(request).await
}

pub async fn get_cache_job(state: &AppState, job_id: &str) -> Result<CacheJob, AppError> {
    state.jobs.get_job(job_id).await
}

/// Lists jobs newest first. `status` filters by its lowercase name.
pub async fn list_cache_jobs(
    state: &AppState,
    status: Option<String>,
    page: Option<u32>,
    limit: Option<u32>,
) -> Result<JobPage, AppError> {
    let status = status
        .map(|s| s.parse::<JobStatus>())
        .transpose()
        .map_err(AppError::InvalidState)?;
    state
        .jobs
        .list_jobs(status, page.unwrap_or(1), limit.unwrap_or(0))
        .await
}

pub async fn list_cache_job_items(
    state: &AppState,
    job_id: &str,
) -> Result<Vec<CacheJobItem>, AppError> {
    state.jobs.list_items(job_id).await
}

pub async fn cancel_cache_job(state: &AppState, job_id: &str) -> Result<(), AppError> {
    state.jobs.cancel_job(job_id).await
}

pub async fn pause_cache_job(state: &AppState, job_id: &str) -> Result<(), AppError> {
    state.jobs.pause_job(job_id).await
}

pub async fn resume_cache_job(state: &AppState, job_id: &str) -> Result<(), AppError> {
    state.jobs.resume_job(job_id).await
}

/// Creates a fresh job over the paths a finished job never completed.
pub async fn requeue_cache_job(state: &AppState, job_id: &str) -> Result<CacheJobCreated, AppError> {
    state.jobs.requeue_job(job_id).await
}
