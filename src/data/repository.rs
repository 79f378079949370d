use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use crate::error::AppError;
use crate::models::cache_job::{CacheJob, CacheJobItem, ItemStatus, JobProgress, JobStatus};
use crate::models::file_entry::{
    CacheStatusUpdate, CatalogEntry, ComputedSize, DeletedEntry, UploadState, UploadStatus,
};
use crate::models::session::{IndexingSession, SessionCounts, SessionStatus};
use crate::scope_path;

// SQLite caps bound parameters at 999 on older builds.
const CHUNK_SIZE: usize = 900;

const ENTRY_COLUMNS: &str = "path, name, parent_path, is_directory, size_bytes, modified_at, permissions, cached, last_seen_session_id, upload_status, upload_checked_at, computed_size_bytes, computed_file_count, size_calculated_at";

const JOB_COLUMNS: &str = "id, status, file_paths, directory_paths, total_files, completed_files, failed_files, total_bytes, worker_id, created_at, started_at, completed_at, last_error, directories_marked, directories_rejected";

const ITEM_COLUMNS: &str = "job_id, file_path, status, worker_id, error_message, size_bytes";

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<CatalogEntry> {
    let upload_state: Option<String> = row.get(9)?;
    let upload_checked_at: Option<DateTime<Utc>> = row.get(10)?;
    let computed_bytes: Option<i64> = row.get(11)?;
    let computed_count: Option<i64> = row.get(12)?;
    let calculated_at: Option<DateTime<Utc>> = row.get(13)?;

    let upload_status = match (upload_state, upload_checked_at) {
        (Some(state), Some(checked)) => state.parse::<UploadState>().ok().map(|state| UploadStatus {
            state,
            last_checked_at: checked,
        }),
        _ => None,
    };
    let computed_size = match (computed_bytes, computed_count, calculated_at) {
        (Some(total_bytes), Some(file_count), Some(calculated_at)) => Some(ComputedSize {
            total_bytes,
            file_count,
            calculated_at,
        }),
        _ => None,
    };

    Ok(CatalogEntry {
        path: row.get(0)?,
        name: row.get(1)?,
        parent_path: row.get(2)?,
        is_directory: row.get(3)?,
        size_bytes: row.get(4)?,
        modified_at: row.get(5)?,
        permissions: row.get(6)?,
        cached: row.get(7)?,
        last_seen_session_id: row.get(8)?,
        upload_status,
        computed_size,
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<CacheJob> {
    let status: String = row.get(1)?;
    let file_paths: String = row.get(2)?;
    let directory_paths: String = row.get(3)?;
    Ok(CacheJob {
        id: row.get(0)?,
        status: status.parse::<JobStatus>().unwrap_or(JobStatus::Failed),
        file_paths: serde_json::from_str(&file_paths).unwrap_or_default(),
        directory_paths: serde_json::from_str(&directory_paths).unwrap_or_default(),
        total_files: row.get(4)?,
        completed_files: row.get(5)?,
        failed_files: row.get(6)?,
        total_bytes: row.get(7)?,
        worker_id: row.get(8)?,
        created_at: row.get(9)?,
        started_at: row.get(10)?,
        completed_at: row.get(11)?,
        last_error: row.get(12)?,
        directories_marked: row.get(13)?,
        directories_rejected: row.get(14)?,
    })
}

fn item_from_row(row: &Row<'_>) -> rusqlite::Result<CacheJobItem> {
    let status: String = row.get(2)?;
    Ok(CacheJobItem {
        job_id: row.get(0)?,
        file_path: row.get(1)?,
        status: status.parse::<ItemStatus>().unwrap_or(ItemStatus::Failed),
        worker_id: row.get(3)?,
        error_message: row.get(4)?,
        size_bytes: row.get(5)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<IndexingSession> {
    let status: String = row.get(2)?;
    Ok(IndexingSession {
        id: row.get(0)?,
        root_path: row.get(1)?,
        status: status.parse::<SessionStatus>().unwrap_or(SessionStatus::Failed),
        created_at: row.get(3)?,
        completed_at: row.get(4)?,
        counts: SessionCounts {
            files_processed: row.get(5)?,
            files_indexed: row.get(6)?,
            files_skipped: row.get(7)?,
            errors: row.get(8)?,
            files_deleted: row.get(9)?,
        },
        last_error: row.get(10)?,
    })
}

/// Prefix every descendant of `root` starts with.
fn scope_prefix(root: &str) -> (String, String) {
    let root = scope_path::normalize(root);
    let prefix = if root == "/" {
        "/".to_string()
    } else {
        format!("{root}/")
    };
    (root, prefix)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

// ---------------------------------------------------------------------------
// Catalog entries
// ---------------------------------------------------------------------------

/// Upserts `entries` tagged with `session_id`. A changed size or mtime drops the cached flag.
pub fn upsert_entries(
    conn: &mut Connection,
    entries: &[CatalogEntry],
    session_id: &str,
) -> Result<usize, AppError> {
    let tx = conn.transaction()?;
    let mut written = 0usize;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT INTO files (path, name, parent_path, is_directory, size_bytes, modified_at, permissions, last_seen_session_id, indexed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, CURRENT_TIMESTAMP)
             ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                parent_path = excluded.parent_path,
                is_directory = excluded.is_directory,
                cached = CASE
                    WHEN files.size_bytes != excluded.size_bytes
                      OR files.modified_at IS NOT excluded.modified_at THEN 0
                    ELSE files.cached
                END,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                permissions = excluded.permissions,
                last_seen_session_id = excluded.last_seen_session_id,
                indexed_at = CURRENT_TIMESTAMP",
        )?;
        for entry in entries {
            written += stmt.execute(params![
                entry.path,
                entry.name,
                entry.parent_path,
                entry.is_directory,
                entry.size_bytes,
                entry.modified_at,
                entry.permissions,
                session_id,
            ])?;
        }
    }
    tx.commit()?;
    Ok(written)
}

/// Splits a batch into entries that must be written (new, or changed size/mtime/kind)
/// and the paths of entries the catalog already holds unchanged.
pub fn filter_needs_indexing(
    conn: &Connection,
    entries: Vec<CatalogEntry>,
) -> Result<(Vec<CatalogEntry>, Vec<String>), AppError> {
    let mut known: HashMap<String, (i64, Option<i64>, bool)> = HashMap::new();
    for chunk in entries.chunks(CHUNK_SIZE) {
        let sql = format!(
            "SELECT path, size_bytes, modified_at, is_directory FROM files WHERE path IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter().map(|e| &e.path)), |row| {
            let modified: Option<DateTime<Utc>> = row.get(2)?;
            Ok((
                row.get::<_, String>(0)?,
                (
                    row.get::<_, i64>(1)?,
                    modified.map(|t| t.timestamp_millis()),
                    row.get::<_, bool>(3)?,
                ),
            ))
        })?;
        for row in rows {
            let (path, meta) = row?;
            known.insert(path, meta);
        }
    }

    let mut changed = Vec::new();
    let mut unchanged = Vec::new();
    for entry in entries {
        match known.get(&entry.path) {
            Some((size, modified, is_dir))
                if *is_dir == entry.is_directory
                    && *size == entry.size_bytes
                    && *modified == entry.modified_millis() =>
            {
                unchanged.push(entry.path)
            }
            _ => changed.push(entry),
        }
    }
    Ok((changed, unchanged))
}

/// Re-tags unchanged entries with the current session without rewriting them.
pub fn touch_session(
    conn: &mut Connection,
    paths: &[String],
    session_id: &str,
) -> Result<usize, AppError> {
    let tx = conn.transaction()?;
    let mut touched = 0usize;
    {
        let mut stmt =
            tx.prepare_cached("UPDATE files SET last_seen_session_id = ?1 WHERE path = ?2")?;
        for path in paths {
            touched += stmt.execute(params![session_id, path])?;
        }
    }
    tx.commit()?;
    Ok(touched)
}

pub fn get_by_path(conn: &Connection, path: &str) -> Result<Option<CatalogEntry>, AppError> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM files WHERE path = ?1");
    let entry = conn
        .query_row(&sql, params![path], entry_from_row)
        .optional()?;
    Ok(entry)
}

pub fn search_by_name_or_path(
    conn: &Connection,
    query: &str,
    limit: usize,
) -> Result<Vec<CatalogEntry>, AppError> {
    let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM files
         WHERE name LIKE ?1 ESCAPE '\\' OR path LIKE ?1 ESCAPE '\\'
         ORDER BY (name LIKE ?1 ESCAPE '\\') DESC, length(path) ASC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map(params![pattern, limit as i64], entry_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Creates `path` and its missing ancestors root-down so every cataloged parent is a directory.
/// The chain stops at `mount_root` when `path` lies inside it.
pub fn ensure_entry_with_parents(
    conn: &Connection,
    path: &str,
    mount_root: Option<&str>,
) -> Result<usize, AppError> {
    let path = scope_path::normalize(path);
    let mut chain = match mount_root {
        Some(root) if scope_path::is_within_scope(&path, root) => {
            scope_path::ancestors_within(&path, root)
        }
        _ => {
            let mut all = Vec::new();
            let mut current = scope_path::parent_of(&path);
            while let Some(parent) = current {
                if parent == "/" {
                    break;
                }
                current = scope_path::parent_of(&parent);
                all.push(parent);
            }
            all
        }
    };
    chain.reverse();

    let mut created = 0usize;
    let mut dir_stmt = conn.prepare_cached(
        "INSERT INTO files (path, name, parent_path, is_directory, size_bytes, modified_at, permissions)
         VALUES (?1, ?2, ?3, 1, 0, ?4, ?5)
         ON CONFLICT(path) DO UPDATE SET is_directory = 1 WHERE files.is_directory = 0",
    )?;
    for dir in &chain {
        let metadata = std::fs::metadata(dir).ok();
        let entry = match metadata.as_ref() {
            Some(meta) => CatalogEntry::from_metadata(dir.clone(), meta),
            None => CatalogEntry::sighted(dir.clone(), true, 0, None, None),
        };
        created += dir_stmt.execute(params![
            entry.path,
            entry.name,
            entry.parent_path,
            entry.modified_at,
            entry.permissions,
        ])?;
    }

    let entry = match std::fs::metadata(&path) {
        Ok(meta) => CatalogEntry::from_metadata(path.clone(), &meta),
        Err(_) => CatalogEntry::sighted(path.clone(), false, 0, None, None),
    };
    created += conn.execute(
        "INSERT OR IGNORE INTO files (path, name, parent_path, is_directory, size_bytes, modified_at, permissions)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.path,
            entry.name,
            entry.parent_path,
            entry.is_directory,
            entry.size_bytes,
            entry.modified_at,
            entry.permissions,
        ],
    )?;
    Ok(created)
}

/// Upserts the crawl root itself, tagged with the session.
pub fn ensure_root_entry(
    conn: &Connection,
    entry: &CatalogEntry,
    session_id: &str,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO files (path, name, parent_path, is_directory, size_bytes, modified_at, permissions, last_seen_session_id)
         VALUES (?1, ?2, ?3, 1, 0, ?4, ?5, ?6)
         ON CONFLICT(path) DO UPDATE SET
            is_directory = 1,
            modified_at = excluded.modified_at,
            last_seen_session_id = excluded.last_seen_session_id",
        params![
            entry.path,
            entry.name,
            entry.parent_path,
            entry.modified_at,
            entry.permissions,
            session_id,
        ],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Deletion reconciliation
// ---------------------------------------------------------------------------

pub fn count_in_scope(conn: &Connection, root: &str) -> Result<u64, AppError> {
    let (root, prefix) = scope_prefix(root);
    let count = conn.query_row(
        "SELECT COUNT(*) FROM files WHERE path = ?1 OR substr(path, 1, length(?2)) = ?2",
        params![root, prefix],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub fn count_stale_in_scope(
    conn: &Connection,
    root: &str,
    session_id: &str,
) -> Result<u64, AppError> {
    let (root, prefix) = scope_prefix(root);
    let count = conn.query_row(
        "SELECT COUNT(*) FROM files
         WHERE (path = ?1 OR substr(path, 1, length(?2)) = ?2)
           AND last_seen_session_id IS NOT ?3",
        params![root, prefix, session_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Deletes every entry under `root` not seen by `session_id`, returning what was removed.
pub fn delete_where_session_not(
    conn: &mut Connection,
    root: &str,
    session_id: &str,
) -> Result<Vec<DeletedEntry>, AppError> {
    let (root, prefix) = scope_prefix(root);
    let tx = conn.transaction()?;
    let deleted = {
        let mut stmt = tx.prepare(
            "SELECT path, parent_path, is_directory FROM files
             WHERE (path = ?1 OR substr(path, 1, length(?2)) = ?2)
               AND last_seen_session_id IS NOT ?3",
        )?;
        let rows = stmt
            .query_map(params![root, prefix, session_id], |row| {
                Ok(DeletedEntry {
                    path: row.get(0)?,
                    parent_path: row.get(1)?,
                    is_directory: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    tx.execute(
        "DELETE FROM files
         WHERE (path = ?1 OR substr(path, 1, length(?2)) = ?2)
           AND last_seen_session_id IS NOT ?3",
        params![root, prefix, session_id],
    )?;
    tx.commit()?;
    Ok(deleted)
}

pub fn reset_session_tags(conn: &Connection, session_id: &str) -> Result<usize, AppError> {
    let count = conn.execute(
        "UPDATE files SET last_seen_session_id = NULL WHERE last_seen_session_id = ?1",
        params![session_id],
    )?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Indexing sessions
// ---------------------------------------------------------------------------

pub fn create_session(
    conn: &Connection,
    id: &str,
    root_path: &str,
    created_at: DateTime<Utc>,
) -> Result<IndexingSession, AppError> {
    conn.execute(
        "INSERT INTO indexing_sessions (id, root_path, status, created_at) VALUES (?1, ?2, 'running', ?3)",
        params![id, root_path, created_at],
    )?;
    Ok(IndexingSession {
        id: id.to_string(),
        root_path: root_path.to_string(),
        status: SessionStatus::Running,
        created_at,
        completed_at: None,
        counts: SessionCounts::default(),
        last_error: None,
    })
}

pub fn finish_session(
    conn: &Connection,
    id: &str,
    status: SessionStatus,
    counts: &SessionCounts,
    last_error: Option<&str>,
    completed_at: DateTime<Utc>,
) -> Result<(), AppError> {
    conn.execute(
        "UPDATE indexing_sessions SET
            status = ?2, completed_at = ?3, files_processed = ?4, files_indexed = ?5,
            files_skipped = ?6, errors = ?7, files_deleted = ?8, last_error = ?9
         WHERE id = ?1",
        params![
            id,
            status.to_string(),
            completed_at,
            counts.files_processed,
            counts.files_indexed,
            counts.files_skipped,
            counts.errors,
            counts.files_deleted,
            last_error,
        ],
    )?;
    Ok(())
}

const SESSION_COLUMNS: &str = "id, root_path, status, created_at, completed_at, files_processed, files_indexed, files_skipped, errors, files_deleted, last_error";

pub fn get_session(conn: &Connection, id: &str) -> Result<Option<IndexingSession>, AppError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM indexing_sessions WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], session_from_row).optional()?)
}

pub fn latest_session(
    conn: &Connection,
    root_path: Option<&str>,
) -> Result<Option<IndexingSession>, AppError> {
    let sql = format!(
        "SELECT {SESSION_COLUMNS} FROM indexing_sessions
         WHERE ?1 IS NULL OR root_path = ?1
         ORDER BY created_at DESC LIMIT 1"
    );
    Ok(conn
        .query_row(&sql, params![root_path], session_from_row)
        .optional()?)
}

// ---------------------------------------------------------------------------
// Directory sizes
// ---------------------------------------------------------------------------

pub fn size_calculated_at(
    conn: &Connection,
    path: &str,
) -> Result<Option<DateTime<Utc>>, AppError> {
    let value: Option<Option<DateTime<Utc>>> = conn
        .query_row(
            "SELECT size_calculated_at FROM files WHERE path = ?1 AND is_directory = 1",
            params![path],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.flatten())
}

/// Aggregates direct files plus the stored aggregates of direct subdirectories.
/// Returns `None` when the directory is not cataloged.
pub fn update_directory_size(
    conn: &Connection,
    path: &str,
    now: DateTime<Utc>,
) -> Result<Option<ComputedSize>, AppError> {
    let (file_bytes, file_count): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(size_bytes), 0), COUNT(*) FROM files
         WHERE parent_path = ?1 AND is_directory = 0",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let (dir_bytes, dir_count): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(computed_size_bytes), 0), COALESCE(SUM(computed_file_count), 0)
         FROM files WHERE parent_path = ?1 AND is_directory = 1",
        params![path],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    let computed = ComputedSize {
        total_bytes: file_bytes + dir_bytes,
        file_count: file_count + dir_count,
        calculated_at: now,
    };
    let updated = conn.execute(
        "UPDATE files SET computed_size_bytes = ?2, computed_file_count = ?3, size_calculated_at = ?4
         WHERE path = ?1 AND is_directory = 1",
        params![
            path,
            computed.total_bytes,
            computed.file_count,
            computed.calculated_at
        ],
    )?;
    Ok((updated == 1).then_some(computed))
}

// ---------------------------------------------------------------------------
// Cache jobs
// ---------------------------------------------------------------------------

pub fn insert_job(
    conn: &mut Connection,
    job: &CacheJob,
    items: &[(String, Option<i64>)],
) -> Result<(), AppError> {
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO cache_jobs (id, status, file_paths, directory_paths, total_files, completed_files,
                                 failed_files, total_bytes, worker_id, created_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, NULL, ?7, ?8)",
        params![
            job.id,
            job.status.to_string(),
            serde_json::to_string(&job.file_paths)?,
            serde_json::to_string(&job.directory_paths)?,
            job.total_files,
            job.total_bytes,
            job.created_at,
            job.completed_at,
        ],
    )?;
    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO cache_job_items (job_id, file_path, status, size_bytes)
             VALUES (?1, ?2, 'pending', ?3)",
        )?;
        for (path, size) in items {
            stmt.execute(params![job.id, path, size])?;
        }
    }
    tx.commit()?;
    Ok(())
}

pub fn get_job(conn: &Connection, id: &str) -> Result<Option<CacheJob>, AppError> {
    let sql = format!("SELECT {JOB_COLUMNS} FROM cache_jobs WHERE id = ?1");
    Ok(conn.query_row(&sql, params![id], job_from_row).optional()?)
}

/// Status of a job and the worker currently holding it.
pub fn job_holder(
    conn: &Connection,
    id: &str,
) -> Result<Option<(JobStatus, Option<String>)>, AppError> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT status, worker_id FROM cache_jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    row.map(|(status, worker)| {
        status
            .parse::<JobStatus>()
            .map(|status| (status, worker))
            .map_err(AppError::General)
    })
    .transpose()
}

pub fn list_jobs(
    conn: &Connection,
    status: Option<JobStatus>,
    limit: u32,
    offset: u32,
) -> Result<Vec<CacheJob>, AppError> {
    let sql = format!(
        "SELECT {JOB_COLUMNS} FROM cache_jobs
         WHERE ?1 IS NULL OR status = ?1
         ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
    );
    let mut stmt = conn.prepare(&sql)?;
    let jobs = stmt
        .query_map(
            params![status.map(|s| s.to_string()), limit, offset],
            job_from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

pub fn count_jobs(conn: &Connection, status: Option<JobStatus>) -> Result<u64, AppError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM cache_jobs WHERE ?1 IS NULL OR status = ?1",
        params![status.map(|s| s.to_string())],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Claims the oldest pending job for `worker_id`. The status compare-and-set makes the
/// claim exclusive even when several workers race for the same row.
pub fn claim_next_job(
    conn: &mut Connection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<CacheJob>, AppError> {
    let tx = conn.transaction()?;
    let candidates: Vec<String> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM cache_jobs WHERE status = 'pending' ORDER BY created_at ASC LIMIT 8",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };

    let mut claimed = None;
    for id in candidates {
        let changed = tx.execute(
            "UPDATE cache_jobs SET status = 'running', worker_id = ?2, started_at = COALESCE(started_at, ?3)
             WHERE id = ?1 AND status = 'pending'",
            params![id, worker_id, now],
        )?;
        if changed == 1 {
            claimed = Some(id);
            break;
        }
    }
    tx.commit()?;

    match claimed {
        Some(id) => get_job(conn, &id),
        None => Ok(None),
    }
}

/// Atomically moves up to `n` pending items of a job to `running` for `worker_id`.
///
/// Claims nothing unless the job itself is `running` and held by `worker_id`.
pub fn claim_pending_items(
    conn: &mut Connection,
    job_id: &str,
    worker_id: &str,
    n: usize,
    now: DateTime<Utc>,
) -> Result<Vec<CacheJobItem>, AppError> {
    if n == 0 {
        return Ok(Vec::new());
    }
    let tx = conn.transaction()?;
    let held: bool = tx.query_row(
        "SELECT EXISTS(SELECT 1 FROM cache_jobs WHERE id = ?1 AND status = 'running' AND worker_id = ?2)",
        params![job_id, worker_id],
        |row| row.get(0),
    )?;
    if !held {
        return Ok(Vec::new());
    }
    let candidates: Vec<(i64, CacheJobItem)> = {
        let sql = format!(
            "SELECT id, {ITEM_COLUMNS} FROM cache_job_items
             WHERE job_id = ?1 AND status = 'pending' ORDER BY id ASC LIMIT ?2"
        );
        let mut stmt = tx.prepare(&sql)?;
        let rows = stmt
            .query_map(params![job_id, n as i64], |row| {
                let status: String = row.get(3)?;
                Ok((
                    row.get::<_, i64>(0)?,
                    CacheJobItem {
                        job_id: row.get(1)?,
                        file_path: row.get(2)?,
                        status: status.parse::<ItemStatus>().unwrap_or(ItemStatus::Pending),
                        worker_id: row.get(4)?,
                        error_message: row.get(5)?,
                        size_bytes: row.get(6)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut claimed = Vec::with_capacity(candidates.len());
    {
        let mut stmt = tx.prepare_cached(
            "UPDATE cache_job_items SET status = 'running', worker_id = ?2, started_at = ?3
             WHERE id = ?1 AND status = 'pending'",
        )?;
        for (id, mut item) in candidates {
            if stmt.execute(params![id, worker_id, now])? == 1 {
                item.status = ItemStatus::Running;
                item.worker_id = Some(worker_id.to_string());
                claimed.push(item);
            }
        }
    }
    tx.commit()?;
    Ok(claimed)
}

/// Finalizes an item. Only the worker holding the claim may move it out of `running`.
pub fn update_item_status(
    conn: &Connection,
    job_id: &str,
    path: &str,
    status: ItemStatus,
    worker_id: &str,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE cache_job_items SET status = ?3, error_message = ?5, completed_at = ?6
         WHERE job_id = ?1 AND file_path = ?2 AND worker_id = ?4 AND status = 'running'",
        params![job_id, path, status.to_string(), worker_id, error, now],
    )?;
    Ok(changed == 1)
}

/// Recomputes progress from the item table. Counters never move backwards.
pub fn update_job_progress(conn: &Connection, job_id: &str) -> Result<JobProgress, AppError> {
    let (completed, failed): (i64, i64) = conn.query_row(
        "SELECT COALESCE(SUM(status = 'completed'), 0), COALESCE(SUM(status = 'failed'), 0)
         FROM cache_job_items WHERE job_id = ?1",
        params![job_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    conn.execute(
        "UPDATE cache_jobs SET
            completed_files = MIN(MAX(completed_files, ?2), total_files),
            failed_files = MIN(MAX(failed_files, ?3), total_files - MIN(MAX(completed_files, ?2), total_files))
         WHERE id = ?1",
        params![job_id, completed, failed],
    )?;
    let progress = conn
        .query_row(
            "SELECT total_files, completed_files, failed_files FROM cache_jobs WHERE id = ?1",
            params![job_id],
            |row| {
                Ok(JobProgress {
                    job_id: job_id.to_string(),
                    total_files: row.get(0)?,
                    completed_files: row.get(1)?,
                    failed_files: row.get(2)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("cache job {job_id}")))?;
    Ok(progress)
}

pub fn list_items(conn: &Connection, job_id: &str) -> Result<Vec<CacheJobItem>, AppError> {
    let sql =
        format!("SELECT {ITEM_COLUMNS} FROM cache_job_items WHERE job_id = ?1 ORDER BY id ASC");
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params![job_id], item_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(items)
}

pub fn count_items(conn: &Connection, job_id: &str, status: ItemStatus) -> Result<u64, AppError> {
    let count = conn.query_row(
        "SELECT COUNT(*) FROM cache_job_items WHERE job_id = ?1 AND status = ?2",
        params![job_id, status.to_string()],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Paths of a job not yet cached successfully, with their recorded sizes.
pub fn remaining_items(
    conn: &Connection,
    job_id: &str,
) -> Result<Vec<(String, Option<i64>)>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT file_path, size_bytes FROM cache_job_items
         WHERE job_id = ?1 AND status != 'completed' ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn pause_job(conn: &Connection, job_id: &str) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE cache_jobs SET status = 'paused' WHERE id = ?1 AND status IN ('pending', 'running')",
        params![job_id],
    )?;
    Ok(changed == 1)
}

pub fn resume_job(conn: &mut Connection, job_id: &str) -> Result<bool, AppError> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE cache_jobs SET status = 'pending', worker_id = NULL WHERE id = ?1 AND status = 'paused'",
        params![job_id],
    )?;
    if changed == 1 {
        tx.execute(
            "UPDATE cache_job_items SET status = 'pending', worker_id = NULL
             WHERE job_id = ?1 AND status = 'running'",
            params![job_id],
        )?;
    }
    tx.commit()?;
    Ok(changed == 1)
}

pub fn cancel_job(
    conn: &mut Connection,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE cache_jobs SET status = 'cancelled', completed_at = ?2
         WHERE id = ?1 AND status IN ('pending', 'running', 'paused')",
        params![job_id, now],
    )?;
    if changed == 1 {
        tx.execute(
            "UPDATE cache_job_items SET status = 'cancelled', completed_at = ?2
             WHERE job_id = ?1 AND status IN ('pending', 'running')",
            params![job_id, now],
        )?;
    }
    tx.commit()?;
    Ok(changed == 1)
}

/// Hands a running job back to the queue, e.g. when its worker shuts down.
pub fn release_job(conn: &mut Connection, job_id: &str, worker_id: &str) -> Result<bool, AppError> {
    let tx = conn.transaction()?;
    let changed = tx.execute(
        "UPDATE cache_jobs SET status = 'pending', worker_id = NULL
         WHERE id = ?1 AND status = 'running' AND worker_id = ?2",
        params![job_id, worker_id],
    )?;
    tx.execute(
        "UPDATE cache_job_items SET status = 'pending', worker_id = NULL
         WHERE job_id = ?1 AND status = 'running' AND worker_id = ?2",
        params![job_id, worker_id],
    )?;
    tx.commit()?;
    Ok(changed == 1)
}

pub fn complete_job(
    conn: &Connection,
    job_id: &str,
    directories_marked: u64,
    directories_rejected: u64,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    conn.execute(
        "UPDATE cache_jobs SET
            status = 'completed', completed_at = ?2, directories_marked = ?3, directories_rejected = ?4,
            last_error = (SELECT error_message FROM cache_job_items
                          WHERE job_id = ?1 AND status = 'failed'
                          ORDER BY completed_at DESC LIMIT 1)
         WHERE id = ?1 AND status = 'running'",
        params![job_id, now, directories_marked, directories_rejected],
    )?;
    Ok(())
}

pub fn fail_job(
    conn: &Connection,
    job_id: &str,
    message: &str,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    conn.execute(
        "UPDATE cache_jobs SET status = 'failed', completed_at = ?2, last_error = ?3
         WHERE id = ?1 AND status NOT IN ('completed', 'cancelled')",
        params![job_id, now, message],
    )?;
    Ok(())
}

/// Resets jobs and items left `running` by a previous process.
pub fn recover_interrupted_jobs(conn: &mut Connection) -> Result<usize, AppError> {
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE cache_job_items SET status = 'pending', worker_id = NULL
         WHERE status = 'running' AND job_id IN (SELECT id FROM cache_jobs WHERE status = 'running')",
        [],
    )?;
    let jobs = tx.execute(
        "UPDATE cache_jobs SET status = 'pending', worker_id = NULL WHERE status = 'running'",
        [],
    )?;
    tx.commit()?;
    Ok(jobs)
}

// ---------------------------------------------------------------------------
// Cache state
// ---------------------------------------------------------------------------

pub fn update_cache_status_batch(
    conn: &mut Connection,
    updates: &[CacheStatusUpdate],
    mount_root: Option<&str>,
    now: DateTime<Utc>,
) -> Result<usize, AppError> {
    let tx = conn.transaction()?;
    let mut updated = 0usize;
    for update in updates {
        let sql = "UPDATE files SET cached = ?2, cached_at = ?3, cache_job_id = ?4 WHERE path = ?1";
        let mut changed =
            tx.execute(sql, params![update.path, update.cached, now, update.job_id])?;
        if changed == 0 && update.cached {
            ensure_entry_with_parents(&tx, &update.path, mount_root)?;
            changed = tx.execute(sql, params![update.path, update.cached, now, update.job_id])?;
        }
        updated += changed;
    }
    tx.commit()?;
    Ok(updated)
}

/// True when every `(path, size)` is cataloged as cached with a matching size.
pub fn files_all_cached(conn: &Connection, files: &[(String, i64)]) -> Result<bool, AppError> {
    let mut stmt =
        conn.prepare_cached("SELECT cached, size_bytes FROM files WHERE path = ?1 AND is_directory = 0")?;
    for (path, size) in files {
        let row: Option<(bool, i64)> = stmt
            .query_row(params![path], |row| Ok((row.get(0)?, row.get(1)?)))
            .optional()?;
        match row {
            Some((true, stored)) if stored == *size => {}
            _ => return Ok(false),
        }
    }
    Ok(true)
}

pub fn set_directory_cached(
    conn: &Connection,
    path: &str,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE files SET cached = 1, cached_at = ?2, cache_job_id = ?3 WHERE path = ?1 AND is_directory = 1",
        params![path, now, job_id],
    )?;
    Ok(changed == 1)
}

// ---------------------------------------------------------------------------
// Upload status
// ---------------------------------------------------------------------------

pub fn set_upload_status(
    conn: &Connection,
    path: &str,
    state: UploadState,
    checked_at: DateTime<Utc>,
) -> Result<bool, AppError> {
    let changed = conn.execute(
        "UPDATE files SET upload_status = ?2, upload_checked_at = ?3 WHERE path = ?1",
        params![path, state.to_string(), checked_at],
    )?;
    Ok(changed == 1)
}

pub fn clear_stale_upload_status(
    conn: &Connection,
    older_than: DateTime<Utc>,
) -> Result<usize, AppError> {
    let cleared = conn.execute(
        "UPDATE files SET upload_status = NULL, upload_checked_at = NULL
         WHERE upload_status IS NOT NULL AND (upload_checked_at IS NULL OR upload_checked_at < ?1)",
        params![older_than],
    )?;
    Ok(cleared)
}

/// Keyset page of plain files after `after_id`: `(id, path, stored upload state)`.
pub fn page_files(
    conn: &Connection,
    after_id: i64,
    limit: usize,
) -> Result<Vec<(i64, String, Option<UploadState>)>, AppError> {
    let mut stmt = conn.prepare_cached(
        "SELECT id, path, upload_status FROM files
         WHERE is_directory = 0 AND id > ?1 ORDER BY id ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![after_id, limit as i64], |row| {
            let state: Option<String> = row.get(2)?;
            Ok((
                row.get(0)?,
                row.get(1)?,
                state.and_then(|s| s.parse::<UploadState>().ok()),
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_uploading(conn: &Connection) -> Result<Vec<String>, AppError> {
    let mut stmt =
        conn.prepare("SELECT path FROM files WHERE upload_status = 'uploading' ORDER BY path")?;
    let paths = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(paths)
}
