use rusqlite::Connection;

use crate::error::AppError;

const SCHEMA_V1: &str = "
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    parent_path TEXT,
    is_directory BOOLEAN NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    modified_at TEXT,
    permissions INTEGER,
    cached BOOLEAN NOT NULL DEFAULT 0,
    cached_at TEXT,
    cache_job_id TEXT,
    last_seen_session_id TEXT,
    upload_status TEXT CHECK (upload_status IS NULL OR upload_status IN ('uploading', 'complete')),
    upload_checked_at TEXT,
    computed_size_bytes INTEGER,
    computed_file_count INTEGER,
    size_calculated_at TEXT,
    indexed_at TEXT DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_files_parent ON files(parent_path);
CREATE INDEX IF NOT EXISTS idx_files_session ON files(last_seen_session_id);
CREATE INDEX IF NOT EXISTS idx_files_upload ON files(upload_status);

CREATE TABLE IF NOT EXISTS indexing_sessions (
    id TEXT PRIMARY KEY,
    root_path TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN ('running', 'completed', 'failed')),
    created_at TEXT NOT NULL,
    completed_at TEXT,
    files_processed INTEGER NOT NULL DEFAULT 0,
    files_indexed INTEGER NOT NULL DEFAULT 0,
    files_skipped INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    files_deleted INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sessions_root ON indexing_sessions(root_path, created_at DESC);

CREATE TABLE IF NOT EXISTS cache_jobs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL
        CHECK (status IN ('pending', 'running', 'paused', 'cancelled', 'completed', 'failed')),
    file_paths TEXT NOT NULL,
    directory_paths TEXT NOT NULL,
    total_files INTEGER NOT NULL DEFAULT 0,
    completed_files INTEGER NOT NULL DEFAULT 0,
    failed_files INTEGER NOT NULL DEFAULT 0,
    total_bytes INTEGER NOT NULL DEFAULT 0,
    worker_id TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT,
    last_error TEXT,
    directories_marked INTEGER NOT NULL DEFAULT 0,
    directories_rejected INTEGER NOT NULL DEFAULT 0,
    CHECK (completed_files + failed_files <= total_files)
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON cache_jobs(status, created_at);

CREATE TABLE IF NOT EXISTS cache_job_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL REFERENCES cache_jobs(id) ON DELETE CASCADE,
    file_path TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
    worker_id TEXT,
    error_message TEXT,
    size_bytes INTEGER,
    started_at TEXT,
    completed_at TEXT,
    UNIQUE(job_id, file_path)
);

CREATE INDEX IF NOT EXISTS idx_items_job_status ON cache_job_items(job_id, status);
";

pub fn run_migrations(conn: &Connection) -> Result<(), AppError> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    conn.execute_batch(SCHEMA_V1)?;
    Ok(())
}
