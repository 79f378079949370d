use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadStatusReport {
    pub path: String,
    pub is_uploading: bool,
    pub remote_id: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadMonitorEntry {
    pub path: String,
    pub started_at: DateTime<Utc>,
    pub check_count: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct HotDirectory {
    pub path: String,
    pub hits: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorSnapshot {
    pub active: Vec<UploadMonitorEntry>,
    pub queued: Vec<String>,
    pub hot_directories: Vec<HotDirectory>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanStats {
    pub checked: usize,
    pub uploading: usize,
    pub newly_detected: usize,
    pub errors: usize,
    pub cleared_stale: usize,
}
