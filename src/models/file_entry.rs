use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Uploading,
    Complete,
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uploading => write!(f, "uploading"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for UploadState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploading" => Ok(Self::Uploading),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("unknown upload state: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadStatus {
    pub state: UploadState,
    pub last_checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedSize {
    pub total_bytes: i64,
    pub file_count: i64,
    pub calculated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub path: String,
    pub name: String,
    pub parent_path: Option<String>,
    pub is_directory: bool,
    pub size_bytes: i64,
    pub modified_at: Option<DateTime<Utc>>,
    pub permissions: Option<u32>,
    pub cached: bool,
    pub last_seen_session_id: Option<String>,
    pub upload_status: Option<UploadStatus>,
    pub computed_size: Option<ComputedSize>,
}

impl CatalogEntry {
    /// A freshly sighted entry with no cache, upload or size bookkeeping yet.
    pub fn sighted(
        path: String,
        is_directory: bool,
        size_bytes: i64,
        modified_at: Option<DateTime<Utc>>,
        permissions: Option<u32>,
    ) -> Self {
        let name = crate::scope_path::name_of(&path);
        let parent_path = crate::scope_path::parent_of(&path);
        Self {
            path,
            name,
            parent_path,
            is_directory,
            size_bytes,
            modified_at,
            permissions,
            cached: false,
            last_seen_session_id: None,
            upload_status: None,
            computed_size: None,
        }
    }

    /// Builds an entry from filesystem metadata. Mtimes are truncated to milliseconds
    /// so they compare equal after a round trip through the catalog.
    pub fn from_metadata(path: String, metadata: &std::fs::Metadata) -> Self {
        let modified_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from)
            .and_then(|t| DateTime::from_timestamp_millis(t.timestamp_millis()));

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode())
        };
        #[cfg(not(unix))]
        let permissions = None;

        let size_bytes = if metadata.is_dir() {
            0
        } else {
            metadata.len() as i64
        };
        Self::sighted(path, metadata.is_dir(), size_bytes, modified_at, permissions)
    }

    pub fn modified_millis(&self) -> Option<i64> {
        self.modified_at.map(|t| t.timestamp_millis())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletedEntry {
    pub path: String,
    pub parent_path: Option<String>,
    pub is_directory: bool,
}

#[derive(Debug, Clone)]
pub struct CacheStatusUpdate {
    pub path: String,
    pub cached: bool,
    pub job_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sighted_entry_derives_name_and_parent() {
        let entry = CatalogEntry::sighted("/mnt/fs/a/b.txt".to_string(), false, 3, None, None);
        assert_eq!(entry.name, "b.txt");
        assert_eq!(entry.parent_path.as_deref(), Some("/mnt/fs/a"));
        assert!(!entry.cached);
    }

    #[test]
    fn upload_state_round_trips_through_strings() {
        assert_eq!("uploading".parse::<UploadState>(), Ok(UploadState::Uploading));
        assert_eq!(UploadState::Complete.to_string(), "complete");
        assert!("bogus".parse::<UploadState>().is_err());
    }
}
