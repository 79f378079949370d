use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::session::SessionCounts;

const DEFAULT_CAPACITY: usize = 1024;

/// Notifications published by the crawler, the scheduler and the upload monitor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    CrawlProgress {
        session_id: String,
        root_path: String,
        files_processed: u64,
        files_indexed: u64,
        files_skipped: u64,
        errors: u64,
        batch_size: usize,
    },
    #[serde(rename_all = "camelCase")]
    CrawlComplete {
        session_id: String,
        root_path: String,
        counts: SessionCounts,
        deletion_skipped: Option<String>,
        duration_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    CrawlError {
        session_id: String,
        root_path: String,
        message: String,
    },
    #[serde(rename_all = "camelCase")]
    JobProgress {
        job_id: String,
        total_files: u64,
        completed_files: u64,
        failed_files: u64,
        percentage: f64,
    },
    #[serde(rename_all = "camelCase")]
    JobCompleted {
        job_id: String,
        completed_files: u64,
        failed_files: u64,
        directories_marked: u64,
        directories_rejected: u64,
    },
    #[serde(rename_all = "camelCase")]
    JobFailed { job_id: String, error: String },
    #[serde(rename_all = "camelCase")]
    FileStarted { job_id: String, path: String },
    #[serde(rename_all = "camelCase")]
    FileCompleted {
        job_id: String,
        path: String,
        bytes: u64,
    },
    #[serde(rename_all = "camelCase")]
    FileFailed {
        job_id: String,
        path: String,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    UploadDetected {
        path: String,
        remote_id: Option<String>,
    },
    UploadCompleted { path: String },
}

/// Fan-out channel for [`Event`]s. Publishing never blocks; slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: Event) {
        // Err only means there are no subscribers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_case_tag() {
        let event = Event::JobFailed {
            job_id: "j1".to_string(),
            error: "catalog unavailable".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "job-failed");
        assert_eq!(json["jobId"], "j1");

        let json = serde_json::to_value(Event::UploadCompleted {
            path: "/m/a".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "upload-completed");
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(Event::UploadCompleted {
            path: "/m/a".to_string(),
        });
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(Event::FileStarted {
            job_id: "j1".to_string(),
            path: "/m/a".to_string(),
        });
        match rx.recv().await.unwrap() {
            Event::FileStarted { path, .. } => assert_eq!(path, "/m/a"),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
