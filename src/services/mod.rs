pub mod activity_watcher;
pub mod cache_scheduler;
pub mod cache_service;
pub mod cache_worker;
pub mod directory_size_service;
pub mod indexing_service;
pub mod search_service;
pub mod upload_monitor_service;
pub mod upload_status_service;
