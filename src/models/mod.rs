pub mod cache_job;
pub mod file_entry;
pub mod search;
pub mod session;
pub mod upload;
