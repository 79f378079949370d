pub mod cache_commands;
pub mod indexing_commands;
pub mod search_commands;
pub mod upload_commands;
