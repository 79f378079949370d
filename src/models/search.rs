use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub file_path: String,
    pub file_name: String,
    pub is_directory: bool,
    pub score: f64,
    pub match_source: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkIndexResult {
    pub indexed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkDeleteResult {
    pub deleted: usize,
    pub errors: Vec<String>,
}
