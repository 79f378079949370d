use std::path::{Component, Path};

use crate::error::AppError;

const FORBIDDEN_PATTERNS: &[&str] = &[";", "&&", "||", "|", "`", "$(", "${", "\n", "\r"];

pub fn normalize(path: &str) -> String {
    let mut normalized = path.replace('\\', "/");
    while normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }
    normalized
}

/// True when `path` is `root` itself or lies beneath it.
pub fn is_within_scope(path: &str, root: &str) -> bool {
    let (path, root) = (normalize(path), normalize(root));
    match path.strip_prefix(root.as_str()) {
        Some("") => true,
        Some(rest) => root == "/" || rest.starts_with('/'),
        None => false,
    }
}

/// Parent directory of a normalized path, `None` for the filesystem root.
pub fn parent_of(path: &str) -> Option<String> {
    let path = normalize(path);
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    if idx == 0 {
        return Some("/".to_string());
    }
    Some(path[..idx].to_string())
}

pub fn name_of(path: &str) -> String {
    let path = normalize(path);
    path.rsplit('/').next().unwrap_or(&path).to_string()
}

pub fn depth(path: &str) -> usize {
    normalize(path)
        .split('/')
        .filter(|segment| !segment.is_empty())
        .count()
}

/// Parent chain of `path`, nearest first, stopping at `root` (inclusive).
/// Paths outside `root` yield an empty chain.
pub fn ancestors_within(path: &str, root: &str) -> Vec<String> {
    let mut chain = Vec::new();
    if !is_within_scope(path, root) {
        return chain;
    }
    let root = normalize(root);
    let mut current = normalize(path);
    while current != root {
        match parent_of(&current) {
            Some(parent) => {
                chain.push(parent.clone());
                current = parent;
            }
            None => break,
        }
    }
    chain
}

pub fn validate_path(path: &str) -> Result<(), AppError> {
    if path.trim().is_empty() {
        return Err(AppError::General("path is empty".to_string()));
    }

    for pattern in FORBIDDEN_PATTERNS {
        if path.contains(pattern) {
            return Err(AppError::General(format!(
                "path contains forbidden pattern: {pattern}"
            )));
        }
    }

    if Path::new(path)
        .components()
        .any(|component| matches!(component, Component::ParentDir))
    {
        return Err(AppError::General(
            "path traversal (.. component) not allowed".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_separators() {
        assert_eq!(normalize("/mnt/fs/projects//"), "/mnt/fs/projects");
        assert_eq!(normalize("\\\\nas\\share"), "//nas/share");
        assert_eq!(normalize("/"), "/");
    }

    #[test]
    fn scope_covers_root_and_descendants_only() {
        assert!(is_within_scope("/mnt/fs/shots/", "/mnt/fs/shots"));
        assert!(is_within_scope("/mnt/fs/shots/010/plate.exr", "/mnt/fs/shots"));
        assert!(!is_within_scope("/mnt/fs/shots_old/a", "/mnt/fs/shots"));
        assert!(!is_within_scope("/mnt/fs", "/mnt/fs/shots"));
        assert!(is_within_scope("/mnt/fs", "/"));
    }

    #[test]
    fn parent_and_name() {
        assert_eq!(parent_of("/a/b/c.txt").as_deref(), Some("/a/b"));
        assert_eq!(parent_of("/a").as_deref(), Some("/"));
        assert_eq!(parent_of("/"), None);
        assert_eq!(name_of("/a/b/c.txt"), "c.txt");
    }

    #[test]
    fn depth_counts_segments() {
        assert_eq!(depth("/"), 0);
        assert_eq!(depth("/a"), 1);
        assert_eq!(depth("/a/b/c"), 3);
    }

    #[test]
    fn ancestors_stop_at_root() {
        assert_eq!(
            ancestors_within("/mnt/fs/a/b/c.txt", "/mnt/fs"),
            vec!["/mnt/fs/a/b", "/mnt/fs/a", "/mnt/fs"]
        );
        assert_eq!(ancestors_within("/mnt/fs", "/mnt/fs"), Vec::<String>::new());
        assert!(ancestors_within("/other/x", "/mnt/fs").is_empty());
    }

    #[test]
    fn validate_rejects_traversal_and_shell_syntax() {
        assert!(validate_path("/mnt/fs/a.txt").is_ok());
        assert!(validate_path("").is_err());
        assert!(validate_path("/mnt/../etc/passwd").is_err());
        assert!(validate_path("/mnt/fs/a; rm -rf /").is_err());
    }
}
