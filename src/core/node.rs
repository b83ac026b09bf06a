use std::time::SystemTime;
use serde::{Deserialize, Serialize};

/// Normalize a node path into its canonical key.
///
/// Paths are `/`-separated with no leading or trailing separator; empty and
/// `.` components are dropped and backslashes are treated as separators. The
/// tree root is the empty string.
pub fn normalize_path(path: &str) -> String {
    path.split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Parent key of a normalized path, `None` for the root itself.
pub fn parent_path(path: &str) -> Option<&str> {
    if path.is_empty() {
        return None;
    }
    Some(path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or(""))
}

/// Whether `path` lies at or below `root` (both normalized).
pub fn is_within(root: &str, path: &str) -> bool {
    root.is_empty()
        || path == root
        || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

/// Backend-owned attributes of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub size: Option<u64>,
    pub modified: Option<SystemTime>,
    /// Content signature (hash or etag) when the backend has one
    pub etag: Option<String>,
}

/// A path-addressed entry in a hierarchical store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub path: String,
    pub leaf: bool,
    pub metadata: NodeMetadata,
}

impl Node {
    pub fn leaf<P: AsRef<str>>(path: P) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            leaf: true,
            metadata: NodeMetadata::default(),
        }
    }

    pub fn branch<P: AsRef<str>>(path: P) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            leaf: false,
            metadata: NodeMetadata::default(),
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.metadata.size = Some(size);
        self
    }

    pub fn with_modified(mut self, modified: SystemTime) -> Self {
        self.metadata.modified = Some(modified);
        self
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.metadata.etag = Some(etag.into());
        self
    }

    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/docs/a.txt"), "docs/a.txt");
        assert_eq!(normalize_path("docs//a.txt/"), "docs/a.txt");
        assert_eq!(normalize_path("./docs/./a.txt"), "docs/a.txt");
        assert_eq!(normalize_path("docs\\sub\\b.txt"), "docs/sub/b.txt");
        assert_eq!(normalize_path("/"), "");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("docs/a.txt"), Some("docs"));
        assert_eq!(parent_path("docs"), Some(""));
        assert_eq!(parent_path(""), None);
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("", "anything/at/all"));
        assert!(is_within("docs", "docs"));
        assert!(is_within("docs", "docs/a.txt"));
        assert!(!is_within("docs", "docsextra/a.txt"));
        assert!(!is_within("docs", "other"));
    }

    #[test]
    fn test_node_builders() {
        let node = Node::leaf("/docs/a.txt").with_size(12).with_etag("abc");

        assert_eq!(node.path, "docs/a.txt");
        assert!(node.leaf);
        assert_eq!(node.name(), "a.txt");
        assert_eq!(node.metadata.size, Some(12));
        assert_eq!(node.metadata.etag.as_deref(), Some("abc"));
        assert!(!Node::branch("docs").leaf);
    }
}
