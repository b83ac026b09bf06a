use std::path::{Path, PathBuf};
use ignore::gitignore::{Gitignore, GitignoreBuilder};
use anyhow::{Context, Result};

/// Name of the optional per-root ignore file, gitignore syntax.
pub const IGNORE_FILE_NAME: &str = ".treesyncignore";

/// Patterns always applied on top of configured ones.
pub const DEFAULT_PATTERNS: &[&str] = &[
    ".DS_Store",
    "Thumbs.db",
    "*.swp",
    "*.swx",
    "*~",
    ".#*",
    "*.tmp",
];

/// Gitignore-style rules deciding which local paths never produce events.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    root_path: PathBuf,
    matcher: Gitignore,
}

impl IgnoreRules {
    pub fn new<P: AsRef<Path>>(root_path: P, patterns: &[String]) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();
        let mut builder = GitignoreBuilder::new(&root_path);

        for pattern in DEFAULT_PATTERNS.iter().copied().chain(patterns.iter().map(String::as_str)) {
            builder
                .add_line(None, pattern)
                .with_context(|| format!("Invalid ignore pattern: {}", pattern))?;
        }

        let ignore_file = root_path.join(IGNORE_FILE_NAME);
        if ignore_file.is_file() {
            if let Some(err) = builder.add(&ignore_file) {
                tracing::warn!("Error reading {}: {}", ignore_file.display(), err);
            }
        }

        let matcher = builder.build().context("Failed to build ignore rules")?;
        Ok(Self { root_path, matcher })
    }

    /// Check a path relative to the root, using `/` separators.
    pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        if relative.is_empty() {
            return false;
        }

        // Always ignore .git directory itself
        if relative.split('/').any(|comp| comp == ".git") {
            return true;
        }

        self.matcher
            .matched_path_or_any_parents(Path::new(relative), is_dir)
            .is_ignore()
    }

    pub fn root_path(&self) -> &Path {
        &self.root_path
    }
}
