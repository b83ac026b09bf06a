use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use notify::event::{AccessKind, MetadataKind, ModifyKind, RenameMode};
use notify::{EventKind as NotifyKind, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use anyhow::{Context, Result};
use crate::config::{WatchMode, WatcherConfig};
use crate::core::{is_within, normalize_path, parent_path, EndpointError, EndpointResult, Event, Node, NodeMetadata, WatchError};
use super::{Endpoint, IgnoreRules, WatchHandle, WatchSink, Watchable};

/// Endpoint backed by a directory on the local filesystem.
///
/// Node paths are relative to the base directory. Branch nodes are
/// directories and leaf nodes are files; file content is not transferred here,
/// so creating a leaf creates an empty file and updating one touches it.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    base: PathBuf,
    mode: WatchMode,
    poll_interval: std::time::Duration,
    rules: IgnoreRules,
}

impl LocalEndpoint {
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self> {
        Self::with_config(base, &WatcherConfig::default())
    }

    pub fn with_config<P: AsRef<Path>>(base: P, config: &WatcherConfig) -> Result<Self> {
        let base = base.as_ref();
        if !base.is_dir() {
            anyhow::bail!("Path is not a directory: {}", base.display());
        }
        // notify reports canonical paths, so compare against the canonical base
        let base = fs::canonicalize(base)
            .with_context(|| format!("Failed to resolve {}", base.display()))?;
        let rules = IgnoreRules::new(&base, &config.ignore)?;

        Ok(Self {
            base,
            mode: config.mode.clone(),
            poll_interval: config.poll_interval_duration(),
            rules,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, path: &str) -> EndpointResult<PathBuf> {
        let key = normalize_path(path);
        let relative = Path::new(&key);
        if relative.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(EndpointError::InvalidPath(path.to_string()));
        }
        Ok(self.base.join(relative))
    }

    /// Nodes are only created inside an existing directory.
    fn check_parent(&self, path: &str) -> EndpointResult<()> {
        let key = normalize_path(path);
        let parent = match parent_path(&key) {
            None => return Err(EndpointError::InvalidPath(key)),
            Some("") => return Ok(()),
            Some(parent) => parent,
        };
        match fs::metadata(self.resolve(parent)?) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(EndpointError::InvalidPath(format!("{} is a leaf", parent))),
            Err(err) => Err(map_io(parent, err)),
        }
    }

    fn translator(&self, root: &str) -> EventTranslator {
        EventTranslator {
            base: self.base.clone(),
            root: normalize_path(root),
            rules: self.rules.clone(),
        }
    }
}

fn map_io(path: &str, err: io::Error) -> EndpointError {
    match err.kind() {
        io::ErrorKind::NotFound => EndpointError::NotFound(normalize_path(path)),
        io::ErrorKind::AlreadyExists => EndpointError::AlreadyExists(normalize_path(path)),
        _ => EndpointError::Io(err),
    }
}

fn touch(target: &Path, modified: Option<SystemTime>) -> io::Result<()> {
    let file = fs::OpenOptions::new().write(true).open(target)?;
    file.set_modified(modified.unwrap_or_else(SystemTime::now))
}

impl Endpoint for LocalEndpoint {
    fn create_node(&self, node: &Node, update_if_exists: bool) -> EndpointResult<()> {
        let target = self.resolve(&node.path)?;
        if target.exists() {
            if !update_if_exists {
                return Err(EndpointError::AlreadyExists(normalize_path(&node.path)));
            }
            return self.update_node(node);
        }

        self.check_parent(&node.path)?;

        if node.leaf {
            let file = fs::File::create(&target).map_err(|e| map_io(&node.path, e))?;
            if let Some(modified) = node.metadata.modified {
                file.set_modified(modified).map_err(|e| map_io(&node.path, e))?;
            }
        } else {
            fs::create_dir(&target).map_err(|e| map_io(&node.path, e))?;
        }
        Ok(())
    }

    fn update_node(&self, node: &Node) -> EndpointResult<()> {
        let target = self.resolve(&node.path)?;
        let metadata = fs::metadata(&target).map_err(|e| map_io(&node.path, e))?;
        if metadata.is_file() {
            touch(&target, node.metadata.modified).map_err(|e| map_io(&node.path, e))?;
        }
        Ok(())
    }

    fn load_node(&self, path: &str, leaf_hint: Option<bool>) -> EndpointResult<Node> {
        let target = self.resolve(path)?;
        let metadata = fs::metadata(&target).map_err(|e| map_io(path, e))?;
        let leaf = metadata.is_file();
        if leaf_hint.is_some_and(|hint| hint != leaf) {
            return Err(EndpointError::NotFound(normalize_path(path)));
        }

        Ok(Node {
            path: normalize_path(path),
            leaf,
            metadata: NodeMetadata {
                size: leaf.then_some(metadata.len()),
                modified: metadata.modified().ok(),
                etag: None,
            },
        })
    }

    fn delete_node(&self, path: &str) -> EndpointResult<()> {
        let target = self.resolve(path)?;
        let metadata = fs::symlink_metadata(&target).map_err(|e| map_io(path, e))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&target).map_err(|e| map_io(path, e))
        } else {
            fs::remove_file(&target).map_err(|e| map_io(path, e))
        }
    }

    fn move_node(&self, src: &str, dst: &str) -> EndpointResult<()> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        if !from.exists() {
            return Err(EndpointError::NotFound(normalize_path(src)));
        }
        if to.exists() {
            return Err(EndpointError::AlreadyExists(normalize_path(dst)));
        }
        self.check_parent(dst)?;
        fs::rename(&from, &to).map_err(|e| map_io(src, e))
    }
}

impl Watchable for LocalEndpoint {
    fn watch(&self, root: &str) -> Result<WatchHandle, WatchError> {
        let root_dir = self.resolve(root).map_err(|e| WatchError::Setup {
            root: root.to_string(),
            reason: e.to_string(),
        })?;
        if !root_dir.is_dir() {
            return Err(WatchError::Setup {
                root: root.to_string(),
                reason: format!("{} is not a directory", root_dir.display()),
            });
        }

        let translator = self.translator(root);
        let (sink, handle_parts) = WatchSink::channel(());
        let callback_sink = sink.clone();
        let handler = move |result: notify::Result<notify::Event>| match result {
            Ok(event) => {
                for translated in translator.translate(event) {
                    if !callback_sink.send_event(translated) {
                        break; // Handle dropped
                    }
                }
            }
            Err(err) => {
                tracing::error!("File watcher error: {}", err);
                callback_sink.send_error(WatchError::Backend(err.to_string()));
            }
        };

        let setup_error = |err: notify::Error| WatchError::Setup {
            root: root.to_string(),
            reason: err.to_string(),
        };

        let mut watcher: Box<dyn Watcher + Send> = match self.mode {
            WatchMode::Polling => Box::new(
                PollWatcher::new(handler, notify::Config::default().with_poll_interval(self.poll_interval))
                    .map_err(setup_error)?,
            ),
            WatchMode::Native => Box::new(
                RecommendedWatcher::new(handler, notify::Config::default()).map_err(setup_error)?,
            ),
            WatchMode::Auto => {
                // Native events with polling fallback
                let fallback = handler.clone();
                match RecommendedWatcher::new(handler, notify::Config::default()) {
                    Ok(native) => Box::new(native),
                    Err(err) => {
                        tracing::warn!("Native watcher unavailable ({}), falling back to polling", err);
                        Box::new(
                            PollWatcher::new(
                                fallback,
                                notify::Config::default().with_poll_interval(self.poll_interval),
                            )
                            .map_err(setup_error)?,
                        )
                    }
                }
            }
        };

        watcher
            .watch(&root_dir, RecursiveMode::Recursive)
            .map_err(setup_error)?;
        tracing::debug!("Watching {} ({:?})", root_dir.display(), self.mode);

        let WatchHandle { events, errors, .. } = handle_parts;
        drop(sink);
        Ok(WatchHandle::new(events, errors, watcher))
    }
}

/// Maps raw notify events onto root-relative pipeline events.
#[derive(Debug, Clone)]
struct EventTranslator {
    base: PathBuf,
    root: String,
    rules: IgnoreRules,
}

impl EventTranslator {
    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.base).ok()?;
        let key = normalize_path(&relative.to_string_lossy());
        if !is_within(&self.root, &key) || key == self.root {
            return None;
        }
        if self.rules.is_ignored(&key, path.is_dir()) {
            return None;
        }
        Some(key)
    }

    fn translate(&self, event: notify::Event) -> Vec<Event> {
        let paths = &event.paths;
        match event.kind {
            NotifyKind::Create(_) => self.each(paths, Event::created),
            NotifyKind::Remove(_) => self.each(paths, Event::deleted),
            NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                match (self.relative(&paths[0]), self.relative(&paths[1])) {
                    (Some(from), Some(to)) => vec![Event::moved(from, to)],
                    // Moved across the root boundary or out of ignored space
                    (Some(from), None) => vec![Event::deleted(from)],
                    (None, Some(to)) => vec![Event::created(to)],
                    (None, None) => Vec::new(),
                }
            }
            NotifyKind::Modify(ModifyKind::Name(RenameMode::From)) => self.each(paths, Event::deleted),
            NotifyKind::Modify(ModifyKind::Name(RenameMode::To)) => self.each(paths, Event::created),
            NotifyKind::Modify(ModifyKind::Name(_)) => paths
                .iter()
                .filter_map(|p| {
                    let key = self.relative(p)?;
                    Some(if p.exists() { Event::created(key) } else { Event::deleted(key) })
                })
                .collect(),
            NotifyKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => Vec::new(),
            NotifyKind::Modify(_) => self.each(paths, Event::updated),
            NotifyKind::Access(AccessKind::Close(notify::event::AccessMode::Write)) => {
                self.each(paths, Event::updated)
            }
            NotifyKind::Access(_) | NotifyKind::Any | NotifyKind::Other => Vec::new(),
        }
    }

    fn each(&self, paths: &[PathBuf], make: fn(String) -> Event) -> Vec<Event> {
        paths.iter().filter_map(|p| self.relative(p)).map(make).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKind;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use tempfile::TempDir;

    fn endpoint() -> (TempDir, LocalEndpoint) {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let endpoint = LocalEndpoint::new(dir.path()).expect("Failed to create endpoint");
        (dir, endpoint)
    }

    #[test]
    fn test_create_and_load_nodes() {
        let (_dir, endpoint) = endpoint();

        endpoint.create_node(&Node::branch("docs"), false).unwrap();
        endpoint.create_node(&Node::leaf("/docs/a.txt"), false).unwrap();

        let node = endpoint.load_node("docs/a.txt", None).unwrap();
        assert!(node.leaf);
        assert_eq!(node.path, "docs/a.txt");
        assert_eq!(node.metadata.size, Some(0));

        let dir_node = endpoint.load_node("docs", Some(false)).unwrap();
        assert!(!dir_node.leaf);
        assert!(matches!(endpoint.load_node("docs", Some(true)), Err(EndpointError::NotFound(_))));
    }

    #[test]
    fn test_create_existing_node() {
        let (_dir, endpoint) = endpoint();
        let node = Node::leaf("a.txt");

        endpoint.create_node(&node, false).unwrap();
        assert!(matches!(endpoint.create_node(&node, false), Err(EndpointError::AlreadyExists(p)) if p == "a.txt"));
        assert!(endpoint.create_node(&node, true).is_ok());
    }

    #[test]
    fn test_create_requires_existing_parent() {
        let (dir, endpoint) = endpoint();

        let missing = endpoint.create_node(&Node::leaf("deep/nested/file.txt"), false);
        assert!(matches!(missing, Err(EndpointError::NotFound(p)) if p == "deep/nested"));
        assert!(!dir.path().join("deep").exists());

        endpoint.create_node(&Node::leaf("file.txt"), false).unwrap();
        let under_leaf = endpoint.create_node(&Node::leaf("file.txt/inner"), false);
        assert!(matches!(under_leaf, Err(EndpointError::InvalidPath(_))));

        endpoint.create_node(&Node::branch("deep"), false).unwrap();
        endpoint.create_node(&Node::leaf("deep/file.txt"), false).unwrap();
        assert!(dir.path().join("deep/file.txt").is_file());
    }

    #[test]
    fn test_missing_nodes() {
        let (_dir, endpoint) = endpoint();

        assert!(matches!(endpoint.update_node(&Node::leaf("nope")), Err(EndpointError::NotFound(_))));
        assert!(matches!(endpoint.load_node("nope", None), Err(EndpointError::NotFound(_))));
        assert!(matches!(endpoint.delete_node("nope"), Err(EndpointError::NotFound(_))));
        assert!(matches!(endpoint.move_node("nope", "other"), Err(EndpointError::NotFound(_))));
    }

    #[test]
    fn test_update_sets_modified_time() {
        let (_dir, endpoint) = endpoint();
        endpoint.create_node(&Node::leaf("a.txt"), false).unwrap();

        let when = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_600_000_000);
        endpoint.update_node(&Node::leaf("a.txt").with_modified(when)).unwrap();

        let node = endpoint.load_node("a.txt", Some(true)).unwrap();
        assert_eq!(node.metadata.modified, Some(when));
    }

    #[test]
    fn test_move_and_delete() {
        let (dir, endpoint) = endpoint();
        endpoint.create_node(&Node::leaf("a.txt"), false).unwrap();
        endpoint.create_node(&Node::leaf("b.txt"), false).unwrap();

        assert!(matches!(endpoint.move_node("a.txt", "b.txt"), Err(EndpointError::AlreadyExists(_))));
        assert!(matches!(endpoint.move_node("a.txt", "moved/c.txt"), Err(EndpointError::NotFound(p)) if p == "moved"));
        assert!(!dir.path().join("moved").exists());

        endpoint.create_node(&Node::branch("moved"), false).unwrap();
        endpoint.move_node("a.txt", "moved/c.txt").unwrap();
        assert!(dir.path().join("moved/c.txt").is_file());
        assert!(!dir.path().join("a.txt").exists());

        endpoint.delete_node("moved").unwrap();
        assert!(!dir.path().join("moved").exists());
    }

    #[test]
    fn test_rejects_parent_traversal() {
        let (_dir, endpoint) = endpoint();
        assert!(matches!(endpoint.load_node("../etc/passwd", None), Err(EndpointError::InvalidPath(_))));
    }

    #[test]
    fn test_watch_requires_directory() {
        let (_dir, endpoint) = endpoint();
        assert!(matches!(endpoint.watch("missing"), Err(WatchError::Setup { .. })));
    }

    #[test]
    fn test_translate_notify_events() {
        let (_dir, endpoint) = endpoint();
        let base = endpoint.base().to_path_buf();
        let translator = endpoint.translator("docs");

        let created = notify::Event::new(NotifyKind::Create(CreateKind::File))
            .add_path(base.join("docs/a.txt"));
        let events = translator.translate(created);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].path, "docs/a.txt");
        assert_eq!(events[0].kind, EventKind::Created);

        let modified = notify::Event::new(NotifyKind::Modify(ModifyKind::Data(DataChange::Content)))
            .add_path(base.join("docs/a.txt"));
        assert_eq!(translator.translate(modified)[0].kind, EventKind::Updated);

        let renamed = notify::Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(base.join("docs/a.txt"))
            .add_path(base.join("docs/b.txt"));
        let events = translator.translate(renamed);
        assert_eq!(events[0].path, "docs/b.txt");
        assert_eq!(events[0].source(), Some("docs/a.txt"));

        // Outside the watched root
        let outside = notify::Event::new(NotifyKind::Remove(RemoveKind::File))
            .add_path(base.join("other/x.txt"));
        assert!(translator.translate(outside).is_empty());

        // Ignored by default rules
        let swap = notify::Event::new(NotifyKind::Create(CreateKind::File))
            .add_path(base.join("docs/.a.txt.swp"));
        assert!(translator.translate(swap).is_empty());
    }

    #[test]
    fn test_translate_rename_across_root() {
        let (_dir, endpoint) = endpoint();
        let base = endpoint.base().to_path_buf();
        let translator = endpoint.translator("docs");

        let out_of_root = notify::Event::new(NotifyKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(base.join("docs/a.txt"))
            .add_path(base.join("archive/a.txt"));
        let events = translator.translate(out_of_root);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Deleted);
        assert_eq!(events[0].path, "docs/a.txt");
    }
}
