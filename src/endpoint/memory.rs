use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;
use crate::core::{is_within, normalize_path, parent_path, EndpointError, EndpointResult, Event, Node, WatchError};
use super::{Endpoint, WatchHandle, WatchSink, Watchable};

struct Subscriber {
    root: String,
    sink: WatchSink,
}

#[derive(Default)]
struct Inner {
    nodes: RwLock<BTreeMap<String, Node>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// Thread-safe in-memory tree that reports every mutation to its watchers,
/// the way a remote store's change feed does.
///
/// Clones share the same tree.
#[derive(Clone, Default)]
pub struct MemoryEndpoint {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEndpoint")
            .field("nodes", &self.len())
            .field("watchers", &self.watcher_count())
            .finish()
    }
}

impl MemoryEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes, excluding the implicit root.
    pub fn len(&self) -> usize {
        self.inner.nodes.read().map(|nodes| nodes.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &str) -> bool {
        let key = normalize_path(path);
        key.is_empty() || self.inner.nodes.read().map(|nodes| nodes.contains_key(&key)).unwrap_or(false)
    }

    /// Number of live watch handles.
    pub fn watcher_count(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|s| !s.sink.is_closed());
        subscribers.len()
    }

    /// Report a change that did not go through this endpoint.
    pub fn inject_event(&self, event: Event) {
        self.publish(event);
    }

    /// Report a watch failure to every watcher.
    pub fn inject_error(&self, error: WatchError) {
        for subscriber in self.subscribers().iter() {
            subscriber.sink.send_error(error.clone());
        }
    }

    /// Drop every watch feed, as if the remote connection was lost.
    pub fn disconnect_watchers(&self) {
        self.subscribers().clear();
    }

    fn subscribers(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn nodes_mut(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Node>> {
        self.inner.nodes.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn nodes(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Node>> {
        self.inner.nodes.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers();
        subscribers.retain(|s| !s.sink.is_closed());
        for subscriber in subscribers.iter() {
            if event.paths().any(|p| is_within(&subscriber.root, p)) {
                subscriber.sink.send_event(event.clone());
            }
        }
    }

    fn check_parent(nodes: &BTreeMap<String, Node>, key: &str) -> EndpointResult<()> {
        match parent_path(key) {
            None => Err(EndpointError::InvalidPath(key.to_string())),
            Some("") => Ok(()),
            Some(parent) => match nodes.get(parent) {
                Some(node) if !node.leaf => Ok(()),
                Some(_) => Err(EndpointError::InvalidPath(format!("{} is a leaf", parent))),
                None => Err(EndpointError::NotFound(parent.to_string())),
            },
        }
    }

    fn stamped(node: &Node, key: String) -> Node {
        let mut stored = node.clone();
        stored.path = key;
        if stored.metadata.modified.is_none() {
            stored.metadata.modified = Some(SystemTime::now());
        }
        stored
    }
}

impl Endpoint for MemoryEndpoint {
    fn create_node(&self, node: &Node, update_if_exists: bool) -> EndpointResult<()> {
        let key = normalize_path(&node.path);
        let event = {
            let mut nodes = self.nodes_mut();
            Self::check_parent(&nodes, &key)?;
            let existed = nodes.contains_key(&key);
            if existed && !update_if_exists {
                return Err(EndpointError::AlreadyExists(key));
            }
            nodes.insert(key.clone(), Self::stamped(node, key.clone()));
            if existed { Event::updated(key) } else { Event::created(key) }
        };
        self.publish(event);
        Ok(())
    }

    fn update_node(&self, node: &Node) -> EndpointResult<()> {
        let key = normalize_path(&node.path);
        {
            let mut nodes = self.nodes_mut();
            let slot = nodes.get_mut(&key).ok_or_else(|| EndpointError::NotFound(key.clone()))?;
            *slot = Self::stamped(node, key.clone());
        }
        self.publish(Event::updated(key));
        Ok(())
    }

    fn load_node(&self, path: &str, leaf_hint: Option<bool>) -> EndpointResult<Node> {
        let key = normalize_path(path);
        let nodes = self.nodes();
        match nodes.get(&key) {
            Some(node) if leaf_hint.map_or(true, |hint| hint == node.leaf) => Ok(node.clone()),
            _ => Err(EndpointError::NotFound(key)),
        }
    }

    fn delete_node(&self, path: &str) -> EndpointResult<()> {
        let key = normalize_path(path);
        {
            let mut nodes = self.nodes_mut();
            if nodes.remove(&key).is_none() {
                return Err(EndpointError::NotFound(key));
            }
            nodes.retain(|p, _| !is_within(&key, p));
        }
        self.publish(Event::deleted(key));
        Ok(())
    }

    fn move_node(&self, src: &str, dst: &str) -> EndpointResult<()> {
        let from = normalize_path(src);
        let to = normalize_path(dst);
        {
            let mut nodes = self.nodes_mut();
            if !nodes.contains_key(&from) {
                return Err(EndpointError::NotFound(from));
            }
            if nodes.contains_key(&to) {
                return Err(EndpointError::AlreadyExists(to));
            }
            if is_within(&from, &to) {
                return Err(EndpointError::InvalidPath(format!("cannot move {} into itself", from)));
            }
            Self::check_parent(&nodes, &to)?;

            let moved: Vec<String> = nodes.keys().filter(|p| is_within(&from, p)).cloned().collect();
            for old in moved {
                if let Some(mut node) = nodes.remove(&old) {
                    let new = format!("{}{}", to, &old[from.len()..]);
                    node.path = new.clone();
                    nodes.insert(new, node);
                }
            }
        }
        self.publish(Event::moved(from, to));
        Ok(())
    }
}

impl Watchable for MemoryEndpoint {
    fn watch(&self, root: &str) -> Result<WatchHandle, WatchError> {
        let root = normalize_path(root);
        if !self.contains(&root) {
            return Err(WatchError::Setup {
                root,
                reason: "no such branch".to_string(),
            });
        }
        let (sink, handle) = WatchSink::channel(());
        self.subscribers().push(Subscriber { root, sink });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKind;

    fn seeded() -> MemoryEndpoint {
        let endpoint = MemoryEndpoint::new();
        endpoint.create_node(&Node::branch("docs"), false).unwrap();
        endpoint.create_node(&Node::leaf("docs/a.txt"), false).unwrap();
        endpoint
    }

    #[test]
    fn test_crud_contract() {
        let endpoint = seeded();

        assert!(matches!(
            endpoint.create_node(&Node::leaf("docs/a.txt"), false),
            Err(EndpointError::AlreadyExists(_))
        ));
        assert!(endpoint.create_node(&Node::leaf("docs/a.txt").with_size(3), true).is_ok());
        assert_eq!(endpoint.load_node("/docs/a.txt", Some(true)).unwrap().metadata.size, Some(3));

        assert!(matches!(endpoint.update_node(&Node::leaf("docs/b.txt")), Err(EndpointError::NotFound(_))));
        assert!(matches!(endpoint.load_node("docs/a.txt", Some(false)), Err(EndpointError::NotFound(_))));
        assert!(matches!(endpoint.delete_node("docs/b.txt"), Err(EndpointError::NotFound(_))));
    }

    #[test]
    fn test_create_requires_parent_branch() {
        let endpoint = seeded();

        assert!(matches!(
            endpoint.create_node(&Node::leaf("missing/x.txt"), false),
            Err(EndpointError::NotFound(p)) if p == "missing"
        ));
        assert!(matches!(
            endpoint.create_node(&Node::leaf("docs/a.txt/x"), false),
            Err(EndpointError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_move_subtree() {
        let endpoint = seeded();
        endpoint.create_node(&Node::branch("docs/sub"), false).unwrap();
        endpoint.create_node(&Node::leaf("docs/sub/b.txt"), false).unwrap();

        endpoint.move_node("docs", "archive").unwrap();

        assert!(endpoint.contains("archive/sub/b.txt"));
        assert!(endpoint.contains("archive/a.txt"));
        assert!(!endpoint.contains("docs"));
        assert_eq!(endpoint.load_node("archive/a.txt", None).unwrap().path, "archive/a.txt");
        assert!(matches!(endpoint.move_node("docs", "x"), Err(EndpointError::NotFound(_))));
        assert!(matches!(endpoint.move_node("archive", "archive/inner"), Err(EndpointError::InvalidPath(_))));
    }

    #[test]
    fn test_delete_removes_children() {
        let endpoint = seeded();
        endpoint.delete_node("docs").unwrap();

        assert!(endpoint.is_empty());
    }

    #[tokio::test]
    async fn test_watch_receives_mutations_under_root() {
        let endpoint = seeded();
        endpoint.create_node(&Node::branch("other"), false).unwrap();
        let mut handle = endpoint.watch("docs").unwrap();

        endpoint.update_node(&Node::leaf("docs/a.txt")).unwrap();
        endpoint.create_node(&Node::leaf("other/x"), false).unwrap();
        endpoint.move_node("docs/a.txt", "other/a.txt").unwrap();

        let first = handle.events.recv().await.unwrap();
        assert_eq!(first.path, "docs/a.txt");
        assert_eq!(first.kind, EventKind::Updated);

        // The move leaves the root, so its source still concerns this watcher
        let second = handle.events.recv().await.unwrap();
        assert_eq!(second.source(), Some("docs/a.txt"));
        assert!(handle.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_inject_error_and_disconnect() {
        let endpoint = seeded();
        let mut handle = endpoint.watch("").unwrap();
        assert_eq!(endpoint.watcher_count(), 1);

        endpoint.inject_error(WatchError::Backend("lost".into()));
        assert!(matches!(handle.errors.recv().await, Some(WatchError::Backend(_))));

        endpoint.disconnect_watchers();
        assert!(handle.events.recv().await.is_none());
        assert_eq!(endpoint.watcher_count(), 0);
    }

    #[test]
    fn test_watch_unknown_root() {
        let endpoint = MemoryEndpoint::new();
        assert!(matches!(endpoint.watch("nope"), Err(WatchError::Setup { .. })));
    }

    #[test]
    fn test_dropped_handle_releases_watch() {
        let endpoint = seeded();
        let handle = endpoint.watch("docs").unwrap();
        assert_eq!(endpoint.watcher_count(), 1);

        drop(handle);
        assert_eq!(endpoint.watcher_count(), 0);
    }
}
