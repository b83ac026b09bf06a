//! Self-echo suppression
//!
//! Every mutating call made through a [`Filter`] marks the touched paths as
//! suppressed for a fixed window. Batches pass through [`Filter::apply`]
//! before delivery, which drops events for suppressed paths so the sync engine
//! never re-processes its own writes.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use tokio::time::Instant;
use crate::config::FilterConfig;
use crate::core::{normalize_path, parent_path, Batch, EndpointResult, Event, Node};
use crate::endpoint::{Backend, Endpoint};

#[derive(Debug, Clone, Copy)]
struct Window {
    registered: Instant,
    deadline: Instant,
    /// Also covers every path below the registered one
    subtree: bool,
}

impl Window {
    fn active(&self, now: Instant) -> bool {
        now < self.deadline
    }

    fn covers(&self, at: Instant) -> bool {
        self.registered <= at && at < self.deadline
    }
}

/// Concurrent set of paths presumed self-caused.
///
/// An entry is active from the first `add` until its deadline; adding it again
/// while active changes nothing. Each path keeps every window opened within
/// `retention`, so events observed during any of them can still be matched
/// when their batch closes late, even if the path was written again since.
#[derive(Debug, Clone)]
pub struct SuppressionSet {
    entries: Arc<DashMap<String, VecDeque<Window>>>,
    window: Duration,
    retention: Duration,
}

impl SuppressionSet {
    pub fn new(window: Duration) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            window,
            retention: window,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Suppress `path`. Returns false if it was already suppressed.
    pub fn add(&self, path: &str) -> bool {
        self.open(path, false)
    }

    /// Suppress `path` and everything below it. Returns false if that was
    /// already the case.
    pub fn add_tree(&self, path: &str) -> bool {
        self.open(path, true)
    }

    fn open(&self, path: &str, subtree: bool) -> bool {
        let now = Instant::now();
        let added = {
            let mut windows = self.entries.entry(normalize_path(path)).or_default();
            let covered = windows
                .iter()
                .any(|w| w.active(now) && (w.subtree || !subtree));
            if !covered {
                windows.push_back(Window {
                    registered: now,
                    deadline: now + self.window,
                    subtree,
                });
            }
            !covered
        };
        self.purge_expired();
        added
    }

    /// Whether `path` is suppressed right now.
    pub fn contains(&self, path: &str) -> bool {
        let now = Instant::now();
        self.any_window(path, |w| w.active(now))
    }

    /// Whether a suppression window for `path` was open at instant `at`.
    pub fn covers(&self, path: &str, at: Instant) -> bool {
        self.any_window(path, |w| w.covers(at))
    }

    /// Whether any path touched by `event` is suppressed now, or was when the
    /// event was observed.
    pub fn matches(&self, event: &Event) -> bool {
        event
            .paths()
            .any(|path| self.contains(path) || self.covers(path, event.observed_at))
    }

    /// Windows registered on `path` itself, or subtree windows on an ancestor.
    fn any_window(&self, path: &str, wanted: impl Fn(&Window) -> bool) -> bool {
        let key = normalize_path(path);
        if self.entries.get(&key).is_some_and(|ws| ws.iter().any(&wanted)) {
            return true;
        }
        let mut current = key.as_str();
        while let Some(parent) = parent_path(current) {
            if self
                .entries
                .get(parent)
                .is_some_and(|ws| ws.iter().any(|w| w.subtree && wanted(w)))
            {
                return true;
            }
            current = parent;
        }
        false
    }

    pub fn remove(&self, path: &str) -> bool {
        self.entries.remove(&normalize_path(path)).is_some()
    }

    /// Drop windows past their retention. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut dropped = 0;
        self.entries.retain(|_, windows| {
            let before = windows.len();
            windows.retain(|w| w.deadline + self.retention > now);
            dropped += before - windows.len();
            !windows.is_empty()
        });
        dropped
    }

    /// Number of paths with an active window.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|ws| ws.iter().any(|w| w.active(now)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_paths(&self) -> Vec<String> {
        let now = Instant::now();
        let mut paths: Vec<String> = self
            .entries
            .iter()
            .filter(|ws| ws.iter().any(|w| w.active(now)))
            .map(|ws| ws.key().clone())
            .collect();
        paths.sort();
        paths
    }
}

/// Endpoint wrapper that records its own mutations and filters their echoes
/// out of batches.
pub struct Filter {
    endpoint: Arc<dyn Backend>,
    suppression: SuppressionSet,
    suppress_loads: bool,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("suppression", &self.suppression)
            .field("suppress_loads", &self.suppress_loads)
            .finish_non_exhaustive()
    }
}

impl Filter {
    pub fn new(endpoint: Arc<dyn Backend>, config: &FilterConfig) -> Self {
        Self {
            endpoint,
            suppression: SuppressionSet::new(config.suppression_window_duration()),
            suppress_loads: config.suppress_loads,
        }
    }

    /// Keep expired windows around for `retention` when matching late batches.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.suppression = self.suppression.with_retention(retention);
        self
    }

    pub fn suppression(&self) -> &SuppressionSet {
        &self.suppression
    }

    /// The wrapped endpoint, bypassing suppression.
    pub fn inner(&self) -> &Arc<dyn Backend> {
        &self.endpoint
    }

    /// Remove self-caused events from `batch`, preserving order.
    pub fn apply(&self, batch: Batch) -> Batch {
        let total = batch.len();
        let filtered: Batch = batch
            .into_iter()
            .filter(|event| {
                let echo = self.suppression.matches(event);
                if echo {
                    tracing::trace!("Dropping echo event {} {}", event.label(), event.path);
                }
                !echo
            })
            .collect();

        if filtered.len() < total {
            tracing::debug!("Suppressed {} of {} events", total - filtered.len(), total);
        }
        self.suppression.purge_expired();
        filtered
    }

    fn suppress(&self, path: &str) {
        if self.suppression.add(path) {
            tracing::trace!("Suppressing {} for {:?}", normalize_path(path), self.suppression.window());
        }
    }

    /// Deletes and moves touch every node below `path` as well.
    fn suppress_tree(&self, path: &str) {
        if self.suppression.add_tree(path) {
            tracing::trace!("Suppressing tree {} for {:?}", normalize_path(path), self.suppression.window());
        }
    }
}

impl Endpoint for Filter {
    fn create_node(&self, node: &Node, update_if_exists: bool) -> EndpointResult<()> {
        self.suppress(&node.path);
        self.endpoint.create_node(node, update_if_exists)
    }

    fn update_node(&self, node: &Node) -> EndpointResult<()> {
        self.suppress(&node.path);
        self.endpoint.update_node(node)
    }

    fn load_node(&self, path: &str, leaf_hint: Option<bool>) -> EndpointResult<Node> {
        if self.suppress_loads {
            self.suppress(path);
        }
        self.endpoint.load_node(path, leaf_hint)
    }

    fn delete_node(&self, path: &str) -> EndpointResult<()> {
        self.suppress_tree(path);
        self.endpoint.delete_node(path)
    }

    fn move_node(&self, src: &str, dst: &str) -> EndpointResult<()> {
        self.suppress_tree(src);
        self.suppress_tree(dst);
        self.endpoint.move_node(src, dst)
    }
}
