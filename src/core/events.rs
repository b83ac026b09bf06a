use std::time::SystemTime;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use super::node::normalize_path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// `path` of the event is the destination
    Moved { from: String },
}

/// One observed change under a watched root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub path: String,
    pub kind: EventKind,
    pub timestamp: SystemTime,
    /// Monotonic instant the change was observed, used for echo matching
    #[serde(skip, default = "Instant::now")]
    pub observed_at: Instant,
}

/// An ordered group of events from one coalescing window.
pub type Batch = Vec<Event>;

impl Event {
    pub fn new<P: AsRef<str>>(path: P, kind: EventKind) -> Self {
        let kind = match kind {
            EventKind::Moved { from } => EventKind::Moved { from: normalize_path(&from) },
            other => other,
        };
        Self {
            path: normalize_path(path.as_ref()),
            kind,
            timestamp: SystemTime::now(),
            observed_at: Instant::now(),
        }
    }

    pub fn created<P: AsRef<str>>(path: P) -> Self {
        Self::new(path, EventKind::Created)
    }

    pub fn updated<P: AsRef<str>>(path: P) -> Self {
        Self::new(path, EventKind::Updated)
    }

    pub fn deleted<P: AsRef<str>>(path: P) -> Self {
        Self::new(path, EventKind::Deleted)
    }

    pub fn moved<S: AsRef<str>, D: AsRef<str>>(from: S, to: D) -> Self {
        Self::new(to, EventKind::Moved { from: from.as_ref().to_string() })
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_observed_at(mut self, observed_at: Instant) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Source path of a move, if any.
    pub fn source(&self) -> Option<&str> {
        match &self.kind {
            EventKind::Moved { from } => Some(from),
            _ => None,
        }
    }

    /// Every path this event touches: the destination first, then a move source.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.source())
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            EventKind::Created => "CREATED",
            EventKind::Updated => "UPDATED",
            EventKind::Deleted => "DELETED",
            EventKind::Moved { .. } => "MOVED",
        }
    }
}

/// Per-kind counts for one batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub moved: usize,
}

impl BatchStats {
    pub fn of(batch: &[Event]) -> Self {
        let mut stats = Self::default();
        for event in batch {
            match event.kind {
                EventKind::Created => stats.created += 1,
                EventKind::Updated => stats.updated += 1,
                EventKind::Deleted => stats.deleted += 1,
                EventKind::Moved { .. } => stats.moved += 1,
            }
        }
        stats
    }

    pub fn total(&self) -> usize {
        self.created + self.updated + self.deleted + self.moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation_normalizes_path() {
        let event = Event::created("/docs/a.txt");

        assert_eq!(event.path, "docs/a.txt");
        assert_eq!(event.kind, EventKind::Created);
        assert!(event.source().is_none());
    }

    #[test]
    fn test_move_event_paths() {
        let event = Event::moved("/docs/old.txt", "docs/new.txt");

        assert_eq!(event.path, "docs/new.txt");
        assert_eq!(event.source(), Some("docs/old.txt"));
        assert_eq!(event.paths().collect::<Vec<_>>(), vec!["docs/new.txt", "docs/old.txt"]);
        assert_eq!(event.label(), "MOVED");
    }

    #[test]
    fn test_batch_stats() {
        let batch = vec![
            Event::created("a"),
            Event::updated("a"),
            Event::updated("b"),
            Event::deleted("c"),
            Event::moved("d", "e"),
        ];
        let stats = BatchStats::of(&batch);

        assert_eq!(stats.created, 1);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.deleted, 1);
        assert_eq!(stats.moved, 1);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn test_event_serializes_without_instant() {
        let event = Event::moved("a", "b");
        let json = serde_json::to_string(&event).unwrap();

        assert!(json.contains("\"path\":\"b\""));
        assert!(json.contains("Moved"));
        assert!(!json.contains("observed_at"));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, EventKind::Moved { from: "a".to_string() });
    }
}
