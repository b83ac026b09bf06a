//! Storage endpoint capabilities
//!
//! An [`Endpoint`] mutates and reads a hierarchical store by path. A
//! [`Watchable`] endpoint can also report changes under a root. The pipeline
//! works against [`Backend`], the combination of both.

pub mod ignore_rules;
pub mod local;
pub mod memory;

use std::any::Any;
use tokio::sync::mpsc;
use crate::core::{EndpointResult, Event, Node, WatchError};

pub use ignore_rules::IgnoreRules;
pub use local::LocalEndpoint;
pub use memory::MemoryEndpoint;

/// Synchronous node operations. Calls may block on backend I/O and are not
/// atomic across calls.
pub trait Endpoint: Send + Sync {
    /// Create `node`; fails with `AlreadyExists` unless `update_if_exists`.
    fn create_node(&self, node: &Node, update_if_exists: bool) -> EndpointResult<()>;

    /// Update an existing node; fails with `NotFound` if absent.
    fn update_node(&self, node: &Node) -> EndpointResult<()>;

    /// Load the node at `path`. `leaf_hint` lets backends skip a type lookup.
    fn load_node(&self, path: &str, leaf_hint: Option<bool>) -> EndpointResult<Node>;

    /// Delete the node at `path`; fails with `NotFound` if absent.
    fn delete_node(&self, path: &str) -> EndpointResult<()>;

    /// Move `src` to `dst`; fails with `NotFound` if `src` is absent.
    fn move_node(&self, src: &str, dst: &str) -> EndpointResult<()>;
}

/// Live change notifications for one root. Dropping the handle releases the
/// backend watch.
pub struct WatchHandle {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub errors: mpsc::UnboundedReceiver<WatchError>,
    _guard: Box<dyn Any + Send>,
}

impl WatchHandle {
    pub fn new<G: Any + Send>(
        events: mpsc::UnboundedReceiver<Event>,
        errors: mpsc::UnboundedReceiver<WatchError>,
        guard: G,
    ) -> Self {
        Self {
            events,
            errors,
            _guard: Box::new(guard),
        }
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").finish_non_exhaustive()
    }
}

/// Sending half of a watch, held by the backend side.
#[derive(Debug, Clone)]
pub struct WatchSink {
    events: mpsc::UnboundedSender<Event>,
    errors: mpsc::UnboundedSender<WatchError>,
}

impl WatchSink {
    /// Create a sink and the matching handle, keeping `guard` alive with it.
    pub fn channel<G: Any + Send>(guard: G) -> (Self, WatchHandle) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        (
            Self { events: event_tx, errors: error_tx },
            WatchHandle::new(event_rx, error_rx, guard),
        )
    }

    /// Returns false once the handle has been dropped.
    pub fn send_event(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    pub fn send_error(&self, error: WatchError) -> bool {
        self.errors.send(error).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Backends that can report changes under a root.
pub trait Watchable: Send + Sync {
    fn watch(&self, root: &str) -> Result<WatchHandle, WatchError>;
}

/// An endpoint the pipeline can both mutate and watch.
pub trait Backend: Endpoint + Watchable {}

impl<T: Endpoint + Watchable> Backend for T {}
