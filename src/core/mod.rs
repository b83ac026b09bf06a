//! Core data model
//!
//! Nodes, change events, batches, and the error taxonomy shared by every stage

pub mod error;
pub mod events;
pub mod node;

// Re-export main types
pub use error::{EndpointError, EndpointResult, TargetError, WatchError, WorkerError};
pub use events::{Batch, BatchStats, Event, EventKind};
pub use node::{is_within, normalize_path, parent_path, Node, NodeMetadata};
