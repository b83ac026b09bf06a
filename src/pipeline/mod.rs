//! Change pipeline stages
//!
//! Raw backend notifications flow Watcher -> Batcher -> Filter before a
//! consumer ever sees them.

pub mod batcher;
pub mod filter;
pub mod watcher;

pub use batcher::{Batcher, EventSender};
pub use filter::{Filter, SuppressionSet};
pub use watcher::{Watcher, WatcherOutput};
