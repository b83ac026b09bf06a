pub mod cli;
pub mod config;
pub mod core;
pub mod endpoint;
pub mod pipeline;
pub mod supervisor;
pub mod target;
pub mod task;

pub use config::*;
pub use crate::core::*;
pub use endpoint::{Backend, Endpoint, LocalEndpoint, MemoryEndpoint, Watchable, WatchHandle};
pub use pipeline::{Filter, SuppressionSet};
pub use supervisor::{RestartPolicy, Supervisor, SupervisorEvent, Worker, WorkerState};
pub use target::{Target, TargetHealth, TargetState};
pub use task::{Command, Side, SyncTask, SyncTaskHandle, TaskErrorNotice, TaskOutput, TaskState, TaskStatus};
