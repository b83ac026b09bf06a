//! Status and command boundary for a pair of synced roots
//!
//! A [`SyncTask`] serves a left and a right [`Target`], merges their batches
//! into one output stream tagged by side, and publishes a status snapshot
//! whenever either side's health changes or an error surfaces.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use crate::core::{Batch, TargetError};
use crate::pipeline::Filter;
use crate::target::{Target, TargetHealth, TargetState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Idle,
    Processing,
    Paused,
    Disabled,
    Error,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Idle => "idle",
            TaskState::Processing => "processing",
            TaskState::Paused => "paused",
            TaskState::Disabled => "disabled",
            TaskState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Snapshot of a task as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub label: String,
    pub state: TaskState,
    pub left_connected: bool,
    pub right_connected: bool,
    pub updated_at: DateTime<Utc>,
}

impl TaskStatus {
    fn same_as(&self, other: &TaskStatus) -> bool {
        self.state == other.state
            && self.left_connected == other.left_connected
            && self.right_connected == other.right_connected
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    ResyncAll,
    Halt,
    Pause,
    Resume,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown command: {0}")]
pub struct UnknownCommand(pub String);

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "resync" | "resync-all" | "resyncall" => Ok(Command::ResyncAll),
            "halt" | "stop" | "quit" => Ok(Command::Halt),
            "pause" => Ok(Command::Pause),
            "resume" => Ok(Command::Resume),
            other => Err(UnknownCommand(other.to_string())),
        }
    }
}

/// What the reconciliation layer receives from a task.
#[derive(Debug, Clone)]
pub enum TaskOutput {
    Batch { side: Side, batch: Batch },
    /// Full comparison of both sides requested
    Resync,
}

/// Structured error notification.
#[derive(Debug, Clone, Serialize)]
pub struct TaskErrorNotice {
    pub task_id: String,
    pub side: Side,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Two targets waiting to be served together.
pub struct SyncTask {
    id: String,
    label: String,
    left: Target,
    right: Target,
}

impl SyncTask {
    pub fn new(id: impl Into<String>, label: impl Into<String>, left: Target, right: Target) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            left,
            right,
        }
    }

    /// Serve both targets and start the control loop. Must be called inside a
    /// tokio runtime.
    pub fn spawn(self) -> Result<SyncTaskHandle, TargetError> {
        let SyncTask { id, label, mut left, mut right } = self;

        let left_side = SideChannels::take(&mut left)?;
        let right_side = SideChannels::take(&mut right)?;
        left.serve()?;
        right.serve()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (error_tx, _) = broadcast::channel(64);

        let initial = TaskStatus {
            task_id: id.clone(),
            label: label.clone(),
            state: TaskState::Idle,
            left_connected: left.health().connected,
            right_connected: right.health().connected,
            updated_at: Utc::now(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let left_endpoint = left.endpoint();
        let right_endpoint = right.endpoint();
        tracing::info!("Task '{}' ({}) started", label, id);

        let control = Control {
            id,
            label,
            left,
            right,
            paused: false,
            status: status_tx,
            errors: error_tx.clone(),
            outputs: output_tx,
        };
        let join = tokio::spawn(control.run(command_rx, left_side, right_side));

        Ok(SyncTaskHandle {
            commands: command_tx,
            status: status_rx,
            errors: error_tx,
            outputs: Some(output_rx),
            left_endpoint,
            right_endpoint,
            join,
        })
    }
}

struct SideChannels {
    batches: mpsc::UnboundedReceiver<Batch>,
    errors: mpsc::UnboundedReceiver<TargetError>,
    health: watch::Receiver<TargetHealth>,
}

impl SideChannels {
    fn take(target: &mut Target) -> Result<Self, TargetError> {
        match (target.batches(), target.errors()) {
            (Some(batches), Some(errors)) => Ok(Self {
                batches,
                errors,
                health: target.subscribe_health(),
            }),
            _ => Err(TargetError::AlreadyServing),
        }
    }
}

struct Control {
    id: String,
    label: String,
    left: Target,
    right: Target,
    paused: bool,
    status: watch::Sender<TaskStatus>,
    errors: broadcast::Sender<TaskErrorNotice>,
    outputs: mpsc::UnboundedSender<TaskOutput>,
}

impl Control {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut left: SideChannels,
        mut right: SideChannels,
    ) {
        loop {
            let mut force = false;

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Halt) | None => break,
                    Some(command) => self.execute(command),
                },
                Some(err) = left.errors.recv() => {
                    self.notify(Side::Left, err);
                    force = true;
                }
                Some(err) = right.errors.recv() => {
                    self.notify(Side::Right, err);
                    force = true;
                }
                Ok(()) = left.health.changed() => {}
                Ok(()) = right.health.changed() => {}
                Some(batch) = left.batches.recv() => self.emit(TaskOutput::Batch { side: Side::Left, batch }),
                Some(batch) = right.batches.recv() => self.emit(TaskOutput::Batch { side: Side::Right, batch }),
            }

            self.publish(force);
        }

        tracing::info!("Task '{}' halting", self.label);
        let Control { left: left_target, right: right_target, status, .. } = self;
        left_target.stop().await;
        right_target.stop().await;
        status.send_modify(|s| {
            s.state = TaskState::Disabled;
            s.left_connected = false;
            s.right_connected = false;
            s.updated_at = Utc::now();
        });
    }

    fn execute(&mut self, command: Command) {
        tracing::debug!("Task '{}' command {:?}", self.label, command);
        match command {
            Command::Pause => {
                self.paused = true;
                self.left.pause();
                self.right.pause();
            }
            Command::Resume => {
                self.paused = false;
                self.left.resume();
                self.right.resume();
            }
            Command::ResyncAll => self.emit(TaskOutput::Resync),
            Command::Halt => {}
        }
    }

    fn emit(&self, output: TaskOutput) {
        if self.outputs.send(output).is_err() {
            tracing::debug!("Task '{}' output consumer gone", self.label);
        }
    }

    fn notify(&self, side: Side, err: TargetError) {
        tracing::warn!("Task '{}' {} side error: {}", self.label, side, err);
        let _ = self.errors.send(TaskErrorNotice {
            task_id: self.id.clone(),
            side,
            message: err.to_string(),
            at: Utc::now(),
        });
    }

    fn snapshot(&self) -> TaskStatus {
        let left = self.left.health();
        let right = self.right.health();
        let state = if left.is_error() || right.is_error() {
            TaskState::Error
        } else if self.paused {
            TaskState::Paused
        } else if [&left, &right].iter().any(|h| h.state == TargetState::Processing) {
            TaskState::Processing
        } else {
            TaskState::Idle
        };

        TaskStatus {
            task_id: self.id.clone(),
            label: self.label.clone(),
            state,
            left_connected: left.connected,
            right_connected: right.connected,
            updated_at: Utc::now(),
        }
    }

    /// Publish when the status changed, or unconditionally with `force`.
    fn publish(&self, force: bool) {
        let next = self.snapshot();
        self.status.send_if_modified(|current| {
            if force || !current.same_as(&next) {
                tracing::debug!("Task '{}' status {}", self.label, next.state);
                *current = next;
                true
            } else {
                false
            }
        });
    }
}

/// Control surface of a running [`SyncTask`].
pub struct SyncTaskHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TaskStatus>,
    errors: broadcast::Sender<TaskErrorNotice>,
    outputs: Option<mpsc::UnboundedReceiver<TaskOutput>>,
    left_endpoint: Arc<Filter>,
    right_endpoint: Arc<Filter>,
    join: JoinHandle<()>,
}

impl SyncTaskHandle {
    /// Returns false once the task has ended.
    pub fn send(&self, command: Command) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<Command> {
        self.commands.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<TaskStatus> {
        self.status.clone()
    }

    pub fn subscribe_errors(&self) -> broadcast::Receiver<TaskErrorNotice> {
        self.errors.subscribe()
    }

    /// Merged output of both sides. Only the first call gets the stream.
    pub fn outputs(&mut self) -> Option<mpsc::UnboundedReceiver<TaskOutput>> {
        self.outputs.take()
    }

    /// The filtering endpoint for `side`; writes through it are not echoed back.
    pub fn endpoint(&self, side: Side) -> Arc<Filter> {
        match side {
            Side::Left => self.left_endpoint.clone(),
            Side::Right => self.right_endpoint.clone(),
        }
    }

    /// Wait for the control loop to finish after `Halt`.
    pub async fn wait(self) {
        if let Err(err) = self.join.await {
            tracing::warn!("Task control loop ended abnormally: {}", err);
        }
    }
}
