//! Restart-on-failure supervision for long-lived workers
//!
//! Each worker gets a monitor task that launches it, waits for it to end, and
//! decides what happens next:
//!
//! ```text
//! Starting -> Running -> (halted) ---------------------------> Stopped
//!                |
//!                +-> Crashed -> Restarting -> Running ...
//!                       |
//!                       +-> (too many crashes in window) -> Failed
//! ```
//!
//! A crash is any return while not halted: an error, a plain `Ok(())`, or a
//! panic. Transitions are published as [`SupervisorEvent`]s.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::SupervisorConfig;
use crate::core::WorkerError;

pub type WorkerFuture = Pin<Box<dyn Future<Output = Result<(), WorkerError>> + Send + 'static>>;

/// A restartable unit of work. `run` is called again after every crash, so any
/// state that must survive a restart lives in `self`.
pub trait Worker: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Run until `halt` is cancelled.
    fn run(self: Arc<Self>, halt: CancellationToken) -> WorkerFuture;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    Starting,
    Running,
    Crashed(String),
    Restarting,
    Stopped,
    Failed(String),
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorEvent {
    pub worker: String,
    pub state: WorkerState,
    /// Restarts performed so far for this worker
    pub restarts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartPolicy {
    pub max_restarts: usize,
    pub window: Duration,
    pub backoff: Duration,
}

impl From<&SupervisorConfig> for RestartPolicy {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_restarts: config.max_restarts,
            window: config.restart_window_duration(),
            backoff: config.backoff_duration(),
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::from(&SupervisorConfig::default())
    }
}

#[derive(Clone)]
struct Reporter {
    supervisor: Arc<str>,
    worker: String,
    states: Arc<Mutex<HashMap<String, WorkerState>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
}

impl Reporter {
    fn report(&self, state: WorkerState, restarts: usize) {
        match &state {
            WorkerState::Crashed(reason) => {
                tracing::warn!("[{}] {} crashed: {}", self.supervisor, self.worker, reason)
            }
            WorkerState::Failed(reason) => tracing::error!(
                "[{}] {} failed after {} restarts: {}",
                self.supervisor,
                self.worker,
                restarts,
                reason
            ),
            other => tracing::debug!("[{}] {} -> {:?}", self.supervisor, self.worker, other),
        }

        if let Ok(mut states) = self.states.lock() {
            states.insert(self.worker.clone(), state.clone());
        }
        let _ = self.events.send(SupervisorEvent {
            worker: self.worker.clone(),
            state,
            restarts,
        });
    }
}

/// Runs a set of workers, restarting them under a [`RestartPolicy`].
pub struct Supervisor {
    name: Arc<str>,
    policy: RestartPolicy,
    workers: Vec<Arc<dyn Worker>>,
    states: Arc<Mutex<HashMap<String, WorkerState>>>,
    event_tx: mpsc::UnboundedSender<SupervisorEvent>,
    halt: CancellationToken,
    monitors: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("workers", &self.workers.iter().map(|w| w.name().to_string()).collect::<Vec<_>>())
            .field("serving", &!self.monitors.is_empty())
            .finish()
    }
}

impl Supervisor {
    /// Returns the supervisor with the stream of its workers' state
    /// transitions.
    pub fn new(
        name: &str,
        policy: RestartPolicy,
        halt: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let supervisor = Self {
            name: Arc::from(name),
            policy,
            workers: Vec::new(),
            states: Arc::new(Mutex::new(HashMap::new())),
            event_tx,
            halt,
            monitors: Vec::new(),
        };
        (supervisor, event_rx)
    }

    pub fn add(&mut self, worker: Arc<dyn Worker>) {
        if let Ok(mut states) = self.states.lock() {
            states.insert(worker.name().to_string(), WorkerState::Starting);
        }
        self.workers.push(worker);
    }

    pub fn state(&self, worker: &str) -> Option<WorkerState> {
        self.states.lock().ok()?.get(worker).cloned()
    }

    /// Launch a monitor per worker. Must be called inside a tokio runtime.
    pub fn serve(&mut self) {
        tracing::info!("[{}] starting {} workers", self.name, self.workers.len());
        for worker in &self.workers {
            let reporter = Reporter {
                supervisor: self.name.clone(),
                worker: worker.name().to_string(),
                states: self.states.clone(),
                events: self.event_tx.clone(),
            };
            let monitor = monitor(worker.clone(), self.policy.clone(), self.halt.clone(), reporter);
            self.monitors.push(tokio::spawn(monitor));
        }
    }

    /// Halt every worker and wait for the monitors to finish.
    pub async fn stop(self) {
        self.halt.cancel();
        for monitor in self.monitors {
            if let Err(err) = monitor.await {
                tracing::warn!("[{}] monitor ended abnormally: {}", self.name, err);
            }
        }
        tracing::info!("[{}] stopped", self.name);
    }
}

async fn monitor(worker: Arc<dyn Worker>, policy: RestartPolicy, halt: CancellationToken, reporter: Reporter) {
    let mut crashes: VecDeque<Instant> = VecDeque::new();
    let mut restarts = 0;

    loop {
        reporter.report(WorkerState::Running, restarts);
        let outcome = tokio::spawn(worker.clone().run(halt.clone())).await;

        if halt.is_cancelled() {
            reporter.report(WorkerState::Stopped, restarts);
            return;
        }

        let reason = crash_reason(outcome).to_string();
        reporter.report(WorkerState::Crashed(reason.clone()), restarts);

        let now = Instant::now();
        crashes.push_back(now);
        while crashes.front().is_some_and(|at| now.duration_since(*at) > policy.window) {
            crashes.pop_front();
        }
        if crashes.len() > policy.max_restarts {
            reporter.report(WorkerState::Failed(reason), restarts);
            return;
        }

        reporter.report(WorkerState::Restarting, restarts);
        tokio::select! {
            _ = halt.cancelled() => {
                reporter.report(WorkerState::Stopped, restarts);
                return;
            }
            _ = tokio::time::sleep(policy.backoff) => {}
        }
        restarts += 1;
    }
}

fn crash_reason(outcome: Result<Result<(), WorkerError>, JoinError>) -> WorkerError {
    match outcome {
        Ok(Ok(())) => WorkerError::Exited,
        Ok(Err(err)) => err,
        Err(join) if join.is_panic() => {
            let payload = join.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            WorkerError::Panicked(message)
        }
        Err(join) => WorkerError::Panicked(join.to_string()),
    }
}
