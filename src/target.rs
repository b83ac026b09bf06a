//! A watched root of one backend, served as a stream of filtered batches
//!
//! Serving a [`Target`] starts a supervised watcher and batcher plus three
//! plumbing tasks: events into the batcher, errors and worker transitions into
//! the health state, and filtered batches out to the consumer. One halt token
//! stops all of them.

use std::collections::VecDeque;
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::TreesyncConfig;
use crate::core::{normalize_path, Batch, Event, TargetError, WatchError};
use crate::endpoint::Backend;
use crate::pipeline::{Batcher, EventSender, Filter, Watcher, WatcherOutput};
use crate::supervisor::{RestartPolicy, Supervisor, SupervisorEvent, WorkerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetState {
    Created,
    Idle,
    Processing,
    /// A watch error surfaced; workers are being restarted
    Error(String),
    /// A worker exhausted its restart budget
    Failed(String),
    Stopped,
}

/// Observed condition of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetHealth {
    pub state: TargetState,
    pub connected: bool,
    pub paused: bool,
}

impl TargetHealth {
    pub fn is_error(&self) -> bool {
        matches!(self.state, TargetState::Error(_) | TargetState::Failed(_))
    }
}

type HealthTx = Arc<watch::Sender<TargetHealth>>;

/// Channel ends handed to the serving tasks.
struct Outlets {
    batches: mpsc::UnboundedSender<Batch>,
    errors: mpsc::UnboundedSender<TargetError>,
}

pub struct Target {
    root: String,
    config: TreesyncConfig,
    backend: Arc<dyn Backend>,
    filter: Arc<Filter>,
    halt: CancellationToken,
    outlets: Option<Outlets>,
    batches: Option<mpsc::UnboundedReceiver<Batch>>,
    errors: Option<mpsc::UnboundedReceiver<TargetError>>,
    health: HealthTx,
    paused: watch::Sender<bool>,
    supervisor: Option<Supervisor>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Target")
            .field("root", &self.root)
            .field("health", &*self.health.borrow())
            .field("supervisor", &self.supervisor)
            .finish_non_exhaustive()
    }
}

impl Target {
    pub fn new(backend: Arc<dyn Backend>, root: &str, config: &TreesyncConfig) -> Self {
        // Batches may close up to quiet + max age after the window ends
        let retention = config.filter.suppression_window_duration()
            + config.batcher.quiet_period_duration()
            + config.batcher.max_batch_age_duration();
        let filter = Filter::new(backend.clone(), &config.filter).with_retention(retention);

        let (batch_tx, batch_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (health, _) = watch::channel(TargetHealth {
            state: TargetState::Created,
            connected: false,
            paused: false,
        });
        let (paused, _) = watch::channel(false);

        Self {
            root: normalize_path(root),
            config: config.clone(),
            backend,
            filter: Arc::new(filter),
            halt: CancellationToken::new(),
            outlets: Some(Outlets { batches: batch_tx, errors: error_tx }),
            batches: Some(batch_rx),
            errors: Some(error_rx),
            health: Arc::new(health),
            paused,
            supervisor: None,
            tasks: Vec::new(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// The endpoint whose mutations are filtered out of this target's batches.
    pub fn endpoint(&self) -> Arc<Filter> {
        self.filter.clone()
    }

    /// Non-empty filtered batches, in close order. Ends when the target stops.
    /// Only the first call gets the stream.
    pub fn batches(&mut self) -> Option<mpsc::UnboundedReceiver<Batch>> {
        self.batches.take()
    }

    /// Structured watch and worker failures. Only the first call gets the stream.
    pub fn errors(&mut self) -> Option<mpsc::UnboundedReceiver<TargetError>> {
        self.errors.take()
    }

    pub fn health(&self) -> TargetHealth {
        self.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<TargetHealth> {
        self.health.subscribe()
    }

    /// Hold filtered batches until [`Target::resume`].
    pub fn pause(&self) {
        if !self.paused.send_replace(true) {
            tracing::info!("Target '{}' paused", self.root);
        }
        self.health.send_if_modified(|h| !std::mem::replace(&mut h.paused, true));
    }

    pub fn resume(&self) {
        if self.paused.send_replace(false) {
            tracing::info!("Target '{}' resumed", self.root);
        }
        self.health.send_if_modified(|h| std::mem::replace(&mut h.paused, false));
    }

    /// Start watching. Must be called inside a tokio runtime.
    pub fn serve(&mut self) -> Result<(), TargetError> {
        let outlets = self.outlets.take().ok_or(TargetError::AlreadyServing)?;

        let (watcher, WatcherOutput { events, errors }) = Watcher::new(self.backend.clone(), &self.root);
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (batcher, input) = Batcher::new(&self.config.batcher, raw_tx);

        let (mut supervisor, transitions) = Supervisor::new(
            &format!("target:{}", self.root),
            RestartPolicy::from(&self.config.supervisor),
            self.halt.clone(),
        );
        supervisor.add(Arc::new(watcher));
        supervisor.add(Arc::new(batcher));
        supervisor.serve();
        self.supervisor = Some(supervisor);

        self.health.send_modify(|h| {
            h.state = TargetState::Idle;
            h.connected = true;
        });
        tracing::info!("Target '{}' serving", self.root);

        self.tasks.push(tokio::spawn(forward_events(
            events,
            input,
            self.health.clone(),
            self.halt.clone(),
        )));
        self.tasks.push(tokio::spawn(observe_errors(
            self.root.clone(),
            errors,
            transitions,
            outlets.errors,
            self.health.clone(),
            self.halt.clone(),
        )));
        self.tasks.push(tokio::spawn(deliver(
            raw_rx,
            self.filter.clone(),
            outlets.batches,
            self.paused.subscribe(),
            self.health.clone(),
            self.halt.clone(),
        )));
        Ok(())
    }

    /// Halt every task and worker. Once this returns no further batch is
    /// delivered and the backend watch is released.
    pub async fn stop(mut self) {
        self.halt.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                tracing::warn!("Target '{}' task ended abnormally: {}", self.root, err);
            }
        }
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.stop().await;
        }
        self.health.send_modify(|h| {
            h.state = TargetState::Stopped;
            h.connected = false;
        });
        tracing::info!("Target '{}' stopped", self.root);
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        self.halt.cancel();
    }
}

async fn forward_events(
    mut events: mpsc::UnboundedReceiver<Event>,
    input: EventSender,
    health: HealthTx,
    halt: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = halt.cancelled() => break,
            received = events.recv() => {
                let Some(event) = received else { break };
                health.send_if_modified(|h| {
                    if h.state == TargetState::Idle {
                        h.state = TargetState::Processing;
                        true
                    } else {
                        false
                    }
                });
                if input.send(event).is_err() {
                    break;
                }
            }
        }
    }
}

async fn observe_errors(
    root: String,
    mut watch_errors: mpsc::UnboundedReceiver<WatchError>,
    mut transitions: mpsc::UnboundedReceiver<SupervisorEvent>,
    errors: mpsc::UnboundedSender<TargetError>,
    health: HealthTx,
    halt: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = halt.cancelled() => break,
            Some(err) = watch_errors.recv() => {
                health.send_if_modified(|h| {
                    if matches!(h.state, TargetState::Failed(_)) {
                        return false;
                    }
                    h.state = TargetState::Error(err.to_string());
                    true
                });
                let _ = errors.send(TargetError::Watch { root: root.clone(), source: err });
            }
            Some(transition) = transitions.recv() => match transition.state {
                WorkerState::Running if transition.restarts > 0 => {
                    health.send_if_modified(|h| {
                        if matches!(h.state, TargetState::Error(_)) {
                            h.state = TargetState::Idle;
                            h.connected = true;
                            true
                        } else {
                            false
                        }
                    });
                }
                WorkerState::Failed(reason) => {
                    health.send_modify(|h| {
                        h.state = TargetState::Failed(reason.clone());
                        h.connected = false;
                    });
                    let _ = errors.send(TargetError::WorkerFailed {
                        root: root.clone(),
                        worker: transition.worker,
                        restarts: transition.restarts,
                        reason,
                    });
                }
                _ => {}
            },
            else => break,
        }
    }
}

async fn deliver(
    mut raw: mpsc::UnboundedReceiver<Batch>,
    filter: Arc<Filter>,
    batches: mpsc::UnboundedSender<Batch>,
    mut paused: watch::Receiver<bool>,
    health: HealthTx,
    halt: CancellationToken,
) {
    let mut held: VecDeque<Batch> = VecDeque::new();

    loop {
        if !*paused.borrow_and_update() {
            while let Some(batch) = held.pop_front() {
                if batches.send(batch).is_err() {
                    tracing::debug!("Batch consumer gone");
                    return;
                }
            }
        }

        tokio::select! {
            biased;

            _ = halt.cancelled() => {
                if !held.is_empty() {
                    tracing::debug!("Dropping {} held batches on halt", held.len());
                }
                break;
            }
            changed = paused.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            received = raw.recv() => {
                let Some(batch) = received else { break };
                let batch = filter.apply(batch);
                health.send_if_modified(|h| {
                    if h.state == TargetState::Processing {
                        h.state = TargetState::Idle;
                        true
                    } else {
                        false
                    }
                });
                if !batch.is_empty() {
                    held.push_back(batch);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::core::Node;
    use crate::endpoint::{Endpoint, MemoryEndpoint};

    fn memory_target() -> (MemoryEndpoint, Target) {
        let endpoint = MemoryEndpoint::new();
        endpoint.create_node(&Node::branch("docs"), false).unwrap();
        let target = Target::new(Arc::new(endpoint.clone()), "docs", &TreesyncConfig::default());
        (endpoint, target)
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_twice_is_rejected() {
        let (_endpoint, mut target) = memory_target();
        assert_eq!(target.health().state, TargetState::Created);

        target.serve().unwrap();
        assert!(matches!(target.serve(), Err(TargetError::AlreadyServing)));
        assert_eq!(target.health().state, TargetState::Idle);
        assert!(target.health().connected);

        target.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_are_single_take() {
        let (_endpoint, mut target) = memory_target();
        assert!(target.batches().is_some());
        assert!(target.batches().is_none());
        assert!(target.errors().is_some());
        assert!(target.errors().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_own_writes_are_filtered() {
        let (endpoint, mut target) = memory_target();
        let mut batches = target.batches().unwrap();
        target.serve().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        target.endpoint().create_node(&Node::leaf("docs/mine.txt"), false).unwrap();
        endpoint.create_node(&Node::leaf("docs/theirs.txt"), false).unwrap();

        let batch = batches.recv().await.unwrap();
        let paths: Vec<&str> = batch.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["docs/theirs.txt"]);

        target.stop().await;
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_holds_batches() {
        let (endpoint, mut target) = memory_target();
        let mut batches = target.batches().unwrap();
        target.serve().unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        target.pause();
        assert!(target.health().paused);
        endpoint.create_node(&Node::leaf("docs/a"), false).unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(batches.try_recv().is_err());

        target.resume();
        let batch = batches.recv().await.unwrap();
        assert_eq!(batch[0].path, "docs/a");
        assert!(!target.health().paused);

        target.stop().await;
    }
}
