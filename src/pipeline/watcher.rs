use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use crate::core::{normalize_path, Event, WatchError, WorkerError};
use crate::endpoint::Backend;
use crate::supervisor::{Worker, WorkerFuture};

/// Receiving side of a [`Watcher`]: raw events and watch failures.
#[derive(Debug)]
pub struct WatcherOutput {
    pub events: mpsc::UnboundedReceiver<Event>,
    pub errors: mpsc::UnboundedReceiver<WatchError>,
}

/// Observes one root of a backend and republishes its notifications.
///
/// Each run opens a fresh backend watch. Any watch failure is published on the
/// error stream and ends the run with an error, leaving the restart decision to
/// the supervisor.
pub struct Watcher {
    backend: Arc<dyn Backend>,
    root: String,
    events: mpsc::UnboundedSender<Event>,
    errors: mpsc::UnboundedSender<WatchError>,
}

impl Watcher {
    pub fn new(backend: Arc<dyn Backend>, root: &str) -> (Self, WatcherOutput) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            backend,
            root: normalize_path(root),
            events: event_tx,
            errors: error_tx,
        };
        (watcher, WatcherOutput { events: event_rx, errors: error_rx })
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    async fn observe(&self, halt: CancellationToken) -> Result<(), WorkerError> {
        let mut handle = match self.backend.watch(&self.root) {
            Ok(handle) => handle,
            Err(err) => return Err(self.fail(err)),
        };
        tracing::info!("Watching root '{}'", self.root);

        loop {
            tokio::select! {
                biased;

                _ = halt.cancelled() => {
                    tracing::debug!("Watcher on '{}' halted", self.root);
                    return Ok(());
                }
                received = handle.events.recv() => match received {
                    Some(event) => {
                        if self.events.send(event).is_err() {
                            return Ok(()); // Receiver dropped, exit
                        }
                    }
                    None => return Err(self.fail(WatchError::Disconnected)),
                },
                failure = handle.errors.recv() => {
                    return Err(self.fail(failure.unwrap_or(WatchError::Disconnected)));
                }
            }
        }
    }

    /// Publish a watch failure so it is never lost, then turn it into the run's error.
    fn fail(&self, err: WatchError) -> WorkerError {
        tracing::error!("Watch on '{}' failed: {}", self.root, err);
        let _ = self.errors.send(err.clone());
        WorkerError::Watch(err)
    }
}

impl Worker for Watcher {
    fn name(&self) -> &str {
        "watcher"
    }

    fn run(self: Arc<Self>, halt: CancellationToken) -> WorkerFuture {
        Box::pin(async move { self.observe(halt).await })
    }
}
