use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::BatcherConfig;
use crate::core::{Batch, BatchStats, Event, WorkerError};
use crate::supervisor::{Worker, WorkerFuture};

/// Sending half used to hand events to a [`Batcher`].
pub type EventSender = mpsc::UnboundedSender<Event>;

/// State that outlives a single run so a restarted batcher resumes the open batch.
struct BatcherState {
    input: mpsc::UnboundedReceiver<Event>,
    pending: Batch,
    opened_at: Option<Instant>,
    last_event_at: Option<Instant>,
}

impl BatcherState {
    fn push(&mut self, event: Event) {
        let now = Instant::now();
        self.opened_at.get_or_insert(now);
        self.last_event_at = Some(now);
        self.pending.push(event);
    }

    fn deadline(&self, quiet: Duration, max_age: Duration) -> Option<Instant> {
        let opened = self.opened_at?;
        let last = self.last_event_at.unwrap_or(opened);
        Some((last + quiet).min(opened + max_age))
    }

    fn take(&mut self) -> Batch {
        self.opened_at = None;
        self.last_event_at = None;
        std::mem::take(&mut self.pending)
    }
}

/// Coalesces raw events into batches.
///
/// A batch closes once no event arrived for the quiet period, or once it has
/// been open for the maximum batch age. Arrival order is kept.
pub struct Batcher {
    quiet_period: Duration,
    max_batch_age: Duration,
    state: Mutex<BatcherState>,
    output: mpsc::UnboundedSender<Batch>,
}

impl Batcher {
    /// Returns the batcher and the only sender feeding it. The batcher flushes
    /// and exits once every sender is dropped.
    pub fn new(config: &BatcherConfig, output: mpsc::UnboundedSender<Batch>) -> (Self, EventSender) {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let batcher = Self {
            quiet_period: config.quiet_period_duration(),
            max_batch_age: config.max_batch_age_duration(),
            state: Mutex::new(BatcherState {
                input: input_rx,
                pending: Vec::new(),
                opened_at: None,
                last_event_at: None,
            }),
            output,
        };
        (batcher, input_tx)
    }

    async fn process(&self, halt: CancellationToken) -> Result<(), WorkerError> {
        let mut state = self.state.lock().await;

        loop {
            let deadline = state.deadline(self.quiet_period, self.max_batch_age);

            tokio::select! {
                biased;

                _ = halt.cancelled() => {
                    if !state.pending.is_empty() {
                        tracing::debug!("Discarding open batch of {} events on halt", state.pending.len());
                        state.take();
                    }
                    return Ok(());
                }
                received = state.input.recv() => match received {
                    Some(event) => state.push(event),
                    None => {
                        self.flush(&mut state);
                        return Ok(());
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    if !self.flush(&mut state) {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Emit the open batch. Returns false once nobody consumes batches.
    fn flush(&self, state: &mut BatcherState) -> bool {
        let batch = state.take();
        if batch.is_empty() {
            return true;
        }

        let stats = BatchStats::of(&batch);
        tracing::debug!(
            "Batch closed: {} events ({} created, {} updated, {} deleted, {} moved)",
            stats.total(),
            stats.created,
            stats.updated,
            stats.deleted,
            stats.moved
        );

        if self.output.send(batch).is_err() {
            tracing::debug!("Batch consumer gone, batcher exiting");
            return false;
        }
        true
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Worker for Batcher {
    fn name(&self) -> &str {
        "batcher"
    }

    fn run(self: Arc<Self>, halt: CancellationToken) -> WorkerFuture {
        Box::pin(async move { self.process(halt).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(quiet_ms: u64, max_age_ms: u64) -> BatcherConfig {
        BatcherConfig {
            quiet_period_ms: quiet_ms,
            max_batch_age_ms: max_age_ms,
        }
    }

    fn start(config: BatcherConfig) -> (EventSender, mpsc::UnboundedReceiver<Batch>, CancellationToken, tokio::task::JoinHandle<Result<(), WorkerError>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (batcher, input) = Batcher::new(&config, out_tx);
        let halt = CancellationToken::new();
        let handle = tokio::spawn(Arc::new(batcher).run(halt.clone()));
        (input, out_rx, halt, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_becomes_one_ordered_batch() {
        let (input, mut batches, _halt, _handle) = start(config(1000, 5000));

        input.send(Event::created("a")).unwrap();
        input.send(Event::updated("b")).unwrap();
        input.send(Event::deleted("c")).unwrap();

        let batch = batches.recv().await.unwrap();
        let paths: Vec<&str> = batch.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_period_separates_batches() {
        let (input, mut batches, _halt, _handle) = start(config(1000, 5000));
        let started = Instant::now();

        input.send(Event::created("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        input.send(Event::created("b")).unwrap();

        let first = batches.recv().await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].path, "a");

        let second = batches.recv().await.unwrap();
        assert_eq!(second[0].path, "b");
        assert!(Instant::now() - started >= Duration::from_millis(2500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_age_caps_a_steady_stream() {
        let (input, mut batches, _halt, _handle) = start(config(1000, 5000));

        for i in 0..15 {
            input.send(Event::updated(format!("file{}", i))).unwrap();
            tokio::time::sleep(Duration::from_millis(400)).await;
        }

        let first = batches.recv().await.unwrap();
        assert_eq!(first.len(), 13);
        assert_eq!(first[12].path, "file12");

        let second = batches.recv().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].path, "file13");
    }

    #[tokio::test(start_paused = true)]
    async fn test_halt_discards_open_batch() {
        let (input, mut batches, halt, handle) = start(config(1000, 5000));

        input.send(Event::created("a")).unwrap();
        tokio::task::yield_now().await;
        halt.cancel();

        assert!(handle.await.unwrap().is_ok());
        assert!(batches.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_input_flushes() {
        let (input, mut batches, _halt, handle) = start(config(1000, 5000));

        input.send(Event::created("a")).unwrap();
        drop(input);

        assert_eq!(batches.recv().await.unwrap().len(), 1);
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_pending_events() {
        let (out_tx, mut batches) = mpsc::unbounded_channel();
        let (batcher, input) = Batcher::new(&config(1000, 5000), out_tx);
        let batcher = Arc::new(batcher);

        let first_halt = CancellationToken::new();
        let first = tokio::spawn(batcher.clone().run(first_halt.clone()));
        input.send(Event::created("a")).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        first.abort();
        let _ = first.await;

        tokio::spawn(batcher.clone().run(CancellationToken::new()));
        input.send(Event::created("b")).unwrap();

        let batch = batches.recv().await.unwrap();
        let paths: Vec<&str> = batch.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b"]);
    }
}
