use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::api::{
    BatchEvent, BatchResult, ErrorRecord, ProcessorConfig, ProcessorHandle, RunState,
    StatusSnapshot,
};
use crate::chunk::into_chunks;
use crate::concurrent::settle_group;
use crate::error::{BatchError, PartialCounts};
use crate::metrics::{duration_ms, progress_snapshot};
use crate::retry::{RetryError, RetryHooks, RetryPolicy, retry_with_backoff};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

type RetryCondition = dyn Fn(&anyhow::Error) -> bool + Send + Sync;

#[derive(Debug, Clone, Copy, Default)]
struct RunControl {
    running: bool,
    paused: bool,
    cancelled: bool,
}

pub(crate) struct ProcessorInner<T> {
    pub(crate) event_tx: broadcast::Sender<BatchEvent<T>>,
    pub(crate) snapshot_tx: watch::Sender<StatusSnapshot>,
    control_tx: watch::Sender<RunControl>,
}

impl<T> ProcessorInner<T> {
    fn emit(&self, event: BatchEvent<T>) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, state: RunState) {
        self.snapshot_tx.send_modify(|snap| snap.state = state);
    }

    fn begin_run(&self, total: usize) -> Result<(), BatchError> {
        let mut already_running = false;
        self.control_tx.send_if_modified(|control| {
            if control.running {
                already_running = true;
                return false;
            }
            *control = RunControl {
                running: true,
                paused: false,
                cancelled: false,
            };
            true
        });
        if already_running {
            return Err(BatchError::AlreadyRunning);
        }

        self.snapshot_tx.send_replace(StatusSnapshot {
            state: RunState::Running,
            total,
            ..StatusSnapshot::idle()
        });
        Ok(())
    }

    fn end_run(&self) {
        self.control_tx.send_modify(|control| {
            control.running = false;
            control.paused = false;
        });
    }

    fn is_cancelled(&self) -> bool {
        self.control_tx.borrow().cancelled
    }

    pub(crate) fn pause(&self) -> bool {
        let changed = self.control_tx.send_if_modified(|control| {
            if control.running && !control.paused && !control.cancelled {
                control.paused = true;
                return true;
            }
            false
        });
        if changed {
            debug!("pause requested");
            self.set_state(RunState::Paused);
            self.emit(BatchEvent::Paused);
        }
        changed
    }

    pub(crate) fn resume(&self) -> bool {
        let changed = self.control_tx.send_if_modified(|control| {
            if control.running && control.paused {
                control.paused = false;
                return true;
            }
            false
        });
        if changed {
            debug!("resume requested");
            self.set_state(RunState::Running);
            self.emit(BatchEvent::Resumed);
        }
        changed
    }

    pub(crate) fn cancel(&self) -> bool {
        let changed = self.control_tx.send_if_modified(|control| {
            if control.running && !control.cancelled {
                control.cancelled = true;
                return true;
            }
            false
        });
        if changed {
            info!("cancellation requested");
            self.emit(BatchEvent::Cancelled);
        }
        changed
    }

    /// Wait until the run may start its next chunk. Returns `false` once cancelled.
    async fn wait_until_runnable(&self) -> bool {
        let mut control_rx = self.control_tx.subscribe();
        control_rx
            .wait_for(|control| control.cancelled || !control.paused)
            .await
            .map(|control| !control.cancelled)
            .unwrap_or(false)
    }

    fn emit_retry(
        &self,
        batch_index: usize,
        item_index: Option<usize>,
        attempt: u32,
        err: &anyhow::Error,
        delay: Duration,
    ) {
        let message = format!("{err:#}");
        debug!(
            batch_index,
            ?item_index,
            attempt,
            delay_ms = duration_ms(delay),
            error = %message,
            "retrying"
        );
        self.emit(BatchEvent::Retry {
            batch_index,
            item_index,
            attempt,
            delay_ms: duration_ms(delay),
            message,
        });
    }
}

/// Clears the running flag however the run future ends, including when it is dropped.
struct RunGuard<'a, T> {
    inner: &'a ProcessorInner<T>,
}

impl<T> Drop for RunGuard<'_, T> {
    fn drop(&mut self) {
        self.inner.end_run();
        self.inner.snapshot_tx.send_if_modified(|snap| {
            if snap.state.is_active() {
                snap.state = RunState::Cancelled;
                return true;
            }
            false
        });
    }
}

struct Failure<T> {
    items: Vec<T>,
    message: String,
    rejected: bool,
}

struct ChunkOutcome<T> {
    successful: usize,
    failures: Vec<Failure<T>>,
}

impl<T> ChunkOutcome<T> {
    fn new() -> Self {
        Self {
            successful: 0,
            failures: Vec::new(),
        }
    }

    /// The failure that must abort the run, if any: a rejected one first, else
    /// the first one when the run does not continue on error.
    fn escalation(&self, continue_on_error: bool) -> Option<&Failure<T>> {
        self.failures
            .iter()
            .find(|failure| failure.rejected)
            .or_else(|| self.failures.first().filter(|_| !continue_on_error))
    }

    fn push_failure(&mut self, items: Vec<T>, err: RetryError<anyhow::Error>) {
        let rejected = err.is_rejected();
        self.failures.push(Failure {
            items,
            message: format!("{:#}", err.into_inner()),
            rejected,
        });
    }
}

/// Run-local counters, owned by the chunk loop.
struct ProcessingState<T> {
    total: usize,
    processed: usize,
    successful: usize,
    failed: usize,
    started: Instant,
    started_at: i64,
    errors: Vec<ErrorRecord<T>>,
}

impl<T> ProcessingState<T> {
    fn new(total: usize) -> Self {
        Self {
            total,
            processed: 0,
            successful: 0,
            failed: 0,
            started: Instant::now(),
            started_at: Utc::now().timestamp_millis(),
            errors: Vec::new(),
        }
    }

    fn partial(&self) -> PartialCounts {
        PartialCounts {
            total: self.total,
            processed: self.processed,
            successful: self.successful,
            failed: self.failed,
            duration_ms: duration_ms(self.started.elapsed()),
        }
    }

    fn status(&self, state: RunState) -> StatusSnapshot {
        StatusSnapshot {
            state,
            total: self.total,
            processed: self.processed,
            successful: self.successful,
            failed: self.failed,
            error_count: self.errors.len(),
        }
    }
}

/// Stateful batch processor: chunking, retries, progress events, pause/resume/cancel.
///
/// One run at a time; the processor can be reused once a run has finished.
pub struct BatchProcessor<T> {
    config: ProcessorConfig,
    retry_condition: Option<Arc<RetryCondition>>,
    inner: Arc<ProcessorInner<T>>,
}

impl<T> BatchProcessor<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a processor, rejecting unusable configurations.
    pub fn new(config: ProcessorConfig) -> Result<Self, BatchError> {
        config.validate()?;

        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(StatusSnapshot::idle());
        let (control_tx, _) = watch::channel(RunControl::default());

        Ok(Self {
            config,
            retry_condition: None,
            inner: Arc::new(ProcessorInner {
                event_tx,
                snapshot_tx,
                control_tx,
            }),
        })
    }

    /// Only retry errors for which `condition` returns `true`.
    ///
    /// A rejected error aborts the run with [`BatchError::NonRetryable`], even
    /// when `continue_on_error` is set.
    pub fn with_retry_condition<C>(mut self, condition: C) -> Self
    where
        C: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    /// Processor configuration.
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// A clonable handle for controlling runs from other tasks.
    pub fn handle(&self) -> ProcessorHandle<T> {
        ProcessorHandle {
            inner: self.inner.clone(),
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent<T>> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest status snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// See [`ProcessorHandle::pause`].
    pub fn pause(&self) -> bool {
        self.inner.pause()
    }

    /// See [`ProcessorHandle::resume`].
    pub fn resume(&self) -> bool {
        self.inner.resume()
    }

    /// See [`ProcessorHandle::cancel`].
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }

    /// Process `items` chunk by chunk; `process_fn` receives a whole chunk and
    /// its 0-based index, and is retried as a unit.
    pub async fn process<F, Fut>(
        &self,
        items: Vec<T>,
        process_fn: F,
    ) -> Result<BatchResult<T>, BatchError>
    where
        F: Fn(Vec<T>, usize) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let policy = self.config.retry_policy();
        let total = items.len();
        let chunks = into_chunks(items, self.config.batch_size)?;
        let process_fn = &process_fn;
        let policy = &policy;

        self.drive(total, chunks, |batch_index, chunk| {
            self.run_chunk(policy, batch_index, chunk, process_fn)
        })
        .await
    }

    /// Process `items` chunk by chunk, calling `item_fn` once per item.
    ///
    /// Within a chunk, items run concurrently in groups of at most
    /// `concurrency`; each item is retried on its own. `item_fn` receives the
    /// item and its index in `items`.
    pub async fn process_each<F, Fut>(
        &self,
        items: Vec<T>,
        item_fn: F,
    ) -> Result<BatchResult<T>, BatchError>
    where
        F: Fn(T, usize) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let policy = self.config.retry_policy();
        let total = items.len();
        let batch_size = self.config.batch_size;
        let chunks = into_chunks(items, batch_size)?;
        let item_fn = &item_fn;
        let policy = &policy;

        self.drive(total, chunks, |batch_index, chunk| {
            self.run_chunk_items(policy, batch_index, batch_index * batch_size, chunk, item_fn)
        })
        .await
    }

    async fn drive<S, Fut>(
        &self,
        total: usize,
        chunks: Vec<Vec<T>>,
        mut step: S,
    ) -> Result<BatchResult<T>, BatchError>
    where
        S: FnMut(usize, Vec<T>) -> Fut,
        Fut: Future<Output = ChunkOutcome<T>>,
    {
        self.inner.begin_run(total)?;
        let _guard = RunGuard { inner: &*self.inner };

        let label = self.config.label.as_str();
        let total_batches = chunks.len();
        let mut state = ProcessingState::new(total);

        info!(label, total, total_batches, "batch run started");
        self.inner.emit(BatchEvent::Started {
            label: label.to_string(),
            total,
            total_batches,
            started_at: state.started_at,
        });

        for (batch_index, chunk) in chunks.into_iter().enumerate() {
            if !self.inner.wait_until_runnable().await {
                debug!(label, batch_index, "stopping at batch boundary after cancellation");
                break;
            }

            let outcome = step(batch_index, chunk).await;
            state.successful += outcome.successful;
            state.failed += outcome
                .failures
                .iter()
                .map(|failure| failure.items.len())
                .sum::<usize>();
            state.processed = state.successful + state.failed;

            self.inner.emit(BatchEvent::Progress {
                batch_index,
                progress: progress_snapshot(
                    state.processed,
                    state.total,
                    state.successful,
                    state.failed,
                    state.started.elapsed(),
                ),
            });

            if let Some(failure) = outcome.escalation(self.config.continue_on_error) {
                return Err(self.fail_run(&state, batch_index, failure));
            }

            for failure in outcome.failures {
                warn!(
                    label,
                    batch_index,
                    items = failure.items.len(),
                    error = %failure.message,
                    "batch failed after retries"
                );
                let record = ErrorRecord {
                    batch_index,
                    error: failure.message,
                    items: failure.items,
                };
                state.errors.push(record.clone());
                self.inner.emit(BatchEvent::Error { record });
            }

            self.inner
                .snapshot_tx
                .send_modify(|snap| *snap = state.status(snap.state));
        }

        let cancelled = self.inner.is_cancelled();
        let final_state = if cancelled {
            RunState::Cancelled
        } else {
            RunState::Completed
        };
        self.inner.snapshot_tx.send_replace(state.status(final_state));

        let result = BatchResult {
            total: state.total,
            processed: state.processed,
            successful: state.successful,
            failed: state.failed,
            errors: state.errors,
            duration_ms: duration_ms(state.started.elapsed()),
            cancelled,
            started_at: state.started_at,
        };

        info!(
            label,
            processed = result.processed,
            successful = result.successful,
            failed = result.failed,
            duration_ms = result.duration_ms,
            cancelled,
            "batch run finished"
        );
        self.inner.emit(BatchEvent::Complete {
            result: result.clone(),
        });
        Ok(result)
    }

    fn fail_run(
        &self,
        state: &ProcessingState<T>,
        batch_index: usize,
        failure: &Failure<T>,
    ) -> BatchError {
        let partial = state.partial();
        let message = failure.message.clone();

        warn!(
            label = self.config.label.as_str(),
            batch_index,
            rejected = failure.rejected,
            error = %message,
            "batch run aborted"
        );
        self.inner
            .snapshot_tx
            .send_replace(state.status(RunState::Failed));
        self.inner.emit(BatchEvent::Failed {
            batch_index,
            message: message.clone(),
            partial,
        });

        if failure.rejected {
            BatchError::NonRetryable {
                batch_index,
                message,
                partial,
            }
        } else {
            BatchError::ChunkFailure {
                batch_index,
                message,
                partial,
            }
        }
    }

    async fn run_chunk<F, Fut>(
        &self,
        policy: &RetryPolicy,
        batch_index: usize,
        chunk: Vec<T>,
        process_fn: &F,
    ) -> ChunkOutcome<T>
    where
        F: Fn(Vec<T>, usize) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let on_retry = |attempt: u32, err: &anyhow::Error, delay: Duration| {
            self.inner
                .emit_retry(batch_index, None, attempt, err, delay)
        };
        let hooks = RetryHooks::new()
            .on_retry(&on_retry)
            .retry_condition(self.retry_condition.as_deref());

        let res = retry_with_backoff(policy, hooks, || process_fn(chunk.clone(), batch_index)).await;
        let mut outcome = ChunkOutcome::new();
        match res {
            Ok(()) => outcome.successful = chunk.len(),
            Err(err) => outcome.push_failure(chunk, err),
        }
        outcome
    }

    async fn run_chunk_items<F, Fut>(
        &self,
        policy: &RetryPolicy,
        batch_index: usize,
        first_item_index: usize,
        chunk: Vec<T>,
        item_fn: &F,
    ) -> ChunkOutcome<T>
    where
        F: Fn(T, usize) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let concurrency = self.config.concurrency;
        let run_item = |item: T, item_index: usize| {
            self.run_item(policy, batch_index, item_index, item, item_fn)
        };

        let mut outcome = ChunkOutcome::new();
        for (group_idx, group) in chunk.chunks(concurrency).enumerate() {
            let base_index = first_item_index + group_idx * concurrency;
            let settled = settle_group(group, base_index, &run_item).await;
            for (item, res) in group.iter().zip(settled) {
                match res {
                    Ok(()) => outcome.successful += 1,
                    Err(err) => outcome.push_failure(vec![item.clone()], err),
                }
            }
            if outcome.escalation(self.config.continue_on_error).is_some() {
                debug!(batch_index, group = group_idx, "skipping the rest of the batch");
                break;
            }
        }
        outcome
    }

    async fn run_item<F, Fut>(
        &self,
        policy: &RetryPolicy,
        batch_index: usize,
        item_index: usize,
        item: T,
        item_fn: &F,
    ) -> Result<(), RetryError<anyhow::Error>>
    where
        F: Fn(T, usize) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let on_retry = |attempt: u32, err: &anyhow::Error, delay: Duration| {
            self.inner
                .emit_retry(batch_index, Some(item_index), attempt, err, delay)
        };
        let hooks = RetryHooks::new()
            .on_retry(&on_retry)
            .retry_condition(self.retry_condition.as_deref());

        retry_with_backoff(policy, hooks, || item_fn(item.clone(), item_index)).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn config(batch_size: usize, continue_on_error: bool) -> ProcessorConfig {
        ProcessorConfig {
            batch_size,
            concurrency: 2,
            continue_on_error,
            retry_attempts: 0,
            retry_delay_ms: 100,
            max_retry_delay_ms: 1_000,
            exponential_backoff: true,
            label: "test".to_string(),
        }
    }

    fn drain(rx: &mut broadcast::Receiver<BatchEvent<u32>>) -> Vec<BatchEvent<u32>> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    fn progress_of(events: &[BatchEvent<u32>]) -> Vec<crate::api::ProgressSnapshot> {
        events
            .iter()
            .filter_map(|ev| match ev {
                BatchEvent::Progress { progress, .. } => Some(*progress),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn all_chunks_succeed_with_progress_per_chunk() {
        let processor = BatchProcessor::<u32>::new(config(3, true)).unwrap();
        let mut events = processor.subscribe();

        let result = processor
            .process((1..=10).collect(), |_chunk, _| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(result.total, 10);
        assert_eq!(result.processed, 10);
        assert_eq!(result.successful, 10);
        assert_eq!(result.failed, 0);
        assert!(result.errors.is_empty());
        assert!(!result.cancelled);

        let events = drain(&mut events);
        assert!(matches!(
            events.first(),
            Some(BatchEvent::Started { total: 10, total_batches: 4, .. })
        ));
        assert!(matches!(events.last(), Some(BatchEvent::Complete { result: r }) if r == &result));
        let pct: Vec<f64> = progress_of(&events).iter().map(|p| p.percentage).collect();
        assert_eq!(pct, vec![30.0, 60.0, 90.0, 100.0]);

        let snap = processor.snapshot();
        assert_eq!(snap.state, RunState::Completed);
        assert_eq!(snap.processed, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_stay_consistent_when_chunks_fail() {
        let mut cfg = config(3, true);
        cfg.retry_attempts = 1;
        let processor = BatchProcessor::<u32>::new(cfg).unwrap();
        let mut events = processor.subscribe();

        let result = processor
            .process((0..20).collect(), |_chunk, idx| async move {
                if idx % 3 == 1 {
                    anyhow::bail!("batch {idx} rejected");
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.processed, 20);
        assert_eq!(result.failed, 6);
        assert_eq!(result.successful, 14);
        let failed_batches: Vec<usize> = result.errors.iter().map(|e| e.batch_index).collect();
        assert_eq!(failed_batches, vec![1, 4]);
        assert_eq!(result.errors[0].items, vec![3, 4, 5]);
        assert_eq!(result.errors[0].error, "batch 1 rejected");

        let events = drain(&mut events);
        for p in progress_of(&events) {
            assert_eq!(p.processed, p.successful + p.failed);
            assert!(p.processed <= p.total);
        }
        let retries = events
            .iter()
            .filter(|ev| matches!(ev, BatchEvent::Retry { .. }))
            .count();
        assert_eq!(retries, 2);
        let error_events = events
            .iter()
            .filter(|ev| matches!(ev, BatchEvent::Error { .. }))
            .count();
        assert_eq!(error_events, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_use_exponential_backoff() {
        let mut cfg = config(10, false);
        cfg.retry_attempts = 3;
        let processor = BatchProcessor::<u32>::new(cfg).unwrap();
        let mut events = processor.subscribe();
        let attempts = &AtomicU32::new(0);

        let result = processor
            .process(vec![1, 2, 3], move |_chunk, _| async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("flaky");
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.successful, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let delays: Vec<(u32, u64)> = drain(&mut events)
            .into_iter()
            .filter_map(|ev| match ev {
                BatchEvent::Retry {
                    attempt, delay_ms, ..
                } => Some((attempt, delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(delays, vec![(1, 100), (2, 200)]);
    }

    #[tokio::test]
    async fn abort_emits_failed_and_returns_partial_counts() {
        let processor = BatchProcessor::<u32>::new(config(2, false)).unwrap();
        let mut events = processor.subscribe();
        let calls = Mutex::new(Vec::new());

        let err = processor
            .process((0..8).collect(), |_chunk, idx| {
                calls.lock().unwrap().push(idx);
                async move {
                    if idx == 2 {
                        anyhow::bail!("disk full");
                    }
                    Ok(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::ChunkFailure { batch_index: 2, .. }));
        let partial = err.partial().copied().unwrap();
        assert_eq!((partial.processed, partial.successful, partial.failed), (6, 4, 2));
        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 2]);

        let events = drain(&mut events);
        assert!(matches!(events.last(), Some(BatchEvent::Failed { batch_index: 2, .. })));
        match &events[events.len() - 2] {
            BatchEvent::Progress {
                batch_index: 2,
                progress,
            } => assert_eq!((progress.processed, progress.failed), (6, 2)),
            other => panic!("expected progress for the failing batch, got {other:?}"),
        }
        assert!(!events
            .iter()
            .any(|ev| matches!(ev, BatchEvent::Complete { .. })));
        assert_eq!(processor.snapshot().state, RunState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_errors_escalate_without_retrying() {
        let mut cfg = config(2, true);
        cfg.retry_attempts = 5;
        let processor = BatchProcessor::<u32>::new(cfg)
            .unwrap()
            .with_retry_condition(|err| !err.to_string().starts_with("validation"));
        let attempts = &AtomicU32::new(0);

        let err = processor
            .process(vec![1, 2, 3, 4], move |_chunk, idx| async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                if idx == 1 {
                    anyhow::bail!("validation: bad record");
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BatchError::NonRetryable { batch_index: 1, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejection_on_the_last_attempt_still_aborts() {
        let processor = BatchProcessor::<u32>::new(config(2, true))
            .unwrap()
            .with_retry_condition(|_| false);
        let err = processor
            .process(vec![1, 2, 3, 4], |_chunk, _| async {
                anyhow::bail!("validation: bad record")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NonRetryable { batch_index: 0, .. }));

        let mut cfg = config(2, true);
        cfg.retry_attempts = 1;
        let processor = BatchProcessor::<u32>::new(cfg)
            .unwrap()
            .with_retry_condition(|err| !err.to_string().starts_with("validation"));
        let attempts = &AtomicU32::new(0);
        let err = processor
            .process(vec![1, 2, 3, 4], move |_chunk, _| async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("connection reset");
                }
                anyhow::bail!("validation: bad record")
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::NonRetryable { batch_index: 0, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn item_mode_fail_fast_stops_after_the_failing_group() {
        let processor = BatchProcessor::<u32>::new(config(10, false)).unwrap();
        let mut events = processor.subscribe();
        let calls = &AtomicU32::new(0);

        let err = processor
            .process_each((0..10).collect(), move |item, _| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if item == 0 {
                    anyhow::bail!("item {item} failed");
                }
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(err, BatchError::ChunkFailure { batch_index: 0, .. }));
        let partial = err.partial().copied().unwrap();
        assert_eq!((partial.processed, partial.successful, partial.failed), (2, 1, 1));
        assert!(matches!(
            drain(&mut events).last(),
            Some(BatchEvent::Failed { batch_index: 0, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn item_mode_never_exceeds_the_concurrency_limit() {
        let current = &AtomicU32::new(0);
        let peak = &AtomicU32::new(0);
        for concurrency in 1..5usize {
            peak.store(0, Ordering::SeqCst);
            let mut cfg = config(7, true);
            cfg.concurrency = concurrency;
            let processor = BatchProcessor::<u64>::new(cfg).unwrap();

            let result = processor
                .process_each((0..23).collect(), move |item, _| async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(1 + (item * 7) % 13)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();

            assert_eq!(result.successful, 23);
            assert_eq!(peak.load(Ordering::SeqCst) as usize, concurrency);
        }
    }

    #[tokio::test]
    async fn second_run_while_running_is_rejected() {
        let processor = BatchProcessor::<u32>::new(config(1, true)).unwrap();

        let first = processor.process(vec![1, 2], |_chunk, _| async {
            tokio::task::yield_now().await;
            Ok(())
        });
        let second = async {
            tokio::task::yield_now().await;
            processor
                .process(vec![3], |_chunk, _| async { Ok(()) })
                .await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap().processed, 2);
        assert!(matches!(second, Err(BatchError::AlreadyRunning)));

        let again = processor
            .process(vec![4, 5, 6], |_chunk, _| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(again.processed, 3);
    }

    #[tokio::test]
    async fn cancel_stops_at_the_next_boundary() {
        let processor = BatchProcessor::<u32>::new(config(2, true)).unwrap();
        let handle = processor.handle();
        let mut events = processor.subscribe();
        let started = Mutex::new(Vec::new());

        let result = processor
            .process((0..10).collect(), |_chunk, idx| {
                started.lock().unwrap().push(idx);
                if idx == 1 {
                    assert!(handle.cancel());
                }
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert!(result.cancelled);
        assert_eq!(result.processed, 4);
        assert_eq!(*started.lock().unwrap(), vec![0, 1]);
        assert_eq!(handle.state(), RunState::Cancelled);

        let events = drain(&mut events);
        let cancelled = events
            .iter()
            .filter(|ev| matches!(ev, BatchEvent::Cancelled))
            .count();
        assert_eq!(cancelled, 1);
        assert!(matches!(events.last(), Some(BatchEvent::Complete { result }) if result.cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn pause_holds_the_next_chunk_until_resumed() {
        let processor = BatchProcessor::<u32>::new(config(2, true)).unwrap();
        let handle = processor.handle();
        let mut events = processor.subscribe();
        let started = Mutex::new(Vec::new());

        let run = processor.process((0..6).collect(), |_chunk, idx| {
            started.lock().unwrap().push(idx);
            if idx == 0 {
                assert!(handle.pause());
            }
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(())
            }
        });
        let control = async {
            loop {
                match events.recv().await {
                    Ok(BatchEvent::Paused) => break,
                    Ok(_) => continue,
                    Err(err) => panic!("event stream closed: {err}"),
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
            assert_eq!(*started.lock().unwrap(), vec![0]);
            assert_eq!(handle.state(), RunState::Paused);
            assert!(!handle.pause());
            assert!(handle.resume());
            assert!(!handle.resume());
        };
        let (result, ()) = tokio::join!(run, control);

        let result = result.unwrap();
        assert_eq!(result.processed, 6);
        assert_eq!(*started.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_paused_ends_the_run() {
        let processor = BatchProcessor::<u32>::new(config(2, true)).unwrap();
        let handle = processor.handle();

        let run = processor.process((0..6).collect(), |_chunk, idx| {
            if idx == 0 {
                handle.pause();
            }
            async { Ok(()) }
        });
        let control = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(handle.cancel());
        };
        let (result, ()) = tokio::join!(run, control);

        let result = result.unwrap();
        assert!(result.cancelled);
        assert_eq!(result.processed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn item_mode_records_failed_items_per_chunk() {
        let mut cfg = config(100, true);
        cfg.retry_attempts = 1;
        let processor = BatchProcessor::<u32>::new(cfg).unwrap();
        let mut events = processor.subscribe();

        let result = processor
            .process_each(vec![1, 2, 3, 4, 5], |item, _| async move {
                if item == 3 {
                    anyhow::bail!("item {item} failed");
                }
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.processed, 5);
        assert_eq!(result.successful, 4);
        assert_eq!(result.failed, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].batch_index, 0);
        assert_eq!(result.errors[0].items, vec![3]);

        let retry_items: Vec<Option<usize>> = drain(&mut events)
            .into_iter()
            .filter_map(|ev| match ev {
                BatchEvent::Retry { item_index, .. } => Some(item_index),
                _ => None,
            })
            .collect();
        assert_eq!(retry_items, vec![Some(2)]);
    }

    #[tokio::test]
    async fn controls_are_noops_when_idle() {
        let processor = BatchProcessor::<u32>::new(config(2, true)).unwrap();
        assert!(!processor.pause());
        assert!(!processor.resume());
        assert!(!processor.cancel());
        assert_eq!(processor.snapshot().state, RunState::Idle);

        let result = processor
            .process(Vec::new(), |_chunk, _| async { Ok(()) })
            .await
            .unwrap();
        assert_eq!(result.total, 0);
        assert!(!result.cancelled);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let err = BatchProcessor::<u32>::new(config(0, true)).err().unwrap();
        assert!(matches!(err, BatchError::InvalidArgument(_)));

        let mut cfg = config(1, true);
        cfg.concurrency = 0;
        assert!(BatchProcessor::<u32>::new(cfg).is_err());
    }

    #[test]
    fn events_serialize_with_a_type_tag() {
        let json = serde_json::to_value(BatchEvent::<u32>::Paused).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "Paused" }));

        let json = serde_json::to_value(BatchEvent::Error {
            record: ErrorRecord {
                batch_index: 3,
                error: "boom".to_string(),
                items: vec![7u32],
            },
        })
        .unwrap();
        assert_eq!(json["type"], "Error");
        assert_eq!(json["record"]["items"][0], 7);
    }
}
