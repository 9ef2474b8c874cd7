//! Public API types for the batch processing engine.

use std::sync::Arc;
use std::time::Duration;

use batchflow_core::settings::RunSettings;
use serde::{Deserialize, Serialize};

use crate::error::{BatchError, PartialCounts};
use crate::retry::RetryPolicy;

/// Configuration for a [`BatchProcessor`](crate::BatchProcessor).
///
/// The configuration is fixed for the lifetime of the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of items per chunk.
    pub batch_size: usize,

    /// Maximum number of item operations in flight at once (item mode).
    pub concurrency: usize,

    /// Whether a chunk that exhausted its retries is recorded and skipped
    /// (`true`) or aborts the whole run (`false`).
    pub continue_on_error: bool,

    /// Number of retries after the first failed attempt.
    pub retry_attempts: u32,

    /// Base backoff delay (milliseconds).
    pub retry_delay_ms: u64,

    /// Upper bound for the backoff delay (milliseconds).
    pub max_retry_delay_ms: u64,

    /// Double the delay after each retry.
    pub exponential_backoff: bool,

    /// Diagnostic name attached to log lines and the `Started` event.
    pub label: String,
}

impl ProcessorConfig {
    /// Default chunk size.
    pub const DEFAULT_BATCH_SIZE: usize = 100;

    /// Default concurrency limit.
    pub const DEFAULT_CONCURRENCY: usize = 5;

    /// Default retry budget.
    pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

    /// Default base backoff delay.
    pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

    /// Default backoff cap.
    pub const DEFAULT_MAX_RETRY_DELAY_MS: u64 = 30_000;

    /// Default label.
    pub const DEFAULT_LABEL: &'static str = "batch";

    /// Reject configurations the processor cannot run with.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.batch_size == 0 {
            return Err(BatchError::InvalidArgument("batch_size must be > 0"));
        }
        if self.concurrency == 0 {
            return Err(BatchError::InvalidArgument("concurrency must be > 0"));
        }
        Ok(())
    }

    /// Build a configuration from persisted settings, falling back to defaults.
    pub fn from_settings(settings: &RunSettings) -> Self {
        let defaults = Self::default();
        Self {
            batch_size: settings.batch_size.unwrap_or(defaults.batch_size),
            concurrency: settings.concurrency.unwrap_or(defaults.concurrency),
            continue_on_error: settings
                .continue_on_error
                .unwrap_or(defaults.continue_on_error),
            retry_attempts: settings.retry_attempts.unwrap_or(defaults.retry_attempts),
            retry_delay_ms: settings.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
            max_retry_delay_ms: settings
                .max_retry_delay_ms
                .unwrap_or(defaults.max_retry_delay_ms),
            exponential_backoff: settings
                .exponential_backoff
                .unwrap_or(defaults.exponential_backoff),
            label: settings.label.clone().unwrap_or(defaults.label),
        }
    }

    /// Retry policy applied to every chunk (or item) of a run.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_attempts,
            initial_delay: Duration::from_millis(self.retry_delay_ms),
            exponential_backoff: self.exponential_backoff,
            max_delay: Duration::from_millis(self.max_retry_delay_ms),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::DEFAULT_BATCH_SIZE,
            concurrency: Self::DEFAULT_CONCURRENCY,
            continue_on_error: true,
            retry_attempts: Self::DEFAULT_RETRY_ATTEMPTS,
            retry_delay_ms: Self::DEFAULT_RETRY_DELAY_MS,
            max_retry_delay_ms: Self::DEFAULT_MAX_RETRY_DELAY_MS,
            exponential_backoff: true,
            label: Self::DEFAULT_LABEL.to_string(),
        }
    }
}

/// A chunk (or item) that failed for good, kept so callers can inspect or resubmit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord<T> {
    /// Index of the chunk the failure belongs to. For the standalone
    /// concurrent executor this is the item index.
    pub batch_index: usize,
    /// Rendered error message.
    pub error: String,
    /// The items that failed.
    pub items: Vec<T>,
}

/// Terminal output of a controller run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult<T> {
    /// Number of input items.
    pub total: usize,
    /// Items whose chunk finished (successfully or not).
    pub processed: usize,
    /// Items processed successfully.
    pub successful: usize,
    /// Items that failed after retries.
    pub failed: usize,
    /// Failures recorded during the run, in order.
    pub errors: Vec<ErrorRecord<T>>,
    /// Wall-clock duration of the run (milliseconds).
    pub duration_ms: u64,
    /// Whether the run stopped because of [`ProcessorHandle::cancel`].
    pub cancelled: bool,
    /// Unix timestamp (milliseconds) at which the run started.
    pub started_at: i64,
}

/// Progress payload emitted after each chunk.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Items processed so far.
    pub processed: usize,
    /// Number of input items.
    pub total: usize,
    /// Items processed successfully so far.
    pub successful: usize,
    /// Items failed so far.
    pub failed: usize,
    /// `processed / total` as a percentage, two decimals.
    pub percentage: f64,
    /// Throughput in items per second.
    pub rate: f64,
    /// Time since the run started (milliseconds).
    pub elapsed_ms: u64,
    /// Estimated time until all items are processed (milliseconds).
    pub estimated_time_remaining_ms: u64,
}

/// Progress payload passed to the sequential executor's callback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    /// Items processed so far.
    pub processed: usize,
    /// Number of input items.
    pub total: usize,
    /// `processed / total` as a percentage, two decimals.
    pub percentage: f64,
    /// 1-based number of the chunk that just finished.
    pub batch_number: usize,
    /// Number of chunks in the run.
    pub total_batches: usize,
}

/// Output of the standalone sequential and concurrent executors.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport<T, R> {
    /// Successful results, in input order.
    pub results: Vec<R>,
    /// Failures recorded with `continue_on_error`.
    pub errors: Vec<ErrorRecord<T>>,
    /// Number of input items.
    pub total: usize,
    /// Items processed (successfully or not).
    pub processed: usize,
    /// Items processed successfully.
    pub successful: usize,
    /// Items that failed.
    pub failed: usize,
    /// Wall-clock duration (milliseconds).
    pub duration_ms: u64,
}

/// Lifecycle state of a processor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RunState {
    /// No run has started yet.
    Idle,
    /// The chunk loop is active.
    Running,
    /// The chunk loop is suspended at a chunk boundary.
    Paused,
    /// The last run processed every chunk.
    Completed,
    /// The last run stopped early after a cancel request.
    Cancelled,
    /// The last run aborted with an escalated error.
    Failed,
}

impl RunState {
    /// Whether a run is in progress.
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }
}

/// Current processor state, for polling consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Lifecycle state.
    pub state: RunState,
    /// Number of input items of the current (or last) run.
    pub total: usize,
    /// Items processed so far.
    pub processed: usize,
    /// Items processed successfully so far.
    pub successful: usize,
    /// Items failed so far.
    pub failed: usize,
    /// Number of error records so far.
    pub error_count: usize,
}

impl StatusSnapshot {
    pub(crate) fn idle() -> Self {
        Self {
            state: RunState::Idle,
            total: 0,
            processed: 0,
            successful: 0,
            failed: 0,
            error_count: 0,
        }
    }
}

/// Processor event stream payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BatchEvent<T> {
    /// A run started.
    Started {
        /// Configured label.
        label: String,
        /// Number of input items.
        total: usize,
        /// Number of chunks.
        total_batches: usize,
        /// Unix timestamp (milliseconds).
        started_at: i64,
    },
    /// A chunk finished.
    Progress {
        /// Index of the chunk that finished.
        batch_index: usize,
        /// Progress after that chunk.
        progress: ProgressSnapshot,
    },
    /// An attempt failed and will be retried after `delay_ms`.
    Retry {
        /// Chunk index.
        batch_index: usize,
        /// Item index, in item mode.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        item_index: Option<usize>,
        /// 1-based number of the attempt that failed.
        attempt: u32,
        /// Backoff before the next attempt (milliseconds).
        delay_ms: u64,
        /// Error message of the failed attempt.
        message: String,
    },
    /// A chunk (or item) failed for good and was recorded.
    Error {
        /// The recorded failure.
        record: ErrorRecord<T>,
    },
    /// The run is suspended.
    Paused,
    /// The run continues.
    Resumed,
    /// Cancellation was requested; the run stops at the next chunk boundary.
    Cancelled,
    /// The run finished (normally or after cancellation).
    Complete {
        /// Final result.
        result: BatchResult<T>,
    },
    /// The run aborted with an escalated error.
    Failed {
        /// Chunk that caused the abort.
        batch_index: usize,
        /// Error message.
        message: String,
        /// Counts reached before the abort.
        partial: PartialCounts,
    },
}

/// Handle to a processor, for controlling a run from another task.
pub struct ProcessorHandle<T> {
    pub(crate) inner: Arc<crate::processor::ProcessorInner<T>>,
}

impl<T> Clone for ProcessorHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> ProcessorHandle<T> {
    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BatchEvent<T>> {
        self.inner.event_tx.subscribe()
    }

    /// Get the latest status snapshot.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RunState {
        self.inner.snapshot_tx.borrow().state
    }

    /// Suspend the run at the next chunk boundary.
    ///
    /// Returns `false` (and does nothing) unless a run is active and not paused.
    pub fn pause(&self) -> bool {
        self.inner.pause()
    }

    /// Continue a paused run.
    ///
    /// Returns `false` (and does nothing) unless the run is paused.
    pub fn resume(&self) -> bool {
        self.inner.resume()
    }

    /// Request cancellation. Chunks already in flight finish; no new chunk starts.
    ///
    /// Returns `false` when no run is active or cancellation was already requested.
    pub fn cancel(&self) -> bool {
        self.inner.cancel()
    }
}
