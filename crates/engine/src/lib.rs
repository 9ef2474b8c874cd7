#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Batch execution engine for `batchflow` (chunking, retries, progress, pause/resume/cancel).

/// Public API for the engine crate.
pub mod api;

mod chunk;
mod concurrent;
mod error;
mod metrics;
mod processor;
mod retry;
mod sequential;

pub use api::{
    BatchEvent, BatchProgress, BatchResult, ErrorRecord, ExecutionReport, ProcessorConfig,
    ProcessorHandle, ProgressSnapshot, RunState, StatusSnapshot,
};
pub use chunk::{chunk, into_chunks};
pub use concurrent::{ConcurrencyOptions, run_concurrent};
pub use error::{BatchError, PartialCounts};
pub use metrics::{estimated_time_remaining, percentage, rate};
pub use processor::BatchProcessor;
pub use retry::{RetryError, RetryHooks, RetryPolicy, retry_with_backoff};
pub use sequential::{SequentialOptions, run_sequential};
