use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Counts reached by a run before it aborted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialCounts {
    /// Number of input items.
    pub total: usize,
    /// Items processed before the abort, including the failing chunk.
    pub processed: usize,
    /// Items processed successfully.
    pub successful: usize,
    /// Items that failed.
    pub failed: usize,
    /// Time from start to abort (milliseconds).
    pub duration_ms: u64,
}

/// Errors returned by the engine.
#[derive(Debug, Error)]
pub enum BatchError {
    /// The configuration or an argument is unusable.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// `process` was called while a run is already in progress.
    #[error("processor is already running")]
    AlreadyRunning,

    /// A chunk exhausted its retries and the run does not continue on error.
    #[error("batch {batch_index} failed: {message}")]
    ChunkFailure {
        /// Index of the failing chunk.
        batch_index: usize,
        /// Rendered error message.
        message: String,
        /// Counts reached before the abort.
        partial: PartialCounts,
    },

    /// The retry predicate rejected an error; the run aborts regardless of
    /// `continue_on_error`.
    #[error("batch {batch_index} failed with a non-retryable error: {message}")]
    NonRetryable {
        /// Index of the failing chunk.
        batch_index: usize,
        /// Rendered error message.
        message: String,
        /// Counts reached before the abort.
        partial: PartialCounts,
    },
}

impl BatchError {
    /// Partial counts carried by escalated run errors.
    pub fn partial(&self) -> Option<&PartialCounts> {
        match self {
            BatchError::ChunkFailure { partial, .. } | BatchError::NonRetryable { partial, .. } => {
                Some(partial)
            }
            BatchError::InvalidArgument(_) | BatchError::AlreadyRunning => None,
        }
    }

    /// Index of the chunk that caused an escalated run error.
    pub fn batch_index(&self) -> Option<usize> {
        match self {
            BatchError::ChunkFailure { batch_index, .. }
            | BatchError::NonRetryable { batch_index, .. } => Some(*batch_index),
            BatchError::InvalidArgument(_) | BatchError::AlreadyRunning => None,
        }
    }
}
