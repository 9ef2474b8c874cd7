use std::future::Future;
use std::time::Instant;

use tracing::warn;

use crate::api::{BatchProgress, ErrorRecord, ExecutionReport};
use crate::chunk::into_chunks;
use crate::error::{BatchError, PartialCounts};
use crate::metrics::{duration_ms, percentage};

/// Options for [`run_sequential`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialOptions {
    /// Items per chunk.
    pub batch_size: usize,
    /// Record failed chunks and keep going instead of aborting.
    pub continue_on_error: bool,
}

/// Process `items` one chunk at a time, strictly in order.
///
/// `process` receives each chunk and its 0-based index. `on_progress` is
/// called after every successful chunk. Without `continue_on_error` the first
/// failing chunk aborts the run with [`BatchError::ChunkFailure`].
pub async fn run_sequential<T, R, F, Fut>(
    items: Vec<T>,
    options: SequentialOptions,
    mut process: F,
    on_progress: Option<&(dyn Fn(&BatchProgress) + Send + Sync)>,
) -> Result<ExecutionReport<T, R>, BatchError>
where
    T: Clone,
    F: FnMut(Vec<T>, usize) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    let started = Instant::now();
    let total = items.len();
    let chunks = into_chunks(items, options.batch_size)?;
    let total_batches = chunks.len();

    let mut report = ExecutionReport {
        results: Vec::with_capacity(total_batches),
        errors: Vec::new(),
        total,
        processed: 0,
        successful: 0,
        failed: 0,
        duration_ms: 0,
    };

    for (batch_index, chunk) in chunks.into_iter().enumerate() {
        let len = chunk.len();
        // Only a recorded failure needs the items back; an abort does not.
        let kept = options.continue_on_error.then(|| chunk.clone());
        match process(chunk, batch_index).await {
            Ok(result) => {
                report.results.push(result);
                report.successful += len;
                report.processed += len;
                if let Some(on_progress) = on_progress {
                    on_progress(&BatchProgress {
                        processed: report.processed,
                        total,
                        percentage: percentage(report.processed, total),
                        batch_number: batch_index + 1,
                        total_batches,
                    });
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                report.failed += len;
                report.processed += len;
                warn!(batch_index, items = len, error = %message, "batch failed");

                let Some(items) = kept else {
                    return Err(BatchError::ChunkFailure {
                        batch_index,
                        message,
                        partial: PartialCounts {
                            total,
                            processed: report.processed,
                            successful: report.successful,
                            failed: report.failed,
                            duration_ms: duration_ms(started.elapsed()),
                        },
                    });
                };
                report.errors.push(ErrorRecord {
                    batch_index,
                    error: message,
                    items,
                });
            }
        }
    }

    report.duration_ms = duration_ms(started.elapsed());
    Ok(report)
}
