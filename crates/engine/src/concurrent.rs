use std::future::Future;
use std::time::Instant;

use futures::future::join_all;
use tracing::warn;

use crate::api::{ErrorRecord, ExecutionReport};
use crate::error::{BatchError, PartialCounts};
use crate::metrics::duration_ms;

/// Options for [`run_concurrent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyOptions {
    /// Maximum number of operations in flight.
    pub concurrency: usize,
    /// Record failed items and keep going instead of aborting.
    pub continue_on_error: bool,
}

/// Run `op` on every item of `group` concurrently and wait for all of them.
///
/// Outcomes are returned in group order; `base_index` is added to each item's
/// offset to form the index passed to `op`.
pub(crate) async fn settle_group<T, O, F, Fut>(group: &[T], base_index: usize, op: &F) -> Vec<O>
where
    T: Clone,
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = O>,
{
    join_all(
        group
            .iter()
            .cloned()
            .enumerate()
            .map(|(offset, item)| op(item, base_index + offset)),
    )
    .await
}

/// Process items in groups of at most `concurrency`, one group at a time.
///
/// Every item of a group runs concurrently and the whole group settles before
/// the next one starts. `process` receives the item and its index in `items`.
/// Without `continue_on_error` the first failure of a group (by item index) is
/// returned once the group has settled; the group's successes are still
/// counted in the error's partial counts.
pub async fn run_concurrent<T, R, F, Fut>(
    items: Vec<T>,
    options: ConcurrencyOptions,
    process: F,
) -> Result<ExecutionReport<T, R>, BatchError>
where
    T: Clone,
    F: Fn(T, usize) -> Fut,
    Fut: Future<Output = anyhow::Result<R>>,
{
    if options.concurrency == 0 {
        return Err(BatchError::InvalidArgument("concurrency must be > 0"));
    }

    let started = Instant::now();
    let total = items.len();
    let mut report = ExecutionReport {
        results: Vec::with_capacity(total),
        errors: Vec::new(),
        total,
        processed: 0,
        successful: 0,
        failed: 0,
        duration_ms: 0,
    };

    for (group_idx, group) in items.chunks(options.concurrency).enumerate() {
        let base_index = group_idx * options.concurrency;
        let settled = settle_group(group, base_index, &process).await;

        let mut first_failure: Option<(usize, String)> = None;
        for (offset, (item, outcome)) in group.iter().zip(settled).enumerate() {
            let index = base_index + offset;
            report.processed += 1;
            match outcome {
                Ok(result) => {
                    report.successful += 1;
                    report.results.push(result);
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    report.failed += 1;
                    warn!(item_index = index, error = %message, "item failed");
                    if first_failure.is_none() {
                        first_failure = Some((index, message.clone()));
                    }
                    report.errors.push(ErrorRecord {
                        batch_index: index,
                        error: message,
                        items: vec![item.clone()],
                    });
                }
            }
        }

        if let Some((batch_index, message)) = first_failure {
            if !options.continue_on_error {
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
            }
        }
    }

    report.duration_ms = duration_ms(started.elapsed());
    Ok(report)
}
