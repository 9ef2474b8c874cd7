use std::time::Duration;

use crate::api::ProgressSnapshot;

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// `processed / total` as a percentage rounded to two decimals (`0` when `total` is `0`).
pub fn percentage(processed: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round2(processed as f64 / total as f64 * 100.0)
}

/// Throughput in items per second, rounded to two decimals.
pub fn rate(processed: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    round2(processed as f64 / secs)
}

/// Remaining time assuming the average per-item time so far holds.
pub fn estimated_time_remaining(processed: usize, total: usize, elapsed: Duration) -> Duration {
    if processed == 0 || processed >= total {
        return Duration::ZERO;
    }
    let remaining = (total - processed) as u128;
    let nanos = elapsed.as_nanos().saturating_mul(remaining) / processed as u128;
    Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
}

pub(crate) fn progress_snapshot(
    processed: usize,
    total: usize,
    successful: usize,
    failed: usize,
    elapsed: Duration,
) -> ProgressSnapshot {
    ProgressSnapshot {
        processed,
        total,
        successful,
        failed,
        percentage: percentage(processed, total),
        rate: rate(processed, elapsed),
        elapsed_ms: duration_ms(elapsed),
        estimated_time_remaining_ms: duration_ms(estimated_time_remaining(
            processed, total, elapsed,
        )),
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
