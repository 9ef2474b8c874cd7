use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use batchflow_engine::{BatchResult, ProgressSnapshot};

pub(crate) struct Ui {
    bar: ProgressBar,
    label: String,
    last_message: String,
}

impl Ui {
    pub(crate) fn new(total: usize, label: &str) -> anyhow::Result<Self> {
        let bar = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
        let style = ProgressStyle::with_template(
            "{prefix} {bar:30.cyan/blue} {pos}/{len} {msg}\u{1b}[0K",
        )?
        .progress_chars("#--");
        bar.set_style(style);
        bar.set_prefix(label.to_string());
        bar.enable_steady_tick(Duration::from_millis(250));

        Ok(Self {
            bar,
            label: label.to_string(),
            last_message: String::new(),
        })
    }

    pub(crate) fn println(&self, msg: &str) {
        self.bar.println(msg);
    }

    pub(crate) fn set_progress(&mut self, progress: &ProgressSnapshot) {
        self.bar.set_position(progress.processed as u64);
        self.last_message = progress_message(progress);
        self.bar.set_message(self.last_message.clone());
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        if paused {
            self.bar.set_prefix(format!("{} [paused]", self.label));
        } else {
            self.bar.set_prefix(self.label.clone());
        }
    }

    pub(crate) fn set_stop_message(&self, msg: &str) {
        self.bar.set_message(format!("{} | {msg}", self.last_message));
    }

    pub(crate) fn freeze(&self) {
        self.bar.abandon();
    }
}

pub(crate) fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else if secs >= 10 {
        format!("{secs}s")
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

pub(crate) fn progress_message(progress: &ProgressSnapshot) -> String {
    let mut msg = format!("{:.2}% {:.1}/s", progress.percentage, progress.rate);
    if progress.processed < progress.total && progress.processed > 0 {
        let eta = Duration::from_millis(progress.estimated_time_remaining_ms);
        msg.push_str(&format!(" eta {}", format_duration(eta)));
    }
    if progress.failed > 0 {
        msg.push_str(&format!(" ({} failed)", progress.failed));
    }
    msg
}

pub(crate) fn summary_lines<T>(label: &str, result: &BatchResult<T>) -> Vec<String> {
    let status = if result.cancelled {
        "cancelled"
    } else if result.failed > 0 {
        "finished with failures"
    } else {
        "done"
    };
    let mut lines = vec![format!(
        "{label}: {status}: {}/{} processed, {} ok, {} failed in {}",
        result.processed,
        result.total,
        result.successful,
        result.failed,
        format_duration(Duration::from_millis(result.duration_ms)),
    )];
    for record in &result.errors {
        lines.push(format!(
            "  batch {} ({} item(s)): {}",
            record.batch_index + 1,
            record.items.len(),
            record.error
        ));
    }
    lines
}
