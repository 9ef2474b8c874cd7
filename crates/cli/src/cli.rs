use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use batchflow_core::settings::RunSettings;

fn parse_positive(input: &str) -> Result<usize, String> {
    let value: usize = input
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {input:?}"))?;
    if value == 0 {
        return Err("must be >= 1".to_string());
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Run the command once per item, `{}` in its arguments replaced by the item (default).
    Item,
    /// Run the command once per chunk, with the chunk's items on stdin.
    Chunk,
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "batchflow",
    version,
    about = "Run a command over many inputs in retrying, pausable batches"
)]
pub struct Cli {
    /// Read items from this file instead of stdin (one item per non-empty line).
    #[arg(short, long, env = "BATCHFLOW_INPUT", value_name = "FILE")]
    pub input: Option<PathBuf>,

    /// Whether the command handles one item or a whole chunk per invocation.
    #[arg(long, env = "BATCHFLOW_MODE", value_enum, default_value_t = Mode::Item)]
    pub mode: Mode,

    /// Items per chunk.
    #[arg(short = 'b', long, env = "BATCHFLOW_BATCH_SIZE", value_parser = parse_positive)]
    pub batch_size: Option<usize>,

    /// Items running at once inside a chunk (only used with `--mode item`).
    #[arg(short = 'j', long, env = "BATCHFLOW_CONCURRENCY", value_parser = parse_positive)]
    pub concurrency: Option<usize>,

    /// Retries after the first failed attempt.
    #[arg(short = 'r', long, env = "BATCHFLOW_RETRIES")]
    pub retries: Option<u32>,

    /// Delay before the first retry.
    #[arg(long, env = "BATCHFLOW_RETRY_DELAY_MS", value_name = "MS")]
    pub retry_delay_ms: Option<u64>,

    /// Upper bound for the doubled retry delay.
    #[arg(long, env = "BATCHFLOW_MAX_RETRY_DELAY_MS", value_name = "MS")]
    pub max_retry_delay_ms: Option<u64>,

    /// Keep the retry delay constant instead of doubling it.
    #[arg(long, env = "BATCHFLOW_NO_BACKOFF", default_value_t = false)]
    pub no_backoff: bool,

    /// Abort the whole run on the first failure that survives its retries.
    #[arg(long, env = "BATCHFLOW_FAIL_FAST", default_value_t = false)]
    pub fail_fast: bool,

    /// Name shown in progress output and logs.
    #[arg(long, env = "BATCHFLOW_LABEL")]
    pub label: Option<String>,

    #[arg(long, env = "BATCHFLOW_NO_TUI", default_value_t = false)]
    pub no_tui: bool,

    /// Print the final result as JSON on stdout.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Settings file to use instead of `$XDG_CONFIG_HOME/batchflow/config.json`.
    #[arg(long, env = "BATCHFLOW_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Persist the effective settings to the settings file.
    #[arg(long, default_value_t = false)]
    pub save_config: bool,

    /// Command to run, e.g. `batchflow -- curl -fsS https://example.org/{}`.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND",
        required_unless_present = "save_config"
    )]
    pub command: Vec<String>,
}

impl Cli {
    /// Settings given on the command line or through the environment.
    pub fn overrides(&self) -> RunSettings {
        RunSettings {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            continue_on_error: self.fail_fast.then_some(false),
            retry_attempts: self.retries,
            retry_delay_ms: self.retry_delay_ms,
            max_retry_delay_ms: self.max_retry_delay_ms,
            exponential_backoff: self.no_backoff.then_some(false),
            label: self.label.clone(),
        }
    }
}
