mod cli;
mod control;
mod runner;
mod terminal;
mod ui;

use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use batchflow_core::settings::{
    RunSettings, load_settings, load_settings_from, save_settings, save_settings_to,
};
use batchflow_engine::{BatchError, BatchEvent, BatchProcessor, BatchResult, ProcessorConfig};

use crate::cli::{Cli, Mode};
use crate::control::{ControlEvent, InterruptCounter, spawn_ctrl_c_handler};
use crate::runner::{CommandTemplate, read_items};
use crate::terminal::KeyListener;
use crate::ui::{Ui, progress_message, summary_lines};

const EXIT_FAILED: u8 = 1;
const EXIT_INTERRUPTED: u8 = 130;

fn init_tracing() {
    // Keep the default quiet so log lines do not tear the progress bar.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_file_settings(cli: &Cli) -> anyhow::Result<RunSettings> {
    if let Some(path) = &cli.config {
        return load_settings_from(path)
            .with_context(|| format!("failed to read settings from {}", path.display()))?
            .ok_or_else(|| anyhow::anyhow!("settings file not found: {}", path.display()));
    }
    match load_settings() {
        Ok(settings) => Ok(settings.unwrap_or_default()),
        Err(err) => {
            warn!(error = %format!("{err:#}"), "ignoring unreadable settings file");
            eprintln!("warning: failed to read settings: {err:#}");
            Ok(RunSettings::default())
        }
    }
}

async fn load_items(cli: &Cli) -> anyhow::Result<Vec<String>> {
    match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            read_items(tokio::io::BufReader::new(file)).await
        }
        None => {
            if std::io::stdin().is_terminal() {
                eprintln!("reading items from stdin (one per line, CTRL+D to finish)");
            }
            read_items(tokio::io::BufReader::new(tokio::io::stdin())).await
        }
    }
    .context("failed to read items")
}

fn describe_event(event: &BatchEvent<String>) -> Option<String> {
    match event {
        BatchEvent::Retry {
            batch_index,
            item_index,
            attempt,
            delay_ms,
            message,
        } => {
            let target = match item_index {
                Some(idx) => format!("item {}", idx + 1),
                None => format!("batch {}", batch_index + 1),
            };
            Some(format!(
                "retry {target} (attempt {attempt} failed, next in {delay_ms}ms): {message}"
            ))
        }
        BatchEvent::Error { record } => Some(format!(
            "batch {} failed ({} item(s)): {}",
            record.batch_index + 1,
            record.items.len(),
            record.error
        )),
        BatchEvent::Paused => Some("Paused. Press p to resume.".to_string()),
        BatchEvent::Resumed => Some("Resumed.".to_string()),
        BatchEvent::Failed {
            batch_index,
            message,
            ..
        } => Some(format!("batch {} aborted the run: {message}", batch_index + 1)),
        BatchEvent::Started { .. }
        | BatchEvent::Progress { .. }
        | BatchEvent::Cancelled
        | BatchEvent::Complete { .. } => None,
    }
}

fn print_line(ui: &Option<Ui>, line: &str) {
    match ui {
        Some(ui) => ui.println(line),
        None => eprintln!("{line}"),
    }
}

fn exit_status<T>(result: &BatchResult<T>) -> u8 {
    if result.failed > 0 {
        EXIT_FAILED
    } else if result.cancelled {
        EXIT_INTERRUPTED
    } else {
        0
    }
}

fn report(
    label: &str,
    json: bool,
    outcome: Result<BatchResult<String>, BatchError>,
) -> anyhow::Result<ExitCode> {
    match outcome {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                for line in summary_lines(label, &result) {
                    println!("{line}");
                }
            }
            Ok(ExitCode::from(exit_status(&result)))
        }
        Err(err) => {
            let Some(partial) = err.partial() else {
                return Err(err.into());
            };
            if json {
                let body = serde_json::json!({
                    "error": err.to_string(),
                    "batch_index": err.batch_index(),
                    "partial": partial,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                eprintln!("error: {err}");
                eprintln!(
                    "{label}: aborted after {}/{} processed, {} ok, {} failed",
                    partial.processed, partial.total, partial.successful, partial.failed
                );
            }
            Ok(ExitCode::from(EXIT_FAILED))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let settings = load_file_settings(&cli)?.merged_with(&cli.overrides());
    if cli.save_config {
        let path = match &cli.config {
            Some(path) => {
                save_settings_to(path, &settings)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                path.clone()
            }
            None => save_settings(&settings).context("failed to write settings")?,
        };
        eprintln!("saved settings to {}", path.display());
        if cli.command.is_empty() {
            return Ok(ExitCode::SUCCESS);
        }
    }

    let config = ProcessorConfig::from_settings(&settings);
    let template = CommandTemplate::new(&cli.command)?;
    let items = load_items(&cli).await?;
    let processor = BatchProcessor::new(config.clone()).context("invalid settings")?;
    let handle = processor.handle();
    let mut events = processor.subscribe();

    let tui_enabled = !cli.no_tui && std::io::stderr().is_terminal();
    let interrupts = Arc::new(InterruptCounter::new());
    let (control_tx, mut control_rx) = tokio::sync::mpsc::unbounded_channel::<ControlEvent>();
    let key_listener = if tui_enabled && std::io::stdin().is_terminal() {
        Some(KeyListener::enter(interrupts.clone(), control_tx.clone())?)
    } else {
        None
    };
    if key_listener.is_none() {
        spawn_ctrl_c_handler(interrupts.clone(), control_tx);
    }

    let mut ui = if tui_enabled {
        Some(Ui::new(items.len(), &config.label)?)
    } else {
        None
    };
    let startup = format!(
        "batchflow {} {}: {} item(s), batch size {}, {} {}",
        env!("CARGO_PKG_VERSION"),
        config.label,
        items.len(),
        config.batch_size,
        template.program(),
        if key_listener.is_some() {
            "(p pause/resume, CTRL+C stop)"
        } else {
            ""
        },
    );
    print_line(&ui, startup.trim_end());

    let template = &template;
    let run = async {
        match cli.mode {
            Mode::Item => {
                processor
                    .process_each(items, move |item, _| template.run_item(item))
                    .await
            }
            Mode::Chunk => {
                processor
                    .process(items, move |chunk, _| template.run_chunk(chunk))
                    .await
            }
        }
    };
    tokio::pin!(run);

    let outcome = loop {
        tokio::select! {
            res = &mut run => break res,
            ev_opt = control_rx.recv() => {
                match ev_opt {
                    Some(ControlEvent::TogglePause) => {
                        if !handle.pause() {
                            handle.resume();
                        }
                    }
                    Some(ControlEvent::Graceful) => {
                        let msg = "Stop requested, finishing the current batch (press CTRL+C again to exit immediately).";
                        match &ui {
                            Some(ui) => ui.set_stop_message(msg),
                            None => eprintln!("{msg}"),
                        }
                        handle.cancel();
                    }
                    Some(ControlEvent::Immediate) => {
                        print_line(&ui, "Stop requested again, exiting immediately.");
                        if let Some(ui) = &ui {
                            ui.freeze();
                        }
                        drop(key_listener);
                        // Returning drops the run future, which kills any child still running.
                        return Ok(ExitCode::from(EXIT_INTERRUPTED));
                    }
                    None => {}
                }
            }
            evt = events.recv() => {
                let evt = match evt {
                    Ok(v) => v,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break run.as_mut().await,
                };
                match &evt {
                    BatchEvent::Progress { batch_index, progress } => match &mut ui {
                        Some(ui) => ui.set_progress(progress),
                        None => eprintln!("batch {}: {}", batch_index + 1, progress_message(progress)),
                    },
                    BatchEvent::Paused => {
                        if let Some(ui) = &ui {
                            ui.set_paused(true);
                        }
                    }
                    BatchEvent::Resumed => {
                        if let Some(ui) = &ui {
                            ui.set_paused(false);
                        }
                    }
                    _ => {}
                }
                if let Some(line) = describe_event(&evt) {
                    print_line(&ui, &line);
                }
            }
        }
    };

    // Events emitted by the final batch may still be queued.
    while let Ok(evt) = events.try_recv() {
        if let Some(line) = describe_event(&evt) {
            print_line(&ui, &line);
        }
    }

    if let Some(ui) = &ui {
        ui.freeze();
    }
    drop(key_listener);

    report(&config.label, cli.json, outcome)
}
