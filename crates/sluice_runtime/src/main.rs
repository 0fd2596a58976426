//! Sluice Runtime
//!
//! Runs script lines as coroutines on a named work queue and prints each
//! outcome as `count<TAB>value`. Lines come from the command line, or from
//! stdin (one per line) when none are given.

use anyhow::{bail, Result};
use clap::Parser;
use sluice_core::{AppStatus, DynamicValue, Lifecycle, WorkQueue};
use sluice_events::{PumpHub, ScopedSubscription};
use sluice_script::{CoroutineHost, ScriptOutcome};
use sluice_services::Settings;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Run script lines as coroutines over named work queues")]
#[command(version)]
struct Args {
    /// Script lines to run, in order
    #[arg(value_name = "SCRIPT")]
    lines: Vec<String>,

    /// JSON settings file
    #[arg(short, long, value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Queue name (overrides the settings file)
    #[arg(short, long)]
    queue: Option<String>,

    /// Print every post made on this pump (repeatable)
    #[arg(short, long, value_name = "PUMP")]
    listen: Vec<String>,

    /// Give up on a line after this many milliseconds
    #[arg(long, value_name = "MS")]
    run_for: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    tracing::info!("Sluice v{}", sluice_core::VERSION);
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env()?,
    };
    let window = args
        .run_for
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.queue.run_for());

    let lifecycle = Lifecycle::global();
    let hub = PumpHub::global();
    let queue = WorkQueue::new(args.queue.clone().unwrap_or_else(|| settings.queue.name.clone()))?;
    let host = CoroutineHost::new(hub.clone(), lifecycle.clone(), &settings.script)?;
    let _listeners: Vec<ScopedSubscription> = args
        .listen
        .iter()
        .map(|pump| hub.subscribe_scoped(pump, |name, value| println!("[{name}] {value}")))
        .collect();
    lifecycle.set_status(AppStatus::Running);
    tracing::info!(queue = queue.key(), command_pump = host.command_pump(), "runtime initialized");

    let lines = if args.lines.is_empty() {
        std::io::stdin().lock().lines().collect::<std::io::Result<Vec<_>>>()?
    } else {
        args.lines
    };

    let mut failures = 0;
    for line in lines.iter().map(|line| line.trim()).filter(|line| !line.is_empty()) {
        match run_line(&host, &queue, line, window) {
            Some(outcome) => {
                if outcome.is_error() {
                    failures += 1;
                }
                println!("{}\t{}", outcome.count, render(&outcome.value));
            }
            None => {
                failures += 1;
                tracing::warn!(?window, script = line, "script line did not finish in time");
                println!("-1\t!timeout");
            }
        }
    }

    lifecycle.set_status(AppStatus::Stopping);
    queue.close();
    queue.run_until_close();
    drop(host);
    lifecycle.set_status(AppStatus::Stopped);

    #[cfg(feature = "metrics")]
    {
        let stats = queue.stats();
        tracing::info!(
            counters = ?stats.counters,
            average_ms = stats.average_ms,
            slowest_ms = stats.slowest_ms,
            last_ms = ?stats.last_ms,
            "queue statistics"
        );
    }

    if failures > 0 {
        bail!("{failures} script line(s) failed");
    }
    Ok(())
}

/// Service `queue` until `line` finishes or `window` runs out.
fn run_line(
    host: &CoroutineHost,
    queue: &WorkQueue,
    line: &str,
    window: Duration,
) -> Option<ScriptOutcome> {
    let deadline = Instant::now() + window;
    let mut future = host.start_script_line(queue, line);
    loop {
        if let Some(outcome) = future.try_take() {
            return Some(outcome);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        queue.wait_one((deadline - now).min(Duration::from_millis(10)));
    }
}

fn render(value: &DynamicValue) -> String {
    match value {
        DynamicValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}
