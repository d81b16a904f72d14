mod cli;
mod config;
mod error;
mod layout;
mod logging;
mod mailbox;
mod render;
mod shutdown;
mod source;
mod state;
mod target;
mod viewer;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, TargetsArgs, ViewArgs};
use config::{CameraConfig, SLOT_COUNT};
use serde::Serialize;
use shutdown::{ShutdownOutcome, ShutdownSequencer};
use source::RtspSource;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use worker::{WorkerTimings, start_slot_workers};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Targets(args)) => print_targets(&cli.config, &args),
        None => run_wall(&cli.config, &cli.view).await,
    }
}

async fn run_wall(config_path: &Path, args: &ViewArgs) -> Result<()> {
    let _log_guard = logging::init_logging(args.log_dir.clone())?;

    let cameras = config::load_cameras(config_path)?;
    let enabled = cameras.iter().filter(|camera| !camera.is_disabled()).count();
    info!(config = %config_path.display(), enabled, "camera configuration loaded");
    if enabled == 0 {
        warn!("no camera slot is enabled, showing an empty wall");
    }

    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    shutdown::listen_for_signals(trigger_tx)?;

    let timings = WorkerTimings {
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        stall_threshold: args.stall_threshold,
        ..WorkerTimings::default()
    };
    let source = Arc::new(
        RtspSource::new(args.transport)
            .with_connect_timeout(Duration::from_millis(args.connect_timeout_ms)),
    );
    let (tiles, workers) = start_slot_workers(&cameras, &source, timings)?;
    info!(workers = workers.len(), "stream workers started");

    let sequencer = ShutdownSequencer::new(workers);
    let outcome = viewer::run_viewer(&cameras, tiles, &sequencer, trigger_rx).await?;
    if let ShutdownOutcome::Completed(report) = outcome
        && !report.abandoned.is_empty()
    {
        warn!(abandoned = ?report.abandoned, "exiting with workers still running");
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct TargetRow {
    slot: usize,
    label: String,
    enabled: bool,
    target: Option<String>,
}

impl TargetRow {
    fn from_camera(camera: &CameraConfig) -> Self {
        let enabled = !camera.is_disabled();
        Self {
            slot: camera.slot + 1,
            label: camera.label(),
            enabled,
            target: enabled.then(|| target::redact_target(&target::build_target(camera))),
        }
    }
}

fn print_targets(config_path: &Path, args: &TargetsArgs) -> Result<()> {
    let cameras = config::load_cameras(config_path)?;
    let rows: Vec<TargetRow> = cameras.iter().map(TargetRow::from_camera).collect();

    if args.json {
        let payload =
            serde_json::to_string_pretty(&rows).context("failed to serialize targets as JSON")?;
        println!("{payload}");
        return Ok(());
    }

    println!("Slots ({SLOT_COUNT}) from {}:", config_path.display());
    for row in &rows {
        match &row.target {
            Some(target) => println!("{}. [{}] {}", row.slot, row.label, target),
            None => println!("{}. [{}] disabled", row.slot, row.label),
        }
    }
    Ok(())
}
