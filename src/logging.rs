use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "RTSP_GRID_LOG";
const APP_DIR: &str = "rtsp-grid";
const LOG_FILE: &str = "rtsp-grid.log";
const DEFAULT_FILTER: &str = "rtsp_grid=info";

/// Routes tracing output to a log file, since the terminal belongs to the
/// viewer. Keep the returned guard alive until exit or buffered lines are lost.
pub fn init_logging(log_dir: Option<PathBuf>) -> Result<WorkerGuard> {
    let dir = match log_dir {
        Some(dir) => dir,
        None => default_log_dir()?,
    };
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed creating log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let env_filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_thread_names(true),
        )
        .try_init()
        .context("failed to initialize tracing")?;

    Ok(guard)
}

fn default_log_dir() -> Result<PathBuf> {
    let root = dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .context("unable to determine user data directory")?;
    Ok(root.join(APP_DIR))
}
