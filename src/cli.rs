use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "rtsp-grid",
    version,
    about = "Four-camera RTSP wall for the terminal with click-to-fullscreen"
)]
pub struct Cli {
    /// Camera configuration file (JSON array of up to four cameras).
    #[arg(long, global = true, default_value = "config.json")]
    pub config: PathBuf,

    #[command(flatten)]
    pub view: ViewArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print each slot's connection target (passwords masked) and exit.
    Targets(TargetsArgs),
}

#[derive(Debug, Args)]
pub struct ViewArgs {
    /// RTSP transport protocol to request.
    #[arg(long, value_enum, default_value_t = TransportMode::Tcp)]
    pub transport: TransportMode,

    /// Pause between reconnect attempts.
    #[arg(long, default_value_t = 3000, value_parser = clap::value_parser!(u64).range(100..))]
    pub retry_delay_ms: u64,

    /// Give up on a camera that has not started streaming within this time.
    #[arg(long, default_value_t = 10_000, value_parser = clap::value_parser!(u64).range(100..))]
    pub connect_timeout_ms: u64,

    /// Consecutive empty pulls tolerated before a stream is dropped.
    #[arg(long, default_value_t = 50, value_parser = clap::value_parser!(u32).range(1..))]
    pub stall_threshold: u32,

    /// Directory for the log file (defaults to the user data directory).
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum TransportMode {
    Tcp,
    Udp,
}

#[derive(Debug, Args)]
pub struct TargetsArgs {
    /// Print machine-readable JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}
