use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "claude-usage-exporter",
    version,
    about = "Republish Claude Code usage snapshots as telemetry counters and gauges"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a one-shot operational status snapshot.
    Status,
    /// Run health diagnostics for setup and runtime requirements.
    Doctor,
}
