use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use claude_usage_exporter::app;
use claude_usage_exporter::cli::{Cli, Commands};
use claude_usage_exporter::config::ExporterConfig;
use claude_usage_exporter::process_guard::{self, AcquireState};
use claude_usage_exporter::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("claude-usage-exporter error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = ExporterConfig::load_or_init()?;

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config)?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        None => {
            let guard = match process_guard::acquire_single_instance()? {
                AcquireState::Acquired(guard) => guard,
                AcquireState::AlreadyRunning { pid } => {
                    match pid {
                        Some(pid) => eprintln!(
                            "claude-usage-exporter is already running (PID {pid}); stop it first."
                        ),
                        None => {
                            eprintln!("claude-usage-exporter is already running; stop it first.")
                        }
                    }
                    return Ok(1);
                }
            };
            let _guard = guard;
            let runtime = config.runtime_settings();
            app::run(runtime)?;
            Ok(0)
        }
    }
}
