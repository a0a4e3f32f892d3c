use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use claude_usage_monitor::app;
use claude_usage_monitor::cli::{Cli, Commands};
use claude_usage_monitor::config::MonitorConfig;
use claude_usage_monitor::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("claude-usage-monitor error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = MonitorConfig::load_or_init()?;
    let root = app::projects_root(&config, cli.root);

    match cli.command {
        Some(Commands::Status) => app::print_status(&config, &root),
        Some(Commands::Sessions { limit }) => app::print_sessions(&root, limit),
        Some(Commands::History { limit }) => {
            app::print_history(limit)?;
            Ok(0)
        }
        Some(Commands::Watch) | None => {
            app::run_watch(&config, &root)?;
            Ok(0)
        }
    }
}
