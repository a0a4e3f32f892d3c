use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "claude-usage-monitor",
    version,
    about = "Track live token usage, cost and rate limits of Claude Code sessions"
)]
pub struct Cli {
    /// Projects directory to scan instead of the configured one.
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print a one-shot summary of the most recent session.
    Status,
    /// List discovered sessions, newest first.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Follow every session live until Ctrl+C (the default).
    Watch,
    /// Print recently persisted session totals.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}
