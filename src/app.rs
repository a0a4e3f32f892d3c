use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::{self, MonitorConfig};
use crate::error::DiscoveryError;
use crate::events::TracingSink;
use crate::fs::{FileSystem, OsFileSystem};
use crate::history::{HistoryStore, JsonHistoryStore, MemoryHistoryStore};
use crate::locator::{discover, find_active};
use crate::monitor::{SessionMonitor, SessionSnapshot};
use crate::util::{
    format_cost, format_model_name, format_tokens, progress_bar, truncate,
};

const REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub fn projects_root(config: &MonitorConfig, root_override: Option<PathBuf>) -> PathBuf {
    root_override.unwrap_or_else(|| config.runtime_settings().projects_path)
}

pub fn print_status(config: &MonitorConfig, root: &Path) -> Result<u8> {
    let fs: Arc<dyn FileSystem> = Arc::new(OsFileSystem);
    let active = match find_active(fs.as_ref(), root) {
        Ok(active) => active,
        Err(err @ (DiscoveryError::RootMissing(_) | DiscoveryError::NoSessions(_))) => {
            println!("claude-usage-monitor status");
            println!("projects: {}", root.display());
            println!("{err}");
            return Ok(1);
        }
        Err(err) => return Err(err).context("session discovery failed"),
    };

    let monitor = SessionMonitor::new(
        config,
        fs,
        Arc::new(TracingSink),
        Arc::new(MemoryHistoryStore::new()),
    );
    let snapshot = monitor.summarize(&active);

    println!("claude-usage-monitor status");
    println!("config: {}", config::config_path().display());
    println!("projects: {}", root.display());
    print_snapshot(&snapshot);
    Ok(0)
}

pub fn print_sessions(root: &Path, limit: usize) -> Result<u8> {
    let discovery = match discover(&OsFileSystem, root, Some(limit)) {
        Ok(discovery) => discovery,
        Err(err @ DiscoveryError::RootMissing(_)) => {
            println!("{err}");
            return Ok(1);
        }
        Err(err) => return Err(err).context("session discovery failed"),
    };

    if discovery.sessions.is_empty() {
        println!("no sessions found under {}", root.display());
        return Ok(1);
    }
    for session in &discovery.sessions {
        println!(
            "{:<38} {:<28} {}",
            truncate(&session.session_id, 38),
            truncate(&session.project, 28),
            session.modified.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if discovery.error_count > 0 {
        println!(
            "[WARN] {} project directories could not be scanned",
            discovery.error_count
        );
    }
    Ok(0)
}

pub fn print_history(limit: usize) -> Result<()> {
    let store = JsonHistoryStore::open(config::history_path())?;
    let records = store.recent_history(limit)?;
    if records.is_empty() {
        println!("no history recorded yet");
        return Ok(());
    }
    for record in records {
        println!(
            "{} {:<38} {:<14} {:>8} {:>10}",
            record.updated_at.format("%Y-%m-%d %H:%M"),
            truncate(&record.session_id, 38),
            format_model_name(record.model.as_deref().unwrap_or_default()),
            format_tokens(record.total_tokens),
            format_cost(record.cost_usd)
        );
    }
    Ok(())
}

/// Follows every discovered session until Ctrl+C.
pub fn run_watch(config: &MonitorConfig, root: &Path) -> Result<()> {
    let stop = install_stop_signal()?;
    let history = JsonHistoryStore::open(config::history_path())?;
    let monitor = SessionMonitor::new(
        config,
        Arc::new(OsFileSystem),
        Arc::new(TracingSink),
        Arc::new(history),
    );

    let count = monitor
        .start(root)
        .with_context(|| format!("failed to start monitoring {}", root.display()))?;
    println!("watching {count} session(s) under {}", root.display());
    println!("Press Ctrl+C to stop.");

    let tick = monitor.settings().poll_interval;
    let mut last_refresh = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        thread::sleep(tick);
        if last_refresh.elapsed() >= REFRESH_INTERVAL {
            last_refresh = Instant::now();
            match monitor.refresh(root) {
                Ok(added) if added > 0 => debug!(added, "new sessions picked up"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "rediscovery failed"),
            }
        }
    }

    monitor.shutdown();
    println!("stopped");
    Ok(())
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    let summary = &snapshot.summary;
    println!("active_session:");
    println!("  id: {}", snapshot.info.session_id);
    println!("  project: {}", snapshot.info.project);
    println!("  path: {}", snapshot.info.path.display());
    println!(
        "  model: {}",
        format_model_name(summary.model.as_deref().unwrap_or_default())
    );
    println!(
        "  tokens: {} (input {} | output {} | cache read {} | cache write {})",
        format_tokens(summary.total_tokens),
        format_tokens(summary.input_tokens),
        format_tokens(summary.output_tokens),
        format_tokens(summary.cache_read_tokens),
        format_tokens(summary.cache_creation_tokens)
    );
    println!(
        "  cost: {} ({} pricing via {:?})",
        format_cost(snapshot.cost.total_cost_usd),
        snapshot.cost.resolved_model,
        snapshot.cost.source
    );
    println!(
        "  context: [{}] {:.1}%",
        progress_bar(snapshot.context_percent, 20),
        snapshot.context_percent
    );
    if let Some(last) = summary.last_entry_at {
        println!("  last_entry: {}", last.format("%Y-%m-%d %H:%M:%S"));
    }
}

fn install_stop_signal() -> Result<Arc<AtomicBool>> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl+C handler")?;
    Ok(stop)
}
