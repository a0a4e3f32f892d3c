//! Wiring between discovery, tailers, the registry and the outside world.
//!
//! Every watched session gets a tailer (owned by the registry) and a pump
//! thread that turns the tailer's lines into registry updates, events and
//! history records. A pump stops when either of its feed channels closes.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::{TimeDelta, Utc};
use crossbeam_channel::{Receiver, select};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::TranscriptCache;
use crate::config::{MonitorConfig, RuntimeSettings};
use crate::cost::{CostComputation, PricingTable, compute_cost, context_percent};
use crate::error::{DiscoveryError, RegistryError, WatchError};
use crate::events::{EventSink, MonitorEvent, SessionSummary};
use crate::fs::{FileSystem, is_not_found};
use crate::history::{HistoryStore, SessionRecord};
use crate::locator::{SessionInfo, discover, qualified_id};
use crate::notifier::ChangeNotifier;
use crate::rate_limit::LimitLevel;
use crate::registry::{SessionRegistry, SessionState, TokenDelta};
use crate::tailer::{Tailer, TailerOptions, TranscriptFeed};
use crate::transcript::{TokenSummary, parse_usage_line};

/// One-shot view of a transcript, computed through the parse cache.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub info: SessionInfo,
    pub summary: TokenSummary,
    pub cost: CostComputation,
    pub context_percent: f64,
}

pub struct SessionMonitor {
    fs: Arc<dyn FileSystem>,
    settings: RuntimeSettings,
    tailer_options: TailerOptions,
    pricing: Arc<PricingTable>,
    registry: Arc<SessionRegistry>,
    cache: TranscriptCache,
    sink: Arc<dyn EventSink>,
    history: Arc<dyn HistoryStore>,
    notifier: Mutex<Option<Arc<ChangeNotifier>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionMonitor {
    pub fn new(
        config: &MonitorConfig,
        fs: Arc<dyn FileSystem>,
        sink: Arc<dyn EventSink>,
        history: Arc<dyn HistoryStore>,
    ) -> Self {
        let settings = config.runtime_settings();
        let tailer_options = TailerOptions {
            poll_interval: settings.poll_interval,
            ..TailerOptions::default()
        };
        Self {
            cache: TranscriptCache::with_ttl(Arc::clone(&fs), settings.cache_ttl),
            registry: Arc::new(SessionRegistry::new(settings.rate_limits)),
            pricing: Arc::new(PricingTable::new(config.pricing.clone())),
            fs,
            settings,
            tailer_options,
            sink,
            history,
            notifier: Mutex::new(None),
            pumps: Mutex::new(Vec::new()),
        }
    }

    pub fn with_tailer_options(mut self, options: TailerOptions) -> Self {
        self.tailer_options = options;
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Discovers sessions under `root` and starts watching those inside the
    /// active window, plus the newest one regardless of age. The newest
    /// becomes active. Returns how many sessions were added.
    pub fn start(&self, root: &Path) -> Result<usize, DiscoveryError> {
        let added = self.add_discovered(root)?;
        if let Some(newest) = added.first()
            && self.registry.set_active(&newest.session_id).is_ok()
        {
            self.sink.send(MonitorEvent::SessionSwitched {
                session_id: Some(newest.session_id.clone()),
            });
        }
        info!(root = %root.display(), sessions = added.len(), "monitor started");
        Ok(added.len())
    }

    /// Retires sessions whose transcript is gone and picks up sessions that
    /// appeared since the last scan. Returns how many were added.
    pub fn refresh(&self, root: &Path) -> Result<usize, DiscoveryError> {
        let active = self.registry.active_id();
        self.retire_missing();
        let added = self.add_discovered(root)?.len();

        let now_active = self.registry.active_id();
        if now_active != active {
            self.sink.send(MonitorEvent::SessionSwitched {
                session_id: now_active,
            });
        }
        Ok(added)
    }

    /// Registers a session without watching it.
    pub fn track(&self, info: &SessionInfo) -> Result<SessionState, RegistryError> {
        self.registry.add_session(info)
    }

    /// Spawns a tailer for an already tracked session. Failure is reported as
    /// a `WatcherFailed` event and the session stays registered, not live.
    pub fn watch(&self, info: &SessionInfo) -> bool {
        let poll_interval = self.tailer_options.poll_interval;
        let notifier = self.notifier();
        let spawn = |notifier: Option<&Arc<ChangeNotifier>>| {
            Tailer::spawn_with(Arc::clone(&self.fs), &info.path, poll_interval, notifier)
        };
        let spawned = match spawn(notifier.as_ref()) {
            Err(err @ WatchError::Notify { .. }) => {
                warn!(session = %info.session_id, error = %err, "no change notifications; polling only");
                spawn(None)
            }
            other => other,
        };
        match spawned {
            Ok(tailer) => {
                if let Err(err) = self.attach(&info.session_id, Box::new(tailer)) {
                    warn!(session = %info.session_id, error = %err, "tailer started for untracked session");
                    return false;
                }
                self.sink.send(MonitorEvent::WatcherStarted {
                    session_id: info.session_id.clone(),
                    path: info.path.clone(),
                });
                true
            }
            Err(err) => {
                warn!(session = %info.session_id, error = %err, "cannot watch session");
                let _ = self.registry.set_liveness(&info.session_id, false);
                self.sink.send(MonitorEvent::WatcherFailed {
                    session_id: info.session_id.clone(),
                    message: err.to_string(),
                });
                false
            }
        }
    }

    /// Hands a feed to the registry and starts pumping it.
    pub fn attach(
        &self,
        session_id: &str,
        feed: Box<dyn TranscriptFeed>,
    ) -> Result<(), RegistryError> {
        let lines = feed.lines().clone();
        let errors = feed.errors().clone();
        self.registry.attach_feed(session_id, feed)?;

        let pump = Pump {
            session_id: session_id.to_string(),
            registry: Arc::clone(&self.registry),
            pricing: Arc::clone(&self.pricing),
            sink: Arc::clone(&self.sink),
            history: Arc::clone(&self.history),
            last_level: None,
        };
        let name = format!("pump:{session_id}");
        match thread::Builder::new()
            .name(name)
            .spawn(move || pump.run(lines, errors))
        {
            Ok(handle) => {
                let mut pumps = self.pumps.lock();
                pumps.retain(|pump| !pump.is_finished());
                pumps.push(handle);
            }
            Err(err) => {
                warn!(session = %session_id, error = %err, "failed to spawn pump thread");
                self.sink.send(MonitorEvent::WatcherFailed {
                    session_id: session_id.to_string(),
                    message: err.to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Result<SessionState, RegistryError> {
        let state = self.registry.remove_session(session_id)?;
        self.publish_session_list();
        Ok(state)
    }

    pub fn switch_next(&self) -> Option<String> {
        let id = self.registry.next_session();
        self.sink.send(MonitorEvent::SessionSwitched {
            session_id: id.clone(),
        });
        id
    }

    pub fn switch_previous(&self) -> Option<String> {
        let id = self.registry.previous_session();
        self.sink.send(MonitorEvent::SessionSwitched {
            session_id: id.clone(),
        });
        id
    }

    pub fn session_list(&self) -> Vec<SessionSummary> {
        let active = self.registry.active_id();
        self.registry
            .sessions()
            .iter()
            .map(|state| SessionSummary::from_state(state, active.as_deref()))
            .collect()
    }

    /// Totals of one transcript's recent lines, served from the parse cache.
    pub fn summarize(&self, info: &SessionInfo) -> SessionSnapshot {
        let summary = self.cache.parse(&info.path, self.settings.tail_max_lines);
        let model = summary.model.clone().unwrap_or_default();
        let cost = compute_cost(
            &model,
            summary.input_tokens,
            summary.output_tokens,
            summary.cache_read_tokens,
            summary.cache_creation_tokens,
            &self.pricing,
        );
        let context_percent = context_percent(summary.total_tokens, cost.pricing.context_window);
        SessionSnapshot {
            info: info.clone(),
            summary,
            cost,
            context_percent,
        }
    }

    /// Closes every feed, waits for the pumps and flushes history.
    pub fn shutdown(&self) {
        self.registry.close_all();
        let pumps: Vec<JoinHandle<()>> = self.pumps.lock().drain(..).collect();
        for handle in pumps {
            if handle.join().is_err() {
                warn!("pump thread panicked");
            }
        }
        if let Err(err) = self.history.flush() {
            warn!(error = %err, "failed to flush history");
        }
    }

    /// The notifier shared by every tailer, created on first use.
    fn notifier(&self) -> Option<Arc<ChangeNotifier>> {
        if !self.tailer_options.os_notifications {
            return None;
        }
        let mut slot = self.notifier.lock();
        if slot.is_none() {
            match ChangeNotifier::new() {
                Ok(notifier) => *slot = Some(notifier),
                Err(err) => warn!(error = %err, "change notifier unavailable; polling only"),
            }
        }
        slot.clone()
    }

    fn retire_missing(&self) {
        for (session_id, path) in self.registry.tracked_paths() {
            let gone = matches!(self.fs.stat(&path), Err(err) if is_not_found(&err));
            if gone && self.remove(&session_id).is_ok() {
                info!(session = %session_id, path = %path.display(), "transcript deleted; session retired");
            }
        }
    }

    fn add_discovered(&self, root: &Path) -> Result<Vec<SessionInfo>, DiscoveryError> {
        let discovery = discover(self.fs.as_ref(), root, self.settings.max_sessions)?;
        if discovery.error_count > 0 {
            self.sink.send(MonitorEvent::Error {
                session_id: None,
                message: format!(
                    "{} project directories could not be scanned",
                    discovery.error_count
                ),
            });
        }

        let tracked: HashSet<PathBuf> = self.registry.tracked_paths().into_values().collect();
        let keep_newest = tracked.is_empty();
        let cutoff = self
            .settings
            .active_window
            .and_then(|window| TimeDelta::from_std(window).ok())
            .and_then(|window| Utc::now().checked_sub_signed(window));

        let mut added = Vec::new();
        let mut stale = 0usize;
        for (index, mut info) in discovery.sessions.into_iter().enumerate() {
            if tracked.contains(&info.path) {
                continue;
            }
            let recent = cutoff.is_none_or(|cutoff| info.modified >= cutoff);
            if !recent && !(keep_newest && index == 0) {
                stale += 1;
                continue;
            }
            // Ids already handed out never change; a newcomer sharing one
            // is told apart by its path.
            if self.registry.contains(&info.session_id) {
                info.session_id = qualified_id(root, &info.path);
            }
            match self.track(&info) {
                Ok(_) => {
                    self.watch(&info);
                    added.push(info);
                }
                Err(RegistryError::DuplicateSession(_)) => {}
                Err(err) => warn!(session = %info.session_id, error = %err, "cannot track session"),
            }
        }
        if stale > 0 {
            debug!(stale, "transcripts outside the active window left unwatched");
        }
        if !added.is_empty() {
            self.publish_session_list();
        }
        Ok(added)
    }

    fn publish_session_list(&self) {
        self.sink.send(MonitorEvent::SessionList(self.session_list()));
    }
}

impl Drop for SessionMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Pump {
    session_id: String,
    registry: Arc<SessionRegistry>,
    pricing: Arc<PricingTable>,
    sink: Arc<dyn EventSink>,
    history: Arc<dyn HistoryStore>,
    last_level: Option<LimitLevel>,
}

impl Pump {
    fn run(mut self, lines: Receiver<String>, errors: Receiver<WatchError>) {
        loop {
            let keep_going = select! {
                recv(lines) -> msg => match msg {
                    Ok(line) => self.handle_line(&line),
                    Err(_) => false,
                },
                recv(errors) -> msg => match msg {
                    Ok(err) => {
                        self.handle_error(&err);
                        true
                    }
                    Err(_) => false,
                },
            };
            if !keep_going {
                break;
            }
        }

        let _ = self.registry.set_liveness(&self.session_id, false);
        if let Err(err) = self.history.flush() {
            warn!(session = %self.session_id, error = %err, "failed to flush history");
        }
        debug!(session = %self.session_id, "pump stopped");
    }

    /// Returns false once the session is no longer registered.
    fn handle_line(&mut self, line: &str) -> bool {
        let entry = match parse_usage_line(line) {
            Ok(Some(entry)) => entry,
            Ok(None) => return true,
            Err(err) => {
                debug!(session = %self.session_id, error = %err, "skipping malformed line");
                return true;
            }
        };

        let model = entry
            .model
            .clone()
            .or_else(|| self.registry.get(&self.session_id).and_then(|s| s.model))
            .unwrap_or_default();
        let cost = compute_cost(
            &model,
            entry.input_tokens,
            entry.output_tokens,
            entry.cache_read_tokens,
            entry.cache_creation_tokens,
            &self.pricing,
        );
        let delta = TokenDelta {
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            cache_read_tokens: entry.cache_read_tokens,
            cache_creation_tokens: entry.cache_creation_tokens,
            cost_usd: cost.total_cost_usd,
            model: entry.model,
            context_window: Some(cost.pricing.context_window),
            at: entry.timestamp,
        };

        let state = match self.registry.update_tokens(&self.session_id, &delta) {
            Ok(state) => state,
            Err(err) => {
                debug!(session = %self.session_id, error = %err, "session gone; stopping pump");
                return false;
            }
        };

        if let Err(err) = self
            .history
            .save_or_update(&SessionRecord::from_state(&state))
        {
            warn!(session = %self.session_id, error = %err, "failed to save history");
            self.sink.send(MonitorEvent::Error {
                session_id: Some(self.session_id.clone()),
                message: format!("{err:#}"),
            });
        }

        if self.last_level != Some(state.rate_limit.level) {
            self.last_level = Some(state.rate_limit.level);
            self.sink.send(MonitorEvent::RateLimitUpdate {
                session_id: self.session_id.clone(),
                status: state.rate_limit.clone(),
            });
        }
        self.sink.send(MonitorEvent::TokenUpdate(state));
        true
    }

    fn handle_error(&self, err: &WatchError) {
        warn!(session = %self.session_id, error = %err, "watcher error");
        self.sink.send(MonitorEvent::Error {
            session_id: Some(self.session_id.clone()),
            message: err.to_string(),
        });
    }
}
