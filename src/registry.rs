//! Shared directory of tracked sessions.
//!
//! One reader/writer lock guards the whole map. No method performs I/O while
//! holding it; feeds removed from the map are closed after the lock is
//! released.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::cost::{DEFAULT_CONTEXT_WINDOW, context_percent};
use crate::error::RegistryError;
use crate::locator::SessionInfo;
use crate::rate_limit::{ObservedLimits, RateLimitSettings, RateLimitStatus, RateLimitTracker};
use crate::tailer::TranscriptFeed;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub project: String,
    pub path: PathBuf,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    /// `input + output`; cache tokens are not included.
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub context_percent: f64,
    pub is_live: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub rate_limit: RateLimitStatus,
}

/// Token counts and cost of one usage-bearing entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TokenDelta {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cost_usd: f64,
    pub model: Option<String>,
    pub context_window: Option<u64>,
    /// When the entry was written. Defaults to now.
    pub at: Option<DateTime<Utc>>,
}

struct Slot {
    state: SessionState,
    tracker: RateLimitTracker,
    feed: Option<Box<dyn TranscriptFeed>>,
    context_window: u64,
}

#[derive(Default)]
struct Inner {
    sessions: BTreeMap<String, Slot>,
    active: Option<String>,
}

pub struct SessionRegistry {
    inner: RwLock<Inner>,
    limits: RateLimitSettings,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(RateLimitSettings::default())
    }
}

impl SessionRegistry {
    pub fn new(limits: RateLimitSettings) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            limits,
        }
    }

    /// Starts tracking a session. The first session added becomes active.
    pub fn add_session(&self, info: &SessionInfo) -> Result<SessionState, RegistryError> {
        let mut inner = self.inner.write();
        if inner.sessions.contains_key(&info.session_id) {
            return Err(RegistryError::DuplicateSession(info.session_id.clone()));
        }

        let mut tracker = RateLimitTracker::new(self.limits);
        let state = SessionState {
            session_id: info.session_id.clone(),
            project: info.project.clone(),
            path: info.path.clone(),
            model: None,
            input_tokens: 0,
            output_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            total_tokens: 0,
            cost_usd: 0.0,
            context_percent: 0.0,
            is_live: false,
            last_update: None,
            rate_limit: tracker.status(),
        };
        inner.sessions.insert(
            info.session_id.clone(),
            Slot {
                state: state.clone(),
                tracker,
                feed: None,
                context_window: DEFAULT_CONTEXT_WINDOW,
            },
        );
        if inner.active.is_none() {
            inner.active = Some(info.session_id.clone());
        }
        info!(session = %info.session_id, project = %info.project, "session added");
        Ok(state)
    }

    /// Hands ownership of a running feed to the session. A feed that was
    /// already attached is closed.
    pub fn attach_feed(
        &self,
        session_id: &str,
        feed: Box<dyn TranscriptFeed>,
    ) -> Result<(), RegistryError> {
        let previous = {
            let mut inner = self.inner.write();
            let slot = inner
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
            slot.state.is_live = true;
            slot.feed.replace(feed)
        };
        if let Some(previous) = previous {
            previous.close();
        }
        Ok(())
    }

    /// Stops tracking a session and closes its feed.
    ///
    /// If it was active, the first remaining session becomes active.
    pub fn remove_session(&self, session_id: &str) -> Result<SessionState, RegistryError> {
        let slot = {
            let mut inner = self.inner.write();
            let slot = inner
                .sessions
                .remove(session_id)
                .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
            if inner.active.as_deref() == Some(session_id) {
                inner.active = inner.sessions.keys().next().cloned();
            }
            slot
        };
        if let Some(feed) = &slot.feed {
            feed.close();
        }
        info!(session = %session_id, "session removed");
        Ok(slot.state)
    }

    /// Folds one entry into the session's totals and rate-limit window.
    pub fn update_tokens(
        &self,
        session_id: &str,
        delta: &TokenDelta,
    ) -> Result<SessionState, RegistryError> {
        let mut inner = self.inner.write();
        let slot = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;

        let at = delta.at.unwrap_or_else(Utc::now);
        let state = &mut slot.state;
        state.input_tokens = state.input_tokens.saturating_add(delta.input_tokens);
        state.output_tokens = state.output_tokens.saturating_add(delta.output_tokens);
        state.cache_read_tokens = state
            .cache_read_tokens
            .saturating_add(delta.cache_read_tokens);
        state.cache_creation_tokens = state
            .cache_creation_tokens
            .saturating_add(delta.cache_creation_tokens);
        state.total_tokens = state.input_tokens.saturating_add(state.output_tokens);
        if delta.cost_usd.is_finite() && delta.cost_usd > 0.0 {
            state.cost_usd += delta.cost_usd;
        }
        if let Some(model) = delta.model.as_ref().filter(|model| !model.trim().is_empty()) {
            state.model = Some(model.clone());
        }
        if let Some(window) = delta.context_window.filter(|window| *window > 0) {
            slot.context_window = window;
        }
        state.context_percent = context_percent(state.total_tokens, slot.context_window);
        state.last_update = Some(at);

        slot.tracker.record_request_at(at);
        slot.tracker
            .record_token_usage_at(delta.input_tokens.saturating_add(delta.output_tokens), at);
        state.rate_limit = slot.tracker.status();

        debug!(
            session = %session_id,
            input = delta.input_tokens,
            output = delta.output_tokens,
            total = state.total_tokens,
            "tokens updated"
        );
        Ok(state.clone())
    }

    pub fn set_liveness(&self, session_id: &str, is_live: bool) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        let slot = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
        slot.state.is_live = is_live;
        Ok(())
    }

    pub fn update_rate_limits(
        &self,
        session_id: &str,
        observed: ObservedLimits,
    ) -> Result<RateLimitStatus, RegistryError> {
        let mut inner = self.inner.write();
        let slot = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| RegistryError::UnknownSession(session_id.to_string()))?;
        slot.tracker.update_limits(observed);
        slot.state.rate_limit = slot.tracker.status();
        Ok(slot.state.rate_limit.clone())
    }

    /// Moves the active pointer forward in id order, wrapping around.
    pub fn next_session(&self) -> Option<String> {
        self.cycle(Direction::Forward)
    }

    pub fn previous_session(&self) -> Option<String> {
        self.cycle(Direction::Backward)
    }

    pub fn set_active(&self, session_id: &str) -> Result<(), RegistryError> {
        let mut inner = self.inner.write();
        if !inner.sessions.contains_key(session_id) {
            return Err(RegistryError::UnknownSession(session_id.to_string()));
        }
        inner.active = Some(session_id.to_string());
        Ok(())
    }

    pub fn active_id(&self) -> Option<String> {
        self.inner.read().active.clone()
    }

    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        self.inner
            .read()
            .sessions
            .get(session_id)
            .map(|slot| slot.state.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.read().sessions.contains_key(session_id)
    }

    /// Transcript path of every tracked session, keyed by session id.
    pub fn tracked_paths(&self) -> BTreeMap<String, PathBuf> {
        self.inner
            .read()
            .sessions
            .iter()
            .map(|(id, slot)| (id.clone(), slot.state.path.clone()))
            .collect()
    }

    /// Snapshot of every session in id order.
    pub fn sessions(&self) -> Vec<SessionState> {
        self.inner
            .read()
            .sessions
            .values()
            .map(|slot| slot.state.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every attached feed. Sessions stay registered but are no
    /// longer live.
    pub fn close_all(&self) {
        let feeds: Vec<Box<dyn TranscriptFeed>> = {
            let mut inner = self.inner.write();
            inner
                .sessions
                .values_mut()
                .filter_map(|slot| {
                    slot.state.is_live = false;
                    slot.feed.take()
                })
                .collect()
        };
        for feed in &feeds {
            feed.close();
        }
        debug!(closed = feeds.len(), "all feeds closed");
    }

    fn cycle(&self, direction: Direction) -> Option<String> {
        let mut inner = self.inner.write();
        let ids: Vec<&String> = inner.sessions.keys().collect();
        if ids.is_empty() {
            inner.active = None;
            return None;
        }

        let current = inner
            .active
            .as_ref()
            .and_then(|active| ids.iter().position(|id| *id == active));
        let next = match (current, direction) {
            (None, _) => 0,
            (Some(idx), Direction::Forward) => (idx + 1) % ids.len(),
            (Some(idx), Direction::Backward) => (idx + ids.len() - 1) % ids.len(),
        };
        let id = ids[next].clone();
        inner.active = Some(id.clone());
        Some(id)
    }
}

#[derive(Debug, Clone, Copy)]
enum Direction {
    Forward,
    Backward,
}
