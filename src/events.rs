use std::path::PathBuf;

use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tracing::{info, warn};

use crate::rate_limit::RateLimitStatus;
use crate::registry::SessionState;
use crate::util::{format_cost, format_reset_in, format_tokens};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project: String,
    pub model: Option<String>,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub is_active: bool,
}

impl SessionSummary {
    pub fn from_state(state: &SessionState, active: Option<&str>) -> Self {
        Self {
            session_id: state.session_id.clone(),
            project: state.project.clone(),
            model: state.model.clone(),
            total_tokens: state.total_tokens,
            cost_usd: state.cost_usd,
            is_active: active == Some(state.session_id.as_str()),
        }
    }
}

/// Messages pushed to whatever renders the monitor.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum MonitorEvent {
    TokenUpdate(SessionState),
    Error {
        session_id: Option<String>,
        message: String,
    },
    WatcherStarted {
        session_id: String,
        path: PathBuf,
    },
    WatcherFailed {
        session_id: String,
        message: String,
    },
    RateLimitUpdate {
        session_id: String,
        status: RateLimitStatus,
    },
    SessionList(Vec<SessionSummary>),
    SessionSwitched {
        session_id: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn send(&self, event: MonitorEvent);
}

/// Forwards events to a channel. Sends after the receiver is gone are
/// dropped.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: Sender<MonitorEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, Receiver<MonitorEvent>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn send(&self, event: MonitorEvent) {
        let _ = self.tx.send(event);
    }
}

/// Writes each event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn send(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::TokenUpdate(state) => info!(
                session = %state.session_id,
                model = state.model.as_deref().unwrap_or("unknown"),
                tokens = %format_tokens(state.total_tokens),
                cost = %format_cost(state.cost_usd),
                context = format_args!("{:.1}%", state.context_percent),
                "usage"
            ),
            MonitorEvent::Error {
                session_id,
                message,
            } => warn!(session = session_id.as_deref().unwrap_or("-"), %message, "monitor error"),
            MonitorEvent::WatcherStarted { session_id, path } => {
                info!(session = %session_id, path = %path.display(), "watching")
            }
            MonitorEvent::WatcherFailed {
                session_id,
                message,
            } => warn!(session = %session_id, %message, "watcher failed"),
            MonitorEvent::RateLimitUpdate { session_id, status } => {
                let now = Utc::now();
                info!(
                    session = %session_id,
                    requests_remaining = status.requests_remaining,
                    requests_reset = %format_reset_in(status.requests_reset_at, now),
                    tokens_remaining = status.tokens_remaining,
                    tokens_reset = %format_reset_in(status.tokens_reset_at, now),
                    level = status.level.label(),
                    "rate limit"
                )
            }
            MonitorEvent::SessionList(sessions) => {
                info!(count = sessions.len(), "sessions")
            }
            MonitorEvent::SessionSwitched { session_id } => {
                info!(session = session_id.as_deref().unwrap_or("-"), "active session")
            }
        }
    }
}
