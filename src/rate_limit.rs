//! Sliding-window request and token counters.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REQUESTS_PER_WINDOW: u64 = 120;
pub const DEFAULT_TOKENS_PER_WINDOW: u64 = 100_000;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

const WARNING_PERCENT: f64 = 50.0;
const CRITICAL_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitLevel {
    #[default]
    Ok,
    Warning,
    Critical,
}

impl LimitLevel {
    pub fn from_percent(percent: f64) -> Self {
        if percent >= CRITICAL_PERCENT {
            Self::Critical
        } else if percent >= WARNING_PERCENT {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub requests_remaining: u64,
    pub requests_limit: u64,
    pub requests_reset_at: DateTime<Utc>,
    pub tokens_remaining: u64,
    pub tokens_limit: u64,
    pub tokens_reset_at: DateTime<Utc>,
    pub is_limited: bool,
    pub level: LimitLevel,
}

impl RateLimitStatus {
    /// The higher of request and token usage, as a percentage of the limit.
    pub fn usage_percent(&self) -> f64 {
        used_percent(self.requests_remaining, self.requests_limit).max(used_percent(
            self.tokens_remaining,
            self.tokens_limit,
        ))
    }
}

fn used_percent(remaining: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 100.0;
    }
    let used = limit.saturating_sub(remaining);
    (used as f64 / limit as f64 * 100.0).clamp(0.0, 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitSettings {
    pub requests_per_window: u64,
    pub tokens_per_window: u64,
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            tokens_per_window: DEFAULT_TOKENS_PER_WINDOW,
            window: DEFAULT_WINDOW,
        }
    }
}

/// Limit values reported by an outside source such as API response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ObservedLimits {
    pub requests_limit: Option<u64>,
    pub requests_remaining: Option<u64>,
    pub tokens_limit: Option<u64>,
    pub tokens_remaining: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    remaining: u64,
    reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RateLimitTracker {
    window: TimeDelta,
    requests_limit: u64,
    tokens_limit: u64,
    requests: VecDeque<DateTime<Utc>>,
    tokens: VecDeque<(DateTime<Utc>, u64)>,
    observed_requests: Option<Observation>,
    observed_tokens: Option<Observation>,
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new(RateLimitSettings::default())
    }
}

impl RateLimitTracker {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            window: TimeDelta::from_std(settings.window).unwrap_or(TimeDelta::minutes(1)),
            requests_limit: settings.requests_per_window,
            tokens_limit: settings.tokens_per_window,
            requests: VecDeque::new(),
            tokens: VecDeque::new(),
            observed_requests: None,
            observed_tokens: None,
        }
    }

    pub fn record_request(&mut self) {
        self.record_request_at(Utc::now());
    }

    pub fn record_request_at(&mut self, now: DateTime<Utc>) {
        self.requests.push_back(now);
        self.prune(now);
    }

    pub fn record_token_usage(&mut self, tokens: u64) {
        self.record_token_usage_at(tokens, Utc::now());
    }

    pub fn record_token_usage_at(&mut self, tokens: u64, now: DateTime<Utc>) {
        self.tokens.push_back((now, tokens));
        self.prune(now);
    }

    pub fn status(&mut self) -> RateLimitStatus {
        self.status_at(Utc::now())
    }

    pub fn status_at(&mut self, now: DateTime<Utc>) -> RateLimitStatus {
        self.prune(now);

        let used_requests = self.requests.len() as u64;
        let used_tokens: u64 = self
            .tokens
            .iter()
            .fold(0u64, |sum, (_, count)| sum.saturating_add(*count));

        let mut requests_remaining = self.requests_limit.saturating_sub(used_requests);
        let mut tokens_remaining = self.tokens_limit.saturating_sub(used_tokens);
        let mut requests_reset_at = self
            .requests
            .iter()
            .min()
            .map_or(now, |oldest| *oldest + self.window);
        let mut tokens_reset_at = self
            .tokens
            .iter()
            .map(|(ts, _)| ts)
            .min()
            .map_or(now, |oldest| *oldest + self.window);

        if let Some(observed) = self.observed_requests.filter(|o| o.reset_at > now) {
            requests_remaining = requests_remaining.min(observed.remaining);
            requests_reset_at = observed.reset_at;
        }
        if let Some(observed) = self.observed_tokens.filter(|o| o.reset_at > now) {
            tokens_remaining = tokens_remaining.min(observed.remaining);
            tokens_reset_at = observed.reset_at;
        }

        let is_limited = requests_remaining == 0 || tokens_remaining == 0;
        let level = LimitLevel::from_percent(
            used_percent(requests_remaining, self.requests_limit)
                .max(used_percent(tokens_remaining, self.tokens_limit)),
        );

        RateLimitStatus {
            requests_remaining,
            requests_limit: self.requests_limit,
            requests_reset_at,
            tokens_remaining,
            tokens_limit: self.tokens_limit,
            tokens_reset_at,
            is_limited,
            level,
        }
    }

    pub fn update_limits(&mut self, observed: ObservedLimits) {
        self.update_limits_at(observed, Utc::now());
    }

    /// Overrides limits and remaining counts with externally observed values.
    ///
    /// A reset time that is still in the future is kept; an elapsed one moves
    /// to one window from `now`.
    pub fn update_limits_at(&mut self, observed: ObservedLimits, now: DateTime<Utc>) {
        if let Some(limit) = observed.requests_limit {
            self.requests_limit = limit;
        }
        if let Some(limit) = observed.tokens_limit {
            self.tokens_limit = limit;
        }
        if let Some(remaining) = observed.requests_remaining {
            self.observed_requests = Some(Observation {
                remaining,
                reset_at: self.next_reset(self.observed_requests, now),
            });
        }
        if let Some(remaining) = observed.tokens_remaining {
            self.observed_tokens = Some(Observation {
                remaining,
                reset_at: self.next_reset(self.observed_tokens, now),
            });
        }
    }

    pub fn window(&self) -> Duration {
        self.window.to_std().unwrap_or(DEFAULT_WINDOW)
    }

    fn next_reset(&self, previous: Option<Observation>, now: DateTime<Utc>) -> DateTime<Utc> {
        match previous {
            Some(observation) if observation.reset_at > now => observation.reset_at,
            _ => now + self.window,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        // Events recorded from transcript timestamps can arrive out of order.
        let cutoff = now - self.window;
        self.requests.retain(|ts| *ts > cutoff);
        self.tokens.retain(|(ts, _)| *ts > cutoff);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-02-09T16:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc)
    }

    #[test]
    fn remaining_clamps_at_zero_and_limits_at_the_limit() {
        let mut tracker = RateLimitTracker::default();
        let now = t0();
        for _ in 0..119 {
            tracker.record_request_at(now);
        }
        let status = tracker.status_at(now);
        assert_eq!(status.requests_remaining, 1);
        assert!(!status.is_limited);

        tracker.record_request_at(now);
        let status = tracker.status_at(now);
        assert_eq!(status.requests_remaining, 0);
        assert!(status.is_limited);
        assert_eq!(status.level, LimitLevel::Critical);

        for _ in 0..30 {
            tracker.record_request_at(now);
        }
        assert_eq!(tracker.status_at(now).requests_remaining, 0);
    }

    #[test]
    fn token_volume_alone_can_limit() {
        let mut tracker = RateLimitTracker::default();
        let now = t0();
        tracker.record_request_at(now);
        tracker.record_token_usage_at(60_000, now);
        let status = tracker.status_at(now);
        assert_eq!(status.tokens_remaining, 40_000);
        assert_eq!(status.level, LimitLevel::Warning);
        assert!(!status.is_limited);

        tracker.record_token_usage_at(40_000, now);
        let status = tracker.status_at(now);
        assert_eq!(status.tokens_remaining, 0);
        assert!(status.is_limited);
    }

    #[test]
    fn events_leave_the_window() {
        let mut tracker = RateLimitTracker::default();
        let start = t0();
        tracker.record_request_at(start);
        tracker.record_token_usage_at(5_000, start);
        tracker.record_request_at(start + TimeDelta::seconds(30));

        let status = tracker.status_at(start + TimeDelta::seconds(45));
        assert_eq!(status.requests_remaining, 118);
        assert_eq!(status.requests_reset_at, start + TimeDelta::seconds(60));

        let status = tracker.status_at(start + TimeDelta::seconds(61));
        assert_eq!(status.requests_remaining, 119);
        assert_eq!(status.tokens_remaining, 100_000);
        assert_eq!(status.level, LimitLevel::Ok);
        assert_eq!(
            status.requests_reset_at,
            start + TimeDelta::seconds(90)
        );
    }

    #[test]
    fn out_of_order_events_are_pruned() {
        let mut tracker = RateLimitTracker::default();
        let now = t0();
        tracker.record_request_at(now);
        tracker.record_request_at(now - TimeDelta::seconds(600));
        tracker.record_token_usage_at(7, now - TimeDelta::seconds(600));

        let status = tracker.status_at(now);
        assert_eq!(status.requests_remaining, 119);
        assert_eq!(status.tokens_remaining, DEFAULT_TOKENS_PER_WINDOW);
        assert_eq!(status.requests_reset_at, now + TimeDelta::seconds(60));
    }

    #[test]
    fn level_thresholds() {
        assert_eq!(LimitLevel::from_percent(0.0), LimitLevel::Ok);
        assert_eq!(LimitLevel::from_percent(49.9), LimitLevel::Ok);
        assert_eq!(LimitLevel::from_percent(50.0), LimitLevel::Warning);
        assert_eq!(LimitLevel::from_percent(80.0), LimitLevel::Critical);
    }

    #[test]
    fn observed_limits_override_and_keep_pending_reset() {
        let mut tracker = RateLimitTracker::default();
        let now = t0();
        tracker.update_limits_at(
            ObservedLimits {
                requests_limit: Some(50),
                requests_remaining: Some(10),
                tokens_limit: None,
                tokens_remaining: None,
            },
            now,
        );
        let status = tracker.status_at(now);
        assert_eq!(status.requests_limit, 50);
        assert_eq!(status.requests_remaining, 10);
        assert_eq!(status.requests_reset_at, now + TimeDelta::seconds(60));
        assert_eq!(status.tokens_limit, DEFAULT_TOKENS_PER_WINDOW);

        let later = now + TimeDelta::seconds(20);
        tracker.update_limits_at(
            ObservedLimits {
                requests_remaining: Some(5),
                ..ObservedLimits::default()
            },
            later,
        );
        let status = tracker.status_at(later);
        assert_eq!(status.requests_remaining, 5);
        assert_eq!(status.requests_reset_at, now + TimeDelta::seconds(60));

        let after_reset = now + TimeDelta::seconds(70);
        tracker.update_limits_at(
            ObservedLimits {
                requests_remaining: Some(40),
                ..ObservedLimits::default()
            },
            after_reset,
        );
        let status = tracker.status_at(after_reset);
        assert_eq!(status.requests_remaining, 40);
        assert_eq!(
            status.requests_reset_at,
            after_reset + TimeDelta::seconds(60)
        );
    }

    #[test]
    fn custom_settings_apply() {
        let mut tracker = RateLimitTracker::new(RateLimitSettings {
            requests_per_window: 2,
            tokens_per_window: 10,
            window: Duration::from_secs(10),
        });
        let now = t0();
        tracker.record_request_at(now);
        let status = tracker.status_at(now);
        assert_eq!(status.requests_remaining, 1);
        assert!((status.usage_percent() - 50.0).abs() < f64::EPSILON);
        assert_eq!(tracker.window(), Duration::from_secs(10));
    }
}
