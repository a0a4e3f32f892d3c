use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing_subscriber::{EnvFilter, fmt};

use crate::cost::normalize_model_key;

pub fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).without_time().try_init();
}

pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}K", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}

pub fn format_cost(cost_usd: f64) -> String {
    if !cost_usd.is_finite() || cost_usd <= 0.0 {
        return "$0.00".to_string();
    }
    if cost_usd < 0.01 {
        format!("${cost_usd:.4}")
    } else if cost_usd < 1.0 {
        format!("${cost_usd:.3}")
    } else {
        format!("${cost_usd:.2}")
    }
}

/// `claude-sonnet-4-5-20250929` becomes `Sonnet 4.5`.
pub fn format_model_name(model_id: &str) -> String {
    let key = normalize_model_key(model_id);
    if key.is_empty() {
        return "unknown".to_string();
    }

    let parts: Vec<&str> = key
        .strip_prefix("claude-")
        .unwrap_or(&key)
        .split('-')
        .filter(|part| !part.is_empty())
        .collect();
    let family = parts
        .iter()
        .find(|part| matches!(**part, "opus" | "sonnet" | "haiku"));
    let version: Vec<&str> = parts
        .iter()
        .copied()
        .filter(|part| part.chars().all(|ch| ch.is_ascii_digit()))
        .collect();

    match family {
        Some(family) if !version.is_empty() => {
            format!("{} {}", capitalize(family), version.join("."))
        }
        Some(family) => capitalize(family),
        None => model_id
            .trim()
            .split('-')
            .filter(|part| !part.is_empty())
            .map(capitalize)
            .collect::<Vec<_>>()
            .join("-"),
    }
}

fn capitalize(component: &str) -> String {
    let mut chars = component.chars();
    let Some(first) = chars.next() else {
        return String::new();
    };
    format!("{}{}", first.to_ascii_uppercase(), chars.as_str())
}

/// Time left until `reset_at`, such as `42s` or `3m 05s`. Past instants read `now`.
pub fn format_reset_in(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    match (reset_at - now).to_std() {
        Ok(left) if !left.is_zero() => human_duration(left),
        _ => "now".to_string(),
    }
}

fn human_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    match (secs / 3_600, secs % 3_600 / 60, secs % 60) {
        (0, 0, seconds) => format!("{seconds}s"),
        (0, minutes, seconds) => format!("{minutes}m {seconds:02}s"),
        (hours, minutes, _) => format!("{hours}h {minutes:02}m"),
    }
}

pub fn progress_bar(percent: f64, width: usize) -> String {
    let pct = percent.clamp(0.0, 100.0);
    let filled = ((pct / 100.0) * width as f64).round() as usize;
    let empty = width.saturating_sub(filled);
    format!("{}{}", "#".repeat(filled), "-".repeat(empty))
}

/// Shortens to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    if max_chars <= 3 {
        return input.chars().take(max_chars).collect();
    }
    let kept: String = input.chars().take(max_chars - 3).collect();
    format!("{kept}...")
}
