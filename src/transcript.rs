//! Classification and parsing of transcript lines.
//!
//! A transcript is newline-delimited JSON. Only top-level `"type":"assistant"`
//! entries carry a usage object; everything else is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

const EXCERPT_LEN: usize = 80;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageEntry {
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub timestamp: Option<DateTime<Utc>>,
}

impl UsageEntry {
    /// `input + output`. Cache tokens are tracked separately.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenSummary {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
    pub entries: u64,
    pub model: Option<String>,
    pub last_entry_at: Option<DateTime<Utc>>,
}

impl TokenSummary {
    pub fn add(&mut self, entry: &UsageEntry) {
        self.input_tokens = self.input_tokens.saturating_add(entry.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(entry.output_tokens);
        self.cache_read_tokens = self
            .cache_read_tokens
            .saturating_add(entry.cache_read_tokens);
        self.cache_creation_tokens = self
            .cache_creation_tokens
            .saturating_add(entry.cache_creation_tokens);
        self.total_tokens = self.input_tokens.saturating_add(self.output_tokens);
        self.entries += 1;
        if entry.model.is_some() {
            self.model = entry.model.clone();
        }
        if entry.timestamp.is_some() {
            self.last_entry_at = entry.timestamp;
        }
    }

    /// Folds every usage-bearing line into a summary. Malformed lines are
    /// skipped; the number skipped is returned alongside.
    pub fn from_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> (Self, usize) {
        let mut summary = Self::default();
        let mut skipped = 0usize;
        for line in lines {
            match parse_usage_line(line) {
                Ok(Some(entry)) => summary.add(&entry),
                Ok(None) => {}
                Err(_) => skipped += 1,
            }
        }
        (summary, skipped)
    }
}

/// Cheap structural check for a top-level `"type": "assistant"` pair.
/// Never deserializes.
pub fn looks_like_assistant(line: &str) -> bool {
    let mut rest = line;
    while let Some(idx) = rest.find("\"type\"") {
        rest = &rest[idx + "\"type\"".len()..];
        let after_key = rest.trim_start();
        if let Some(value) = after_key.strip_prefix(':')
            && value.trim_start().starts_with("\"assistant\"")
        {
            return true;
        }
    }
    false
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    message: Option<RawMessage>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Deserialize, Default)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
}

/// Parses one raw transcript line.
///
/// Returns `Ok(None)` for lines that are not usage-bearing (other types,
/// blank lines, assistant entries without usage) and `Err` only for lines
/// that pass [`looks_like_assistant`] but fail to deserialize.
pub fn parse_usage_line(line: &str) -> Result<Option<UsageEntry>, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || !looks_like_assistant(trimmed) {
        return Ok(None);
    }

    let raw: RawEntry = serde_json::from_str(trimmed).map_err(|source| ParseError {
        excerpt: excerpt(trimmed),
        source,
    })?;
    if raw.kind != "assistant" {
        return Ok(None);
    }

    let RawEntry {
        timestamp,
        message,
        usage,
        ..
    } = raw;
    let (role, model, nested_usage) = match message {
        Some(message) => (message.role, message.model, message.usage),
        None => (None, None, None),
    };
    if role.as_deref().is_some_and(|role| role != "assistant") {
        return Ok(None);
    }
    let Some(usage) = nested_usage.or(usage) else {
        return Ok(None);
    };

    Ok(Some(UsageEntry {
        model: model.filter(|model| !model.trim().is_empty()),
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        cache_read_tokens: usage.cache_read_input_tokens,
        cache_creation_tokens: usage.cache_creation_input_tokens,
        timestamp: timestamp.as_deref().and_then(parse_utc_timestamp),
    }))
}

fn parse_utc_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

fn excerpt(line: &str) -> String {
    if line.len() <= EXCERPT_LEN {
        return line.to_string();
    }
    let mut end = EXCERPT_LEN;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    const ASSISTANT: &str = r#"{"type":"assistant","timestamp":"2026-02-09T16:34:13Z","message":{"role":"assistant","model":"claude-sonnet-4-5-20250929","usage":{"input_tokens":120,"output_tokens":45,"cache_creation_input_tokens":300,"cache_read_input_tokens":9000}}}"#;

    #[test]
    fn prefilter_matches_only_top_level_assistant_type() {
        assert!(looks_like_assistant(ASSISTANT));
        assert!(looks_like_assistant(r#"{"type" : "assistant"}"#));
        assert!(!looks_like_assistant(
            r#"{"type":"user","message":{"role":"user","content":"hi"}}"#
        ));
        assert!(!looks_like_assistant(r#"{"role":"assistant"}"#));
    }

    #[test]
    fn parses_assistant_usage() {
        let entry = parse_usage_line(ASSISTANT).expect("parse").expect("entry");
        assert_eq!(entry.model.as_deref(), Some("claude-sonnet-4-5-20250929"));
        assert_eq!(entry.input_tokens, 120);
        assert_eq!(entry.output_tokens, 45);
        assert_eq!(entry.cache_creation_tokens, 300);
        assert_eq!(entry.cache_read_tokens, 9000);
        assert_eq!(entry.total_tokens(), 165);
        assert!(entry.timestamp.is_some());
    }

    #[test]
    fn non_assistant_lines_are_not_applicable() {
        let user = r#"{"type":"user","message":{"role":"user","content":"hello"}}"#;
        assert_eq!(parse_usage_line(user).expect("user"), None);
        assert_eq!(parse_usage_line("").expect("blank"), None);
        assert_eq!(parse_usage_line("not json at all").expect("garbage"), None);

        let no_usage = r#"{"type":"assistant","message":{"role":"assistant","model":"m"}}"#;
        assert_eq!(parse_usage_line(no_usage).expect("no usage"), None);
    }

    #[test]
    fn malformed_assistant_line_is_a_parse_error() {
        let broken = r#"{"type":"assistant","message":{"usage":{"input_tokens":"#;
        let err = parse_usage_line(broken).expect_err("broken");
        assert!(err.excerpt.starts_with("{\"type\":\"assistant\""));
    }

    #[test]
    fn summary_skips_bad_lines_and_keeps_total_as_input_plus_output() {
        let lines = [
            ASSISTANT,
            r#"{"type":"user","message":{"role":"user"}}"#,
            r#"{"type":"assistant", broken"#,
            r#"{"type":"assistant","message":{"role":"assistant","model":"claude-opus-4-1","usage":{"input_tokens":10,"output_tokens":5}}}"#,
        ];
        let (summary, skipped) = TokenSummary::from_lines(lines);
        assert_eq!(skipped, 1);
        assert_eq!(summary.entries, 2);
        assert_eq!(summary.input_tokens, 130);
        assert_eq!(summary.output_tokens, 50);
        assert_eq!(summary.cache_read_tokens, 9000);
        assert_eq!(summary.cache_creation_tokens, 300);
        assert_eq!(summary.total_tokens, 180);
        assert_eq!(summary.model.as_deref(), Some("claude-opus-4-1"));
    }
}
