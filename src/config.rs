use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::rate_limit::{
    DEFAULT_REQUESTS_PER_WINDOW, DEFAULT_TOKENS_PER_WINDOW, DEFAULT_WINDOW, RateLimitSettings,
};

const CONFIG_SCHEMA_VERSION: u32 = 2;
const DEFAULT_CACHE_TTL_MS: u64 = 5_000;
const DEFAULT_TAIL_MAX_LINES: usize = 1_000;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const MIN_POLL_INTERVAL_MS: u64 = 50;
const DEFAULT_ACTIVE_WINDOW_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub schema_version: u32,
    pub rate_limits: RateLimitConfig,
    pub pricing: PricingConfig,
    pub cache_ttl_ms: u64,
    pub tail_max_lines: usize,
    pub poll_interval_ms: u64,
    pub max_sessions: Option<usize>,
    /// Only transcripts modified this recently are followed live. 0 follows
    /// every transcript.
    pub active_window_secs: u64,
    pub projects_dir: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_window: u64,
    pub tokens_per_window: u64,
    pub window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PricingConfig {
    pub aliases: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, ModelPricingOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct ModelPricingOverride {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: Option<f64>,
    pub cache_write_per_million: Option<f64>,
    pub context_window: Option<u64>,
}

/// Effective settings after environment overrides are applied.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub poll_interval: Duration,
    pub cache_ttl: Duration,
    pub tail_max_lines: usize,
    pub max_sessions: Option<usize>,
    pub active_window: Option<Duration>,
    pub projects_path: PathBuf,
    pub rate_limits: RateLimitSettings,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            rate_limits: RateLimitConfig::default(),
            pricing: PricingConfig::default(),
            cache_ttl_ms: DEFAULT_CACHE_TTL_MS,
            tail_max_lines: DEFAULT_TAIL_MAX_LINES,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_sessions: None,
            active_window_secs: DEFAULT_ACTIVE_WINDOW_SECS,
            projects_dir: None,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_window: DEFAULT_REQUESTS_PER_WINDOW,
            tokens_per_window: DEFAULT_TOKENS_PER_WINDOW,
            window_seconds: DEFAULT_WINDOW.as_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn settings(&self) -> RateLimitSettings {
        RateLimitSettings {
            requests_per_window: self.requests_per_window,
            tokens_per_window: self.tokens_per_window,
            window: Duration::from_secs(self.window_seconds),
        }
    }
}

impl MonitorConfig {
    pub fn load_or_init() -> Result<Self> {
        Self::load_or_init_at(&config_path())
    }

    pub fn load_or_init_at(cfg_path: &Path) -> Result<Self> {
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: MonitorConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save_at(cfg_path)?;
            }
            Ok(parsed)
        } else {
            let cfg = MonitorConfig::default();
            cfg.save_at(cfg_path)?;
            Ok(cfg)
        }
    }

    pub fn save_at(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Merges file values with `CLAUDE_MONITOR_*` environment overrides.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        let poll_ms = env_u64("CLAUDE_MONITOR_POLL_MS", self.poll_interval_ms)
            .max(MIN_POLL_INTERVAL_MS);
        let max_sessions = env_u64("CLAUDE_MONITOR_MAX_SESSIONS", 0);
        let active_window_secs =
            env_u64("CLAUDE_MONITOR_ACTIVE_WINDOW_SECS", self.active_window_secs);
        RuntimeSettings {
            poll_interval: Duration::from_millis(poll_ms),
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            tail_max_lines: self.tail_max_lines,
            max_sessions: if max_sessions > 0 {
                usize::try_from(max_sessions).ok()
            } else {
                self.max_sessions
            },
            active_window: (active_window_secs > 0)
                .then(|| Duration::from_secs(active_window_secs)),
            projects_path: self.projects_root(),
            rate_limits: self.rate_limits.settings(),
        }
    }

    pub fn projects_root(&self) -> PathBuf {
        self.projects_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(projects_path)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }

        let defaults = RateLimitConfig::default();
        if self.rate_limits.requests_per_window == 0 {
            self.rate_limits.requests_per_window = defaults.requests_per_window;
            changed = true;
        }
        if self.rate_limits.tokens_per_window == 0 {
            self.rate_limits.tokens_per_window = defaults.tokens_per_window;
            changed = true;
        }
        if self.rate_limits.window_seconds == 0 {
            self.rate_limits.window_seconds = defaults.window_seconds;
            changed = true;
        }
        if self.tail_max_lines == 0 {
            self.tail_max_lines = DEFAULT_TAIL_MAX_LINES;
            changed = true;
        }
        if self.poll_interval_ms < MIN_POLL_INTERVAL_MS {
            self.poll_interval_ms = DEFAULT_POLL_INTERVAL_MS;
            changed = true;
        }
        if self.max_sessions == Some(0) {
            self.max_sessions = None;
            changed = true;
        }
        if normalize_optional_string(&mut self.projects_dir) {
            changed = true;
        }
        if normalize_pricing_config(&mut self.pricing) {
            changed = true;
        }

        changed
    }
}

pub fn claude_home() -> PathBuf {
    if let Ok(custom) = env::var("CLAUDE_HOME") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn projects_path() -> PathBuf {
    claude_home().join("projects")
}

pub fn config_path() -> PathBuf {
    claude_home().join("usage-monitor-config.json")
}

pub fn history_path() -> PathBuf {
    claude_home().join("usage-monitor-history.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn normalize_optional_string(value: &mut Option<String>) -> bool {
    if let Some(item) = value.as_mut() {
        let trimmed = item.trim().to_string();
        if trimmed.is_empty() {
            *value = None;
            return true;
        }
        if *item != trimmed {
            *item = trimmed;
            return true;
        }
    }
    false
}

fn normalize_pricing_config(pricing: &mut PricingConfig) -> bool {
    let mut normalized_aliases: BTreeMap<String, String> = BTreeMap::new();
    for (raw_key, raw_target) in &pricing.aliases {
        let key = raw_key.trim().to_ascii_lowercase();
        let target = raw_target.trim().to_ascii_lowercase();
        if key.is_empty() || target.is_empty() || key == target {
            continue;
        }
        normalized_aliases.insert(key, target);
    }

    let mut normalized_overrides: BTreeMap<String, ModelPricingOverride> = BTreeMap::new();
    for (raw_key, override_pricing) in &pricing.overrides {
        let key = raw_key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let mut override_pricing = override_pricing.clone();
        override_pricing.input_per_million = clamp_price(override_pricing.input_per_million);
        override_pricing.output_per_million = clamp_price(override_pricing.output_per_million);
        override_pricing.cache_read_per_million =
            override_pricing.cache_read_per_million.map(clamp_price);
        override_pricing.cache_write_per_million =
            override_pricing.cache_write_per_million.map(clamp_price);
        if override_pricing.context_window == Some(0) {
            override_pricing.context_window = None;
        }
        normalized_overrides.insert(key, override_pricing);
    }

    let mut changed = false;
    if pricing.aliases != normalized_aliases {
        pricing.aliases = normalized_aliases;
        changed = true;
    }
    if pricing.overrides != normalized_overrides {
        pricing.overrides = normalized_overrides;
        changed = true;
    }
    changed
}

fn clamp_price(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = MonitorConfig::default();
        let settings = cfg.rate_limits.settings();
        assert_eq!(settings.requests_per_window, 120);
        assert_eq!(settings.tokens_per_window, 100_000);
        assert_eq!(settings.window, Duration::from_secs(60));
        assert_eq!(cfg.cache_ttl_ms, 5_000);
        assert_eq!(cfg.tail_max_lines, 1_000);
        assert_eq!(
            cfg.runtime_settings().active_window,
            Some(Duration::from_secs(86_400))
        );
    }

    #[test]
    fn zero_active_window_follows_every_transcript() {
        let cfg = MonitorConfig {
            active_window_secs: 0,
            ..MonitorConfig::default()
        };
        assert_eq!(cfg.runtime_settings().active_window, None);
    }

    #[test]
    fn load_or_init_creates_file_then_reads_it_back() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");

        let created = MonitorConfig::load_or_init_at(&path).expect("create");
        assert!(path.exists());

        let loaded = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(created, loaded);
    }

    #[test]
    fn partial_file_is_filled_with_defaults_and_migrated() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"schema_version":1,"rate_limits":{"requests_per_window":0,"tokens_per_window":5000},"projects_dir":"  "}"#,
        )
        .expect("write");

        let cfg = MonitorConfig::load_or_init_at(&path).expect("load");
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.rate_limits.requests_per_window, 120);
        assert_eq!(cfg.rate_limits.tokens_per_window, 5_000);
        assert_eq!(cfg.rate_limits.window_seconds, 60);
        assert_eq!(cfg.projects_dir, None);

        let rewritten = fs::read_to_string(&path).expect("read");
        assert!(rewritten.contains("\"schema_version\": 2"));
    }

    #[test]
    fn invalid_json_is_reported_with_path() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("config.json");
        fs::write(&path, "{not json").expect("write");

        let err = MonitorConfig::load_or_init_at(&path).expect_err("invalid");
        assert!(format!("{err:#}").contains("invalid JSON"));
    }

    #[test]
    fn pricing_normalization_lowercases_keys_and_clamps_prices() {
        let mut cfg = MonitorConfig::default();
        cfg.pricing
            .aliases
            .insert(" Team-Model ".to_string(), " CLAUDE-3-HAIKU ".to_string());
        cfg.pricing.aliases.insert("same".to_string(), "same".to_string());
        cfg.pricing.overrides.insert(
            " Claude-Opus-4-1 ".to_string(),
            ModelPricingOverride {
                input_per_million: -1.0,
                output_per_million: f64::NAN,
                cache_read_per_million: Some(1.5),
                cache_write_per_million: None,
                context_window: Some(0),
            },
        );

        assert!(cfg.normalize_and_migrate());
        assert_eq!(
            cfg.pricing.aliases.get("team-model").map(String::as_str),
            Some("claude-3-haiku")
        );
        assert!(!cfg.pricing.aliases.contains_key("same"));
        let entry = cfg.pricing.overrides.get("claude-opus-4-1").expect("override");
        assert_eq!(entry.input_per_million, 0.0);
        assert_eq!(entry.output_per_million, 0.0);
        assert_eq!(entry.cache_read_per_million, Some(1.5));
        assert_eq!(entry.context_window, None);

        assert!(!cfg.normalize_and_migrate());
    }

    #[test]
    fn explicit_projects_dir_wins_over_home() {
        let cfg = MonitorConfig {
            projects_dir: Some("/srv/transcripts".to_string()),
            ..MonitorConfig::default()
        };
        assert_eq!(cfg.projects_root(), PathBuf::from("/srv/transcripts"));
    }
}
