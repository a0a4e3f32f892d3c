use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::registry::SessionState;

const PERSIST_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    pub project: String,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_creation_tokens: u64,
    pub total_tokens: u64,
    pub cost_usd: f64,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn from_state(state: &SessionState) -> Self {
        Self {
            session_id: state.session_id.clone(),
            project: state.project.clone(),
            model: state.model.clone(),
            input_tokens: state.input_tokens,
            output_tokens: state.output_tokens,
            cache_read_tokens: state.cache_read_tokens,
            cache_creation_tokens: state.cache_creation_tokens,
            total_tokens: state.total_tokens,
            cost_usd: state.cost_usd,
            updated_at: state.last_update.unwrap_or_else(Utc::now),
        }
    }
}

/// Keyed store of per-session totals.
pub trait HistoryStore: Send + Sync {
    /// Inserts the record or replaces the one with the same session id.
    fn save_or_update(&self, record: &SessionRecord) -> Result<()>;

    /// Up to `limit` records, most recently updated first.
    fn recent_history(&self, limit: usize) -> Result<Vec<SessionRecord>>;

    /// Writes out anything buffered.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn newest_first(records: &BTreeMap<String, SessionRecord>, limit: usize) -> Vec<SessionRecord> {
    let mut ordered: Vec<SessionRecord> = records.values().cloned().collect();
    ordered.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.session_id.cmp(&b.session_id))
    });
    ordered.truncate(limit);
    ordered
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    records: Mutex<BTreeMap<String, SessionRecord>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn save_or_update(&self, record: &SessionRecord) -> Result<()> {
        self.records
            .lock()
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        Ok(newest_first(&self.records.lock(), limit))
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct HistoryFile {
    records: BTreeMap<String, SessionRecord>,
}

#[derive(Debug)]
struct JsonState {
    file: HistoryFile,
    dirty: bool,
    last_persist_at: Option<Instant>,
}

/// Whole-table JSON file, rewritten through a temp file and a rename.
///
/// Updates are buffered and written at most once per persist interval;
/// [`HistoryStore::flush`] writes immediately.
#[derive(Debug)]
pub struct JsonHistoryStore {
    path: PathBuf,
    persist_interval: Duration,
    state: Mutex<JsonState>,
}

impl JsonHistoryStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        Self::with_interval(path, PERSIST_INTERVAL)
    }

    pub fn with_interval(path: impl Into<PathBuf>, persist_interval: Duration) -> Result<Self> {
        let path = path.into();
        let file = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", path.display()))?
        } else {
            HistoryFile::default()
        };

        Ok(Self {
            path,
            persist_interval,
            state: Mutex::new(JsonState {
                file,
                dirty: false,
                last_persist_at: None,
            }),
        })
    }

    fn persist_locked(&self, state: &mut JsonState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(&state.file)?;
        fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to move {} into place", self.path.display()))?;

        state.dirty = false;
        state.last_persist_at = Some(Instant::now());
        debug!(path = %self.path.display(), records = state.file.records.len(), "history persisted");
        Ok(())
    }
}

impl HistoryStore for JsonHistoryStore {
    fn save_or_update(&self, record: &SessionRecord) -> Result<()> {
        let mut state = self.state.lock();
        state
            .file
            .records
            .insert(record.session_id.clone(), record.clone());
        state.dirty = true;

        if let Some(last) = state.last_persist_at
            && last.elapsed() < self.persist_interval
        {
            return Ok(());
        }
        self.persist_locked(&mut state)
    }

    fn recent_history(&self, limit: usize) -> Result<Vec<SessionRecord>> {
        Ok(newest_first(&self.state.lock().file.records, limit))
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dirty {
            return Ok(());
        }
        self.persist_locked(&mut state)
    }
}
