use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use tracing::debug;

use crate::fs::{FileSystem, ReadSeek};
use crate::transcript::TokenSummary;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_LINES: usize = 1_000;

const TAIL_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Clone)]
struct CacheEntry {
    modified: SystemTime,
    summary: TokenSummary,
    written_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, modified: SystemTime, ttl: Duration) -> bool {
        self.modified == modified && self.written_at.elapsed() < ttl
    }
}

/// Memoizes per-file token summaries.
///
/// An entry is served only while the file's mtime is unchanged and the entry
/// is younger than the TTL. The lock is held across check, read and install,
/// so concurrent callers for one file never parse it twice at once.
pub struct TranscriptCache {
    fs: Arc<dyn FileSystem>,
    ttl: Duration,
    entries: Mutex<HashMap<PathBuf, CacheEntry>>,
}

impl TranscriptCache {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self::with_ttl(fs, DEFAULT_TTL)
    }

    pub fn with_ttl(fs: Arc<dyn FileSystem>, ttl: Duration) -> Self {
        Self {
            fs,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Token summary over the last `max_lines` lines of `path`.
    ///
    /// A file that cannot be stat'ed yields an empty summary.
    pub fn parse(&self, path: &Path, max_lines: usize) -> TokenSummary {
        let stat = match self.fs.stat(path) {
            Ok(stat) => stat,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "transcript unavailable; empty summary");
                return TokenSummary::default();
            }
        };

        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(path)
            && entry.is_valid(stat.modified, self.ttl)
        {
            return entry.summary.clone();
        }

        let lines = match self.read_tail(path, stat.len, max_lines) {
            Ok(lines) => lines,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "transcript vanished during read");
                return TokenSummary::default();
            }
        };
        let (summary, skipped) = TokenSummary::from_lines(lines.iter().map(String::as_str));
        if skipped > 0 {
            debug!(path = %path.display(), skipped, "skipped malformed transcript lines");
        }

        entries.insert(
            path.to_path_buf(),
            CacheEntry {
                modified: stat.modified,
                summary: summary.clone(),
                written_at: Instant::now(),
            },
        );
        summary
    }

    pub fn invalidate(&self, path: &Path) {
        self.entries.lock().remove(path);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read_tail(&self, path: &Path, len: u64, max_lines: usize) -> io::Result<Vec<String>> {
        let mut file = self.fs.open(path)?;
        read_last_lines(file.as_mut(), len, max_lines)
    }
}

/// Reads backwards in chunks until `max_lines` complete lines are in hand
/// or the start of the file is reached.
fn read_last_lines(file: &mut dyn ReadSeek, len: u64, max_lines: usize) -> io::Result<Vec<String>> {
    if max_lines == 0 || len == 0 {
        return Ok(Vec::new());
    }

    let mut start = len;
    let mut tail: Vec<u8> = Vec::new();
    loop {
        let chunk = TAIL_CHUNK.min(start);
        start -= chunk;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; chunk as usize];
        file.read_exact(&mut buf)?;
        buf.extend_from_slice(&tail);
        tail = buf;

        let newlines = tail.iter().filter(|byte| **byte == b'\n').count();
        if start == 0 || newlines > max_lines {
            break;
        }
    }

    let text = String::from_utf8_lossy(&tail);
    let mut lines: Vec<&str> = text.lines().collect();
    if start > 0 && !lines.is_empty() {
        // First line is cut mid-way by the chunk boundary.
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines
        .into_iter()
        .skip(skip)
        .filter(|line| !line.trim().is_empty())
        .map(ToString::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemoryFileSystem;
    use std::io::Cursor;
    use std::thread;

    fn line(input: u64) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"role":"assistant","model":"claude-sonnet-4-5","usage":{{"input_tokens":{input},"output_tokens":10,"cache_read_input_tokens":5}}}}}}"#
        )
    }

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    fn setup() -> (Arc<MemoryFileSystem>, TranscriptCache) {
        let fs = Arc::new(MemoryFileSystem::new());
        let cache = TranscriptCache::new(fs.clone());
        (fs, cache)
    }

    #[test]
    fn unchanged_file_within_ttl_is_not_reread() {
        let (fs, cache) = setup();
        fs.write_file("/p/s.jsonl", format!("{}\n", line(100)), at(100));

        let first = cache.parse(Path::new("/p/s.jsonl"), DEFAULT_MAX_LINES);
        let second = cache.parse(Path::new("/p/s.jsonl"), DEFAULT_MAX_LINES);

        assert_eq!(first, second);
        assert_eq!(first.input_tokens, 100);
        assert_eq!(first.total_tokens, 110);
        assert_eq!(fs.open_count(), 1);
    }

    #[test]
    fn modified_file_is_reparsed_before_ttl_expiry() {
        let (fs, cache) = setup();
        fs.write_file("/p/s.jsonl", format!("{}\n", line(100)), at(100));
        assert_eq!(cache.parse(Path::new("/p/s.jsonl"), 100).input_tokens, 100);

        fs.write_file("/p/s.jsonl", format!("{}\n", line(200)), at(101));
        let summary = cache.parse(Path::new("/p/s.jsonl"), 100);
        assert_eq!(summary.input_tokens, 200);
        assert_eq!(fs.open_count(), 2);
    }

    #[test]
    fn expired_entry_is_reparsed() {
        let fs = Arc::new(MemoryFileSystem::new());
        let cache = TranscriptCache::with_ttl(fs.clone(), Duration::ZERO);
        fs.write_file("/p/s.jsonl", format!("{}\n", line(1)), at(100));

        cache.parse(Path::new("/p/s.jsonl"), 10);
        cache.parse(Path::new("/p/s.jsonl"), 10);
        assert_eq!(fs.open_count(), 2);
    }

    #[test]
    fn vanished_file_yields_empty_summary() {
        let (fs, cache) = setup();
        fs.write_file("/p/s.jsonl", format!("{}\n", line(100)), at(100));
        cache.parse(Path::new("/p/s.jsonl"), 10);
        fs.remove("/p/s.jsonl");

        assert_eq!(
            cache.parse(Path::new("/p/s.jsonl"), 10),
            TokenSummary::default()
        );
    }

    #[test]
    fn entries_are_keyed_per_path_and_clearable() {
        let (fs, cache) = setup();
        fs.write_file("/a/s.jsonl", format!("{}\n", line(1)), at(100));
        fs.write_file("/b/s.jsonl", format!("{}\n", line(2)), at(100));

        assert_eq!(cache.parse(Path::new("/a/s.jsonl"), 10).input_tokens, 1);
        assert_eq!(cache.parse(Path::new("/b/s.jsonl"), 10).input_tokens, 2);
        assert_eq!(cache.len(), 2);

        cache.invalidate(Path::new("/a/s.jsonl"));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn only_last_lines_are_counted() {
        let (fs, cache) = setup();
        let content: String = (1..=5).map(|n| format!("{}\n", line(n))).collect();
        fs.write_file("/p/s.jsonl", content, at(100));

        let summary = cache.parse(Path::new("/p/s.jsonl"), 2);
        assert_eq!(summary.input_tokens, 4 + 5);
        assert_eq!(summary.entries, 2);
    }

    #[test]
    fn read_last_lines_spans_chunk_boundaries() {
        let long = "x".repeat(40_000);
        let content = format!("first\n{long}\n{long}\nlast\n");
        let mut cursor = Cursor::new(content.clone().into_bytes());
        let lines = read_last_lines(&mut cursor, content.len() as u64, 3).expect("tail");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], long);
        assert_eq!(lines[2], "last");

        let mut cursor = Cursor::new(content.clone().into_bytes());
        let all = read_last_lines(&mut cursor, content.len() as u64, 100).expect("all");
        assert_eq!(all.first().map(String::as_str), Some("first"));
    }

    #[test]
    fn concurrent_callers_see_one_consistent_summary() {
        let (fs, cache) = setup();
        let content: String = (1..=50).map(|n| format!("{}\n", line(n))).collect();
        fs.write_file("/p/s.jsonl", content, at(100));
        let cache = Arc::new(cache);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || cache.parse(Path::new("/p/s.jsonl"), 1_000))
            })
            .collect();
        let results: Vec<TokenSummary> = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .collect();

        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(results[0].input_tokens, (1..=50).sum::<u64>());
        assert_eq!(fs.open_count(), 1);
    }
}
