//! Transcript discovery under a projects root.
//!
//! The root holds one directory per project; transcripts are `.jsonl` files
//! anywhere below a project directory. Sub-agent transcripts carry `agent`
//! in their file name and are not primary sessions.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::DiscoveryError;
use crate::fs::{DirEntry, FileSystem, is_not_found};

const TRANSCRIPT_EXTENSION: &str = "jsonl";
const AGENT_MARKER: &str = "agent";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub path: PathBuf,
    pub project: String,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Newest first.
    pub sessions: Vec<SessionInfo>,
    /// Project directories that could not be fully scanned.
    pub error_count: usize,
}

pub fn discover(
    fs: &dyn FileSystem,
    root: &Path,
    max_results: Option<usize>,
) -> Result<Discovery, DiscoveryError> {
    match fs.stat(root) {
        Ok(stat) if stat.is_dir => {}
        Ok(_) => return Err(DiscoveryError::RootMissing(root.to_path_buf())),
        Err(err) if is_not_found(&err) => {
            return Err(DiscoveryError::RootMissing(root.to_path_buf()));
        }
        Err(source) => {
            return Err(DiscoveryError::Io {
                path: root.to_path_buf(),
                source,
            });
        }
    }

    let projects = fs.list_dir(root).map_err(|source| DiscoveryError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    let mut candidates: Vec<(String, DirEntry)> = Vec::new();
    let mut error_count = 0usize;
    for project_dir in projects.iter().filter(|entry| entry.stat.is_dir) {
        let project = file_name_of(&project_dir.path);
        let result = fs.walk(&project_dir.path, &mut |entry| {
            if is_transcript(entry) {
                candidates.push((project.clone(), entry.clone()));
            }
        });
        if let Err(err) = result {
            error_count += 1;
            warn!(project = %project, error = %err, "project scan incomplete");
        }
    }

    let mut sessions = assign_session_ids(root, candidates);
    sessions.sort_by(|a, b| {
        b.modified
            .cmp(&a.modified)
            .then_with(|| a.path.cmp(&b.path))
    });
    if let Some(limit) = max_results {
        sessions.truncate(limit);
    }

    debug!(root = %root.display(), sessions = sessions.len(), error_count, "discovery finished");
    Ok(Discovery {
        sessions,
        error_count,
    })
}

/// The most recently modified eligible transcript under `root`.
pub fn find_active(fs: &dyn FileSystem, root: &Path) -> Result<SessionInfo, DiscoveryError> {
    discover(fs, root, Some(1))?
        .sessions
        .into_iter()
        .next()
        .ok_or_else(|| DiscoveryError::NoSessions(root.to_path_buf()))
}

fn is_transcript(entry: &DirEntry) -> bool {
    if entry.stat.is_dir || entry.stat.len == 0 {
        return false;
    }
    let has_extension = entry
        .path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(TRANSCRIPT_EXTENSION));
    let is_agent = entry
        .path
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.to_ascii_lowercase().contains(AGENT_MARKER));
    has_extension && !is_agent
}

/// Ids are file stems; stems seen more than once are qualified with their
/// path relative to the root.
fn assign_session_ids(root: &Path, candidates: Vec<(String, DirEntry)>) -> Vec<SessionInfo> {
    let mut stem_counts: HashMap<String, usize> = HashMap::new();
    for (_, entry) in &candidates {
        *stem_counts.entry(stem_of(&entry.path)).or_default() += 1;
    }

    candidates
        .into_iter()
        .map(|(project, entry)| {
            let stem = stem_of(&entry.path);
            let session_id = if stem_counts.get(&stem).copied().unwrap_or(0) > 1 {
                qualified_id(root, &entry.path)
            } else {
                stem
            };
            SessionInfo {
                session_id,
                path: entry.path,
                project,
                modified: DateTime::<Utc>::from(entry.stat.modified),
            }
        })
        .collect()
}

/// `path` relative to `root` without its extension, joined with `/`.
pub fn qualified_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path).with_extension("");
    relative
        .components()
        .map(|part| part.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemoryFileSystem, OsFileSystem};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs)
    }

    fn tree() -> MemoryFileSystem {
        let fs = MemoryFileSystem::new();
        fs.write_file("/root/alpha/one.jsonl", "{}\n", at(10));
        fs.write_file("/root/alpha/agent-1234.jsonl", "{}\n", at(99));
        fs.write_file("/root/alpha/empty.jsonl", "", at(98));
        fs.write_file("/root/alpha/notes.txt", "hello", at(97));
        fs.write_file("/root/beta/nested/two.jsonl", "{}\n", at(20));
        fs.write_file("/root/stray.jsonl", "{}\n", at(50));
        fs
    }

    #[test]
    fn filters_agent_empty_and_foreign_files() {
        let fs = tree();
        let found = discover(&fs, Path::new("/root"), None).expect("discover");

        let ids: Vec<&str> = found
            .sessions
            .iter()
            .map(|session| session.session_id.as_str())
            .collect();
        assert_eq!(ids, vec!["two", "one"]);
        assert_eq!(found.sessions[0].project, "beta");
        assert_eq!(found.sessions[1].project, "alpha");
        assert_eq!(found.error_count, 0);
    }

    #[test]
    fn active_is_newest_eligible_file() {
        let fs = tree();
        let active = find_active(&fs, Path::new("/root")).expect("active");
        assert_eq!(active.session_id, "two");
        assert_eq!(active.path, PathBuf::from("/root/beta/nested/two.jsonl"));
    }

    #[test]
    fn missing_root_and_empty_root_are_distinct() {
        let fs = MemoryFileSystem::new();
        let err = discover(&fs, Path::new("/nowhere"), None).expect_err("missing");
        assert!(matches!(err, DiscoveryError::RootMissing(_)));

        fs.mkdir_all(Path::new("/root/alpha")).expect("mkdir");
        let found = discover(&fs, Path::new("/root"), None).expect("empty ok");
        assert!(found.sessions.is_empty());
        let err = find_active(&fs, Path::new("/root")).expect_err("none");
        assert!(matches!(err, DiscoveryError::NoSessions(_)));
    }

    #[test]
    fn same_file_name_in_two_projects_gives_two_sessions() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/root/alpha/shared.jsonl", "{}\n", at(1));
        fs.write_file("/root/beta/shared.jsonl", "{}\n", at(2));
        fs.write_file("/root/beta/unique.jsonl", "{}\n", at(3));

        let found = discover(&fs, Path::new("/root"), None).expect("discover");
        let ids: Vec<&str> = found
            .sessions
            .iter()
            .map(|session| session.session_id.as_str())
            .collect();
        assert_eq!(ids, vec!["unique", "beta/shared", "alpha/shared"]);
    }

    #[test]
    fn unreadable_project_is_counted_not_fatal() {
        let fs = tree();
        fs.deny("/root/beta");
        let found = discover(&fs, Path::new("/root"), None).expect("discover");
        assert_eq!(found.error_count, 1);
        assert_eq!(found.sessions.len(), 1);
        assert_eq!(found.sessions[0].session_id, "one");
    }

    #[test]
    fn max_results_truncates_after_sorting() {
        let fs = MemoryFileSystem::new();
        for n in 0..5u64 {
            fs.write_file(format!("/root/p/s{n}.jsonl"), "{}\n", at(n));
        }
        let found = discover(&fs, Path::new("/root"), Some(2)).expect("discover");
        let ids: Vec<&str> = found
            .sessions
            .iter()
            .map(|session| session.session_id.as_str())
            .collect();
        assert_eq!(ids, vec!["s4", "s3"]);
    }

    #[test]
    fn discovers_on_real_filesystem() {
        let dir = TempDir::new().expect("tempdir");
        let project = dir.path().join("my-project");
        std::fs::create_dir_all(&project).expect("mkdir");
        std::fs::write(project.join("abc.jsonl"), "{}\n").expect("write");
        std::fs::write(project.join("agent-abc.jsonl"), "{}\n").expect("write");

        let found = discover(&OsFileSystem, dir.path(), None).expect("discover");
        assert_eq!(found.sessions.len(), 1);
        assert_eq!(found.sessions[0].session_id, "abc");
        assert_eq!(found.sessions[0].project, "my-project");
    }
}
