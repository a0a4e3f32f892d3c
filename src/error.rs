use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("projects directory not found: {}", .0.display())]
    RootMissing(PathBuf),
    #[error("no sessions found under {}", .0.display())]
    NoSessions(PathBuf),
    #[error("failed to scan {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures raised by a transcript tailer.
///
/// `Setup` and `Notify` only come out of the constructor. `Notifier` and
/// `Read` are delivered on the tailer's error channel while it keeps running.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to start watching {}: {source}", .path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to attach change notifications for {}: {source}", .path.display())]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("change notification error: {0}")]
    Notifier(#[source] notify::Error),
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WatchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Notifier(_) | Self::Read { .. })
    }
}

#[derive(Debug, Error)]
#[error("malformed assistant entry `{excerpt}`: {source}")]
pub struct ParseError {
    pub excerpt: String,
    #[source]
    pub source: serde_json::Error,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("session already tracked: {0}")]
    DuplicateSession(String),
    #[error("unknown session: {0}")]
    UnknownSession(String),
}
