//! Incremental tailing of a growing transcript file.
//!
//! A [`Tailer`] is a single background thread that owns the byte offset for
//! one file. It wakes on a fixed poll tick or on a change notification for
//! the file's directory, reads whatever complete lines were appended, and
//! pushes them on its line channel.

use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, never, select, tick, unbounded};
use notify::EventKind;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::WatchError;
use crate::fs::FileSystem;
use crate::notifier::{ChangeNotifier, Subscription};
use crate::transcript::looks_like_assistant;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Consumer side of a line producer: a stream of lines, a stream of
/// transient errors, and a way to stop the producer.
pub trait TranscriptFeed: Send + Sync {
    fn lines(&self) -> &Receiver<String>;
    fn errors(&self) -> &Receiver<WatchError>;
    /// Stops the producer. Safe to call more than once.
    fn close(&self);
}

impl<T: TranscriptFeed + ?Sized> TranscriptFeed for Arc<T> {
    fn lines(&self) -> &Receiver<String> {
        (**self).lines()
    }

    fn errors(&self) -> &Receiver<WatchError> {
        (**self).errors()
    }

    fn close(&self) {
        (**self).close();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Created,
    BackfillSent,
    Live,
    Closed,
}

impl TailerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Created,
            1 => Self::BackfillSent,
            2 => Self::Live,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::BackfillSent => 1,
            Self::Live => 2,
            Self::Closed => 3,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TailerOptions {
    pub poll_interval: Duration,
    /// Attach an OS change notifier to the file's directory. The poll tick
    /// runs either way.
    pub os_notifications: bool,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            os_notifications: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailRead {
    pub lines: Vec<String>,
    pub offset: u64,
}

/// Reads the complete lines between `offset` and end of file.
///
/// A trailing fragment without a newline is left unread so the returned
/// offset always sits on a line boundary. Blank lines are consumed but not
/// returned.
pub fn tail_from(fs: &dyn FileSystem, path: &Path, offset: u64) -> io::Result<TailRead> {
    read_range(fs, path, offset, None)
}

fn read_range(
    fs: &dyn FileSystem,
    path: &Path,
    offset: u64,
    end: Option<u64>,
) -> io::Result<TailRead> {
    let mut file = fs.open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let limit = end.map_or(u64::MAX, |end| end.saturating_sub(offset));
    let mut reader = BufReader::new(file.take(limit));

    let mut lines = Vec::new();
    let mut consumed = offset;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 || buf.last() != Some(&b'\n') {
            break;
        }
        consumed += read as u64;
        let text = String::from_utf8_lossy(&buf);
        let line = text.trim_end_matches(['\n', '\r']);
        if !line.trim().is_empty() {
            lines.push(line.to_string());
        }
    }

    Ok(TailRead {
        lines,
        offset: consumed,
    })
}

pub struct Tailer {
    path: PathBuf,
    lines: Receiver<String>,
    errors: Receiver<WatchError>,
    close_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: Arc<AtomicU8>,
}

impl Tailer {
    /// Starts tailing `path` from its current end with a notifier of its own.
    ///
    /// Existing usage-bearing lines are sent once as a backfill before any
    /// live content.
    pub fn spawn(
        fs: Arc<dyn FileSystem>,
        path: impl Into<PathBuf>,
        options: TailerOptions,
    ) -> Result<Self, WatchError> {
        let path = path.into();
        let notifier = if options.os_notifications {
            Some(ChangeNotifier::new().map_err(|source| WatchError::Notify {
                path: path.clone(),
                source,
            })?)
        } else {
            None
        };
        Self::spawn_with(fs, path, options.poll_interval, notifier.as_ref())
    }

    /// Like [`Tailer::spawn`], but change notifications come from a shared
    /// notifier. With `None` the tailer relies on its poll tick alone.
    pub fn spawn_with(
        fs: Arc<dyn FileSystem>,
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        notifier: Option<&Arc<ChangeNotifier>>,
    ) -> Result<Self, WatchError> {
        let path = path.into();
        let offset = fs
            .stat(&path)
            .map_err(|source| WatchError::Setup {
                path: path.clone(),
                source,
            })?
            .len;
        let changes = notifier
            .map(|notifier| notifier.subscribe(&path))
            .transpose()?;
        Self::launch(fs, path, offset, poll_interval, changes)
    }

    fn launch(
        fs: Arc<dyn FileSystem>,
        path: PathBuf,
        offset: u64,
        poll_interval: Duration,
        changes: Option<Subscription>,
    ) -> Result<Self, WatchError> {
        let (line_tx, line_rx) = unbounded();
        let (error_tx, error_rx) = unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded::<()>(1);
        let state = Arc::new(AtomicU8::new(TailerState::Created.as_u8()));

        let worker = TailWorker {
            fs,
            path: path.clone(),
            offset,
            lines: line_tx,
            errors: error_tx,
            state: Arc::clone(&state),
            last_error: None,
        };
        let handle = thread::Builder::new()
            .name(format!("tail:{}", file_label(&path)))
            .spawn(move || worker.run(close_rx, poll_interval, changes))
            .map_err(|source| WatchError::Setup {
                path: path.clone(),
                source,
            })?;

        info!(path = %path.display(), offset, "tailer started");
        Ok(Self {
            path,
            lines: line_rx,
            errors: error_rx,
            close_tx: Mutex::new(Some(close_tx)),
            handle: Mutex::new(Some(handle)),
            state,
        })
    }

    pub fn state(&self) -> TailerState {
        TailerState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

impl TranscriptFeed for Tailer {
    fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    fn errors(&self) -> &Receiver<WatchError> {
        &self.errors
    }

    fn close(&self) {
        // Dropping the sender wakes the worker's close arm.
        drop(self.close_tx.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!(path = %self.path.display(), "tailer thread panicked");
        }
    }
}

impl Drop for Tailer {
    fn drop(&mut self) {
        self.close();
    }
}

struct TailWorker {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    offset: u64,
    lines: Sender<String>,
    errors: Sender<WatchError>,
    state: Arc<AtomicU8>,
    /// Kind of the last reported read failure. Repeats are not re-sent.
    last_error: Option<io::ErrorKind>,
}

impl TailWorker {
    fn run(mut self, close: Receiver<()>, poll_interval: Duration, changes: Option<Subscription>) {
        self.backfill();
        self.set_state(TailerState::Live);

        let ticker = tick(poll_interval);
        let (notify_events, notify_errors) = match &changes {
            Some(changes) => (changes.events.clone(), changes.errors.clone()),
            None => (never(), never()),
        };
        let mut events_open = true;
        let mut errors_open = true;

        loop {
            let events = if events_open { notify_events.clone() } else { never() };
            let notify_errs = if errors_open { notify_errors.clone() } else { never() };
            select! {
                recv(close) -> _ => break,
                recv(ticker) -> _ => self.poll(),
                recv(events) -> msg => match msg {
                    Ok(event) => {
                        if self.touches_file(&event) {
                            self.poll();
                        }
                    }
                    Err(_) => events_open = false,
                },
                recv(notify_errs) -> msg => match msg {
                    Ok(err) => {
                        warn!(path = %self.path.display(), error = %err, "change notifier error");
                        let _ = self.errors.send(WatchError::Notifier(err));
                    }
                    Err(_) => errors_open = false,
                },
            }
        }

        drop(changes);
        self.set_state(TailerState::Closed);
        debug!(path = %self.path.display(), offset = self.offset, "tailer stopped");
    }

    fn backfill(&mut self) {
        match read_range(self.fs.as_ref(), &self.path, 0, Some(self.offset)) {
            Ok(read) => {
                // Snap back to the last line boundary so a half-written
                // trailing line is picked up whole by the live loop.
                self.offset = read.offset;
                for line in read.lines.into_iter().filter(|line| looks_like_assistant(line)) {
                    let _ = self.lines.send(line);
                }
            }
            Err(source) => {
                let _ = self.errors.send(WatchError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        }
        self.set_state(TailerState::BackfillSent);
    }

    fn poll(&mut self) {
        match self.fs.stat(&self.path) {
            Ok(stat) if stat.len < self.offset => {
                warn!(
                    path = %self.path.display(),
                    offset = self.offset,
                    len = stat.len,
                    "transcript shrank; restarting from the beginning"
                );
                self.offset = 0;
            }
            Ok(stat) if stat.len == self.offset => return,
            _ => {}
        }

        match tail_from(self.fs.as_ref(), &self.path, self.offset) {
            Ok(read) => {
                self.last_error = None;
                for line in read.lines {
                    let _ = self.lines.send(line);
                }
                self.offset = read.offset;
            }
            Err(source) => {
                debug!(path = %self.path.display(), error = %source, "tail read failed");
                if self.last_error.replace(source.kind()) == Some(source.kind()) {
                    return;
                }
                let _ = self.errors.send(WatchError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        }
    }

    fn touches_file(&self, event: &notify::Event) -> bool {
        if !matches!(
            event.kind,
            EventKind::Modify(_) | EventKind::Create(_) | EventKind::Any
        ) {
            return false;
        }
        let name = self.path.file_name();
        event
            .paths
            .iter()
            .any(|candidate| candidate == &self.path || candidate.file_name() == name)
    }

    fn set_state(&self, state: TailerState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }
}

fn file_label(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or("transcript")
        .chars()
        .take(16)
        .collect()
}

/// Hand-driven feed for exercising feed consumers without a file.
///
/// Either channel can be closed on its own.
pub struct ManualFeed {
    lines_tx: Mutex<Option<Sender<String>>>,
    errors_tx: Mutex<Option<Sender<WatchError>>>,
    lines: Receiver<String>,
    errors: Receiver<WatchError>,
}

impl Default for ManualFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualFeed {
    pub fn new() -> Self {
        let (lines_tx, lines) = unbounded();
        let (errors_tx, errors) = unbounded();
        Self {
            lines_tx: Mutex::new(Some(lines_tx)),
            errors_tx: Mutex::new(Some(errors_tx)),
            lines,
            errors,
        }
    }

    /// Returns false once the line channel has been closed.
    pub fn push_line(&self, line: impl Into<String>) -> bool {
        self.lines_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(line.into()).is_ok())
    }

    pub fn push_error(&self, err: WatchError) -> bool {
        self.errors_tx
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(err).is_ok())
    }

    pub fn close_lines(&self) {
        drop(self.lines_tx.lock().take());
    }

    pub fn close_errors(&self) {
        drop(self.errors_tx.lock().take());
    }
}

impl TranscriptFeed for ManualFeed {
    fn lines(&self) -> &Receiver<String> {
        &self.lines
    }

    fn errors(&self) -> &Receiver<WatchError> {
        &self.errors
    }

    fn close(&self) {
        self.close_lines();
        self.close_errors();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{MemoryFileSystem, OsFileSystem};
    use std::io::Write as _;
    use std::time::SystemTime;
    use tempfile::TempDir;

    const WAIT: Duration = Duration::from_secs(5);

    fn assistant_line(input: u64) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"role":"assistant","model":"claude-sonnet-4-5","usage":{{"input_tokens":{input},"output_tokens":1}}}}}}"#
        )
    }

    fn fast_poll() -> TailerOptions {
        TailerOptions {
            poll_interval: Duration::from_millis(20),
            os_notifications: false,
        }
    }

    #[test]
    fn tail_from_returns_complete_lines_and_next_offset() {
        let fs = MemoryFileSystem::new();
        fs.write_file("/p/s.jsonl", "line1\nline2\n", SystemTime::now());

        let read = tail_from(&fs, Path::new("/p/s.jsonl"), 0).expect("tail");
        assert_eq!(read.lines, vec!["line1".to_string(), "line2".to_string()]);
        assert_eq!(read.offset, 12);

        fs.append("/p/s.jsonl", "line3\npart", SystemTime::now());
        let read = tail_from(&fs, Path::new("/p/s.jsonl"), 12).expect("tail");
        assert_eq!(read.lines, vec!["line3".to_string()]);
        assert_eq!(read.offset, 18);

        fs.append("/p/s.jsonl", "ial\r\n\n", SystemTime::now());
        let read = tail_from(&fs, Path::new("/p/s.jsonl"), 18).expect("tail");
        assert_eq!(read.lines, vec!["partial".to_string()]);
        assert_eq!(read.offset, 27);
    }

    #[test]
    fn tail_from_missing_file_is_not_found() {
        let fs = MemoryFileSystem::new();
        let err = tail_from(&fs, Path::new("/nope.jsonl"), 0).expect_err("missing");
        assert!(crate::fs::is_not_found(&err));
    }

    #[test]
    fn spawn_fails_when_file_is_missing() {
        let fs: Arc<dyn FileSystem> = Arc::new(MemoryFileSystem::new());
        let err = Tailer::spawn(fs, "/p/missing.jsonl", fast_poll())
            .err()
            .expect("setup error");
        assert!(matches!(err, WatchError::Setup { .. }));
        assert!(!err.is_transient());
    }

    #[test]
    fn backfills_usage_lines_then_streams_appends_in_order() {
        let mem = Arc::new(MemoryFileSystem::new());
        let existing = format!(
            "{}\n{}\n{}\n",
            assistant_line(1),
            r#"{"type":"user","message":{"role":"user"}}"#,
            assistant_line(2)
        );
        mem.write_file("/p/s.jsonl", existing, SystemTime::now());

        let tailer = Tailer::spawn(mem.clone(), "/p/s.jsonl", fast_poll()).expect("spawn");
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("b1"), assistant_line(1));
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("b2"), assistant_line(2));

        mem.append("/p/s.jsonl", "live-a\nlive-b\n", SystemTime::now());
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("l1"), "live-a");
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("l2"), "live-b");
        assert_eq!(tailer.state(), TailerState::Live);

        mem.append("/p/s.jsonl", "live-c\n", SystemTime::now());
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("l3"), "live-c");
        assert!(
            tailer
                .lines()
                .recv_timeout(Duration::from_millis(100))
                .is_err(),
            "no line is delivered twice"
        );
    }

    #[test]
    fn read_failures_are_reported_and_retried() {
        let mem = Arc::new(MemoryFileSystem::new());
        mem.write_file("/p/s.jsonl", "", SystemTime::now());
        let tailer = Tailer::spawn(mem.clone(), "/p/s.jsonl", fast_poll()).expect("spawn");

        mem.deny("/p/s.jsonl");
        mem.append("/p/s.jsonl", "first\n", SystemTime::now());
        let err = tailer.errors().recv_timeout(WAIT).expect("error");
        assert!(err.is_transient());
        assert!(tailer.lines().try_recv().is_err());

        mem.allow("/p/s.jsonl");
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("retried"), "first");
    }

    #[test]
    fn notifier_errors_are_forwarded_and_the_loop_keeps_running() {
        let mem = Arc::new(MemoryFileSystem::new());
        mem.write_file("/p/s.jsonl", "", SystemTime::now());
        let (changes, event_tx, error_tx) = Subscription::detached();
        // A long tick leaves change events as the only wake-up.
        let tailer = Tailer::launch(
            mem.clone(),
            PathBuf::from("/p/s.jsonl"),
            0,
            Duration::from_secs(3_600),
            Some(changes),
        )
        .expect("launch");

        error_tx
            .send(notify::Error::generic("event queue overflow"))
            .expect("inject error");
        let err = tailer.errors().recv_timeout(WAIT).expect("forwarded");
        assert!(matches!(err, WatchError::Notifier(_)));
        assert!(err.is_transient());

        mem.append("/p/s.jsonl", "after-error\n", SystemTime::now());
        let event = notify::Event::new(EventKind::Modify(notify::event::ModifyKind::Any))
            .add_path(PathBuf::from("/p/s.jsonl"));
        event_tx.send(event).expect("inject event");
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("line"), "after-error");
        assert_eq!(tailer.state(), TailerState::Live);
    }

    #[test]
    fn shrunk_file_is_reread_from_the_start() {
        let mem = Arc::new(MemoryFileSystem::new());
        mem.write_file(
            "/p/s.jsonl",
            "a fairly long first line\nand another one\n",
            SystemTime::now(),
        );
        let tailer = Tailer::spawn(mem.clone(), "/p/s.jsonl", fast_poll()).expect("spawn");

        mem.write_file("/p/s.jsonl", "fresh\n", SystemTime::now());
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("reread"), "fresh");

        mem.append("/p/s.jsonl", "next\n", SystemTime::now());
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("next"), "next");
    }

    #[test]
    fn repeated_read_failures_are_reported_once() {
        let mem = Arc::new(MemoryFileSystem::new());
        mem.write_file("/p/s.jsonl", "", SystemTime::now());
        let tailer = Tailer::spawn(mem.clone(), "/p/s.jsonl", fast_poll()).expect("spawn");

        mem.remove("/p/s.jsonl");
        let err = tailer.errors().recv_timeout(WAIT).expect("first failure");
        assert!(matches!(&err, WatchError::Read { source, .. } if crate::fs::is_not_found(source)));
        assert!(
            tailer
                .errors()
                .recv_timeout(Duration::from_millis(200))
                .is_err(),
            "later polls stay quiet"
        );

        mem.write_file("/p/s.jsonl", "back\n", SystemTime::now());
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("recovered"), "back");
    }

    #[test]
    fn partial_trailing_line_at_start_is_delivered_once_complete() {
        let mem = Arc::new(MemoryFileSystem::new());
        let head = assistant_line(3);
        let (first, rest) = head.split_at(20);
        mem.write_file("/p/s.jsonl", first, SystemTime::now());

        let tailer = Tailer::spawn(mem.clone(), "/p/s.jsonl", fast_poll()).expect("spawn");
        mem.append("/p/s.jsonl", format!("{rest}\n"), SystemTime::now());
        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("joined"), head);
    }

    #[test]
    fn close_is_idempotent_and_closes_both_channels() {
        let mem: Arc<dyn FileSystem> = Arc::new({
            let fs = MemoryFileSystem::new();
            fs.write_file("/p/s.jsonl", "", SystemTime::now());
            fs
        });
        let tailer = Tailer::spawn(mem, "/p/s.jsonl", fast_poll()).expect("spawn");
        tailer.close();
        tailer.close();
        assert_eq!(tailer.state(), TailerState::Closed);
        assert!(tailer.lines().recv_timeout(WAIT).is_err());
        assert!(tailer.errors().recv_timeout(WAIT).is_err());
    }

    #[test]
    fn os_notifier_watches_the_files_own_directory() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("proj").join("session.jsonl");
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "").expect("write");

        let options = TailerOptions {
            poll_interval: Duration::from_millis(200),
            os_notifications: true,
        };
        let tailer = Tailer::spawn(Arc::new(OsFileSystem), &path, options).expect("spawn");

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open append");
        writeln!(file, "{}", assistant_line(7)).expect("append");
        drop(file);

        assert_eq!(tailer.lines().recv_timeout(WAIT).expect("line"), assistant_line(7));
        tailer.close();
    }

    #[test]
    fn manual_feed_channels_close_independently() {
        let feed = ManualFeed::new();
        assert!(feed.push_line("a"));
        feed.close_lines();
        assert!(!feed.push_line("b"));
        assert_eq!(feed.lines().recv().expect("buffered"), "a");
        assert!(feed.lines().recv().is_err());

        assert!(feed.push_error(WatchError::Read {
            path: PathBuf::from("x"),
            source: io::Error::other("boom"),
        }));
        feed.close();
        assert!(feed.errors().recv().is_ok());
        assert!(feed.errors().recv().is_err());
    }
}
