//! One OS change notifier shared by many tailers.
//!
//! Each subscription names a file. Its containing directory is watched
//! non-recursively and reference counted, so every transcript of a project
//! costs one directory watch and the whole monitor costs one notifier
//! instance.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::WatchError;

struct Subscriber {
    dir: PathBuf,
    file_name: OsString,
    events: Sender<notify::Event>,
    errors: Sender<notify::Error>,
}

impl Subscriber {
    fn wants(&self, event: &notify::Event) -> bool {
        event.paths.iter().any(|path| {
            path.file_name() == Some(self.file_name.as_os_str())
                && path.parent().is_none_or(|parent| parent == self.dir.as_path())
        })
    }

    fn affected_by(&self, err: &notify::Error) -> bool {
        err.paths.is_empty() || err.paths.iter().any(|path| path.starts_with(&self.dir))
    }
}

type Routes = Arc<Mutex<HashMap<u64, Subscriber>>>;

struct WatchedDirs {
    watcher: RecommendedWatcher,
    counts: HashMap<PathBuf, usize>,
}

pub struct ChangeNotifier {
    routes: Routes,
    watched: Mutex<WatchedDirs>,
    next_id: AtomicU64,
}

impl ChangeNotifier {
    pub fn new() -> notify::Result<Arc<Self>> {
        let routes: Routes = Arc::default();
        let handler_routes = Arc::clone(&routes);
        // Only the routing table may be locked in here; `watched` is held
        // across watch/unwatch, which wait on this thread.
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let routes = handler_routes.lock();
            match res {
                Ok(event) => {
                    for sub in routes.values().filter(|sub| sub.wants(&event)) {
                        let _ = sub.events.send(event.clone());
                    }
                }
                Err(err) => {
                    let message = err.to_string();
                    for sub in routes.values().filter(|sub| sub.affected_by(&err)) {
                        let copy = notify::Error::generic(&message).set_paths(err.paths.clone());
                        let _ = sub.errors.send(copy);
                    }
                }
            }
        })?;

        Ok(Arc::new(Self {
            routes,
            watched: Mutex::new(WatchedDirs {
                watcher,
                counts: HashMap::new(),
            }),
            next_id: AtomicU64::new(0),
        }))
    }

    /// Routes change events for `path` to the returned subscription until
    /// it is dropped.
    pub fn subscribe(self: &Arc<Self>, path: &Path) -> Result<Subscription, WatchError> {
        let dir = watch_dir(path);
        let file_name = path.file_name().map(OsString::from).unwrap_or_default();

        {
            let mut watched = self.watched.lock();
            if !watched.counts.contains_key(&dir) {
                watched
                    .watcher
                    .watch(&dir, RecursiveMode::NonRecursive)
                    .map_err(|source| WatchError::Notify {
                        path: path.to_path_buf(),
                        source,
                    })?;
                debug!(dir = %dir.display(), "directory watch added");
            }
            *watched.counts.entry(dir.clone()).or_default() += 1;
        }

        let (event_tx, events) = unbounded();
        let (error_tx, errors) = unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.routes.lock().insert(
            id,
            Subscriber {
                dir: dir.clone(),
                file_name,
                events: event_tx,
                errors: error_tx,
            },
        );

        Ok(Subscription {
            events,
            errors,
            registration: Some((Arc::clone(self), id, dir)),
        })
    }

    /// Number of directories currently under watch.
    pub fn watched_dirs(&self) -> usize {
        self.watched.lock().counts.len()
    }

    fn unsubscribe(&self, id: u64, dir: &Path) {
        self.routes.lock().remove(&id);

        let mut watched = self.watched.lock();
        let Some(count) = watched.counts.get_mut(dir) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            watched.counts.remove(dir);
            if let Err(err) = watched.watcher.unwatch(dir) {
                debug!(dir = %dir.display(), error = %err, "directory unwatch failed");
            }
        }
    }
}

/// Change events and notifier errors for one file.
pub struct Subscription {
    pub(crate) events: Receiver<notify::Event>,
    pub(crate) errors: Receiver<notify::Error>,
    registration: Option<(Arc<ChangeNotifier>, u64, PathBuf)>,
}

impl Subscription {
    /// A subscription fed by hand instead of the OS.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, Sender<notify::Event>, Sender<notify::Error>) {
        let (event_tx, events) = unbounded();
        let (error_tx, errors) = unbounded();
        let subscription = Self {
            events,
            errors,
            registration: None,
        };
        (subscription, event_tx, error_tx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some((notifier, id, dir)) = self.registration.take() {
            notifier.unsubscribe(id, &dir);
        }
    }
}

/// The directory to watch for `path`: its real parent, or `.` for a bare
/// file name.
fn watch_dir(path: &Path) -> PathBuf {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::canonicalize(&parent).unwrap_or(parent)
}
