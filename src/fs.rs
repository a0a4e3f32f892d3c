//! Minimal filesystem capability used by discovery, tailing and the parse cache.
//!
//! [`OsFileSystem`] talks to the real disk. [`MemoryFileSystem`] is a
//! deterministic in-memory tree for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use parking_lot::RwLock;
use walkdir::WalkDir;

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub len: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: PathBuf,
    pub stat: FileStat,
}

pub trait FileSystem: Send + Sync {
    fn stat(&self, path: &Path) -> io::Result<FileStat>;

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>>;

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>>;

    /// Visits every entry below `root` (not `root` itself), parents before
    /// children. Stops at the first error.
    fn walk(&self, root: &Path, visit: &mut dyn FnMut(&DirEntry)) -> io::Result<()>;

    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
}

pub fn is_not_found(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsFileSystem;

impl OsFileSystem {
    fn stat_of(metadata: &fs::Metadata) -> io::Result<FileStat> {
        Ok(FileStat {
            len: metadata.len(),
            modified: metadata.modified()?,
            is_dir: metadata.is_dir(),
        })
    }
}

impl FileSystem for OsFileSystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        Self::stat_of(&fs::metadata(path)?)
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        Ok(Box::new(fs::File::open(path)?))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let stat = Self::stat_of(&entry.metadata()?)?;
            out.push(DirEntry {
                path: entry.path(),
                stat,
            });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    fn walk(&self, root: &Path, visit: &mut dyn FnMut(&DirEntry)) -> io::Result<()> {
        for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(io::Error::from)?;
            let stat = Self::stat_of(&entry.metadata().map_err(io::Error::from)?)?;
            visit(&DirEntry {
                path: entry.into_path(),
                stat,
            });
        }
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir { modified: SystemTime },
    File { data: Vec<u8>, modified: SystemTime },
}

impl Node {
    fn stat(&self) -> FileStat {
        match self {
            Node::Dir { modified } => FileStat {
                len: 0,
                modified: *modified,
                is_dir: true,
            },
            Node::File { data, modified } => FileStat {
                len: data.len() as u64,
                modified: *modified,
                is_dir: false,
            },
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    nodes: RwLock<BTreeMap<PathBuf, Node>>,
    unreadable: RwLock<BTreeSet<PathBuf>>,
    opens: AtomicUsize,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub fn write_file(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>, modified: SystemTime) {
        let path = path.as_ref();
        let mut nodes = self.nodes.write();
        insert_parents(&mut nodes, path, modified);
        nodes.insert(
            path.to_path_buf(),
            Node::File {
                data: data.as_ref().to_vec(),
                modified,
            },
        );
    }

    pub fn append(&self, path: impl AsRef<Path>, data: impl AsRef<[u8]>, modified: SystemTime) {
        let path = path.as_ref();
        let mut nodes = self.nodes.write();
        match nodes.get_mut(path) {
            Some(Node::File {
                data: existing,
                modified: stamp,
            }) => {
                existing.extend_from_slice(data.as_ref());
                *stamp = modified;
            }
            _ => {
                insert_parents(&mut nodes, path, modified);
                nodes.insert(
                    path.to_path_buf(),
                    Node::File {
                        data: data.as_ref().to_vec(),
                        modified,
                    },
                );
            }
        }
    }

    pub fn remove(&self, path: impl AsRef<Path>) {
        let path = path.as_ref();
        self.nodes
            .write()
            .retain(|candidate, _| !candidate.starts_with(path));
    }

    /// Makes every operation on `path` (and anything below it) fail with
    /// `PermissionDenied`.
    pub fn deny(&self, path: impl AsRef<Path>) {
        self.unreadable.write().insert(path.as_ref().to_path_buf());
    }

    pub fn allow(&self, path: impl AsRef<Path>) {
        self.unreadable.write().remove(path.as_ref());
    }

    /// Number of successful `open` calls so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn check_access(&self, path: &Path) -> io::Result<()> {
        if self
            .unreadable
            .read()
            .iter()
            .any(|denied| path.starts_with(denied))
        {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("access denied: {}", path.display()),
            ));
        }
        Ok(())
    }
}

fn insert_parents(nodes: &mut BTreeMap<PathBuf, Node>, path: &Path, modified: SystemTime) {
    let mut parent = path.parent();
    while let Some(dir) = parent {
        if dir.as_os_str().is_empty() {
            break;
        }
        nodes
            .entry(dir.to_path_buf())
            .or_insert(Node::Dir { modified });
        parent = dir.parent();
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no such file or directory: {}", path.display()),
    )
}

impl FileSystem for MemoryFileSystem {
    fn stat(&self, path: &Path) -> io::Result<FileStat> {
        self.check_access(path)?;
        self.nodes
            .read()
            .get(path)
            .map(Node::stat)
            .ok_or_else(|| not_found(path))
    }

    fn open(&self, path: &Path) -> io::Result<Box<dyn ReadSeek>> {
        self.check_access(path)?;
        let nodes = self.nodes.read();
        match nodes.get(path) {
            Some(Node::File { data, .. }) => {
                self.opens.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(Cursor::new(data.clone())))
            }
            Some(Node::Dir { .. }) => Err(io::Error::other(format!(
                "is a directory: {}",
                path.display()
            ))),
            None => Err(not_found(path)),
        }
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<DirEntry>> {
        self.check_access(path)?;
        let nodes = self.nodes.read();
        match nodes.get(path) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(io::Error::other(format!(
                    "not a directory: {}",
                    path.display()
                )));
            }
            None => return Err(not_found(path)),
        }
        Ok(nodes
            .iter()
            .filter(|(candidate, _)| candidate.parent() == Some(path))
            .map(|(candidate, node)| DirEntry {
                path: candidate.clone(),
                stat: node.stat(),
            })
            .collect())
    }

    fn walk(&self, root: &Path, visit: &mut dyn FnMut(&DirEntry)) -> io::Result<()> {
        self.check_access(root)?;
        let entries: Vec<DirEntry> = {
            let nodes = self.nodes.read();
            if !nodes.contains_key(root) {
                return Err(not_found(root));
            }
            nodes
                .iter()
                .filter(|(candidate, _)| candidate.starts_with(root) && candidate.as_path() != root)
                .map(|(candidate, node)| DirEntry {
                    path: candidate.clone(),
                    stat: node.stat(),
                })
                .collect()
        };
        for entry in &entries {
            self.check_access(&entry.path)?;
            visit(entry);
        }
        Ok(())
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        self.check_access(path)?;
        let mut nodes = self.nodes.write();
        if let Some(Node::File { .. }) = nodes.get(path) {
            return Err(io::Error::other(format!(
                "file exists: {}",
                path.display()
            )));
        }
        let now = SystemTime::now();
        insert_parents(&mut nodes, path, now);
        nodes
            .entry(path.to_path_buf())
            .or_insert(Node::Dir { modified: now });
        Ok(())
    }
}
