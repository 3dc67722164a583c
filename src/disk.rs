//! Abstraction over file system queries and mutations, so the scanner and
//! builder can be driven against an in-memory file system in tests.

use anyhow::{anyhow, Context};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::Path;
use std::time::UNIX_EPOCH;

/// File modification time, in nanoseconds since the epoch.
pub type Timestamp = i64;

/// The stat state of a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MTime {
    /// Not yet examined.
    Unknown,
    /// Examined, and the file does not exist.
    Missing,
    /// Examined, with the given mtime.
    Stamp(Timestamp),
}

impl MTime {
    pub fn exists(&self) -> bool {
        matches!(self, MTime::Stamp(_))
    }

    pub fn known(&self) -> bool {
        !matches!(self, MTime::Unknown)
    }

    /// Timestamp for ordering comparisons; a missing file sorts before any
    /// real stamp, and an unexamined one before that.
    pub fn stamp(&self) -> Timestamp {
        match self {
            MTime::Unknown => -1,
            MTime::Missing => 0,
            MTime::Stamp(t) => *t,
        }
    }
}

/// Interface to the build directory's file system.
pub trait DiskInterface {
    /// Stat a file; Ok(MTime::Missing) when it does not exist.
    fn stat(&self, path: &str) -> anyhow::Result<MTime>;
    /// Read a file; Ok(None) when it does not exist.
    fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>>;
    fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()>;
    /// Create the directories leading up to the given output path.
    fn make_dirs(&self, path: &str) -> anyhow::Result<()>;
    /// Remove a file; Ok(false) when it was already absent.
    fn remove_file(&self, path: &str) -> anyhow::Result<bool>;
}

/// DiskInterface implementation for the real file system.
pub struct SystemDisk;

impl DiskInterface for SystemDisk {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        match std::fs::metadata(path) {
            Ok(meta) => {
                let mtime = meta
                    .modified()
                    .with_context(|| format!("stat {}", path))?
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as Timestamp)
                    .unwrap_or(0);
                Ok(MTime::Stamp(mtime))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(MTime::Missing),
            Err(err) => Err(anyhow!("stat {}: {}", path, err)),
        }
    }

    fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(anyhow!("read {}: {}", path, err)),
        }
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        self.make_dirs(path)?;
        std::fs::write(path, contents).with_context(|| format!("write {}", path))
    }

    fn make_dirs(&self, path: &str) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("mkdir {}", parent.display()))?;
            }
        }
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(anyhow!("unlink {}: {}", path, err)),
        }
    }
}

struct VirtualFile {
    mtime: Timestamp,
    contents: Vec<u8>,
}

/// An in-memory DiskInterface with a fake monotonic clock, for tests.
#[derive(Default)]
pub struct VirtualDisk {
    files: RefCell<HashMap<String, VirtualFile>>,
    now: Cell<Timestamp>,
}

impl VirtualDisk {
    pub fn new() -> Self {
        VirtualDisk::default()
    }

    /// Advance the clock, so subsequent writes get fresher mtimes.
    pub fn tick(&self) -> Timestamp {
        self.now.set(self.now.get() + 1);
        self.now.get()
    }

    pub fn create(&self, path: &str, contents: &str) {
        let mtime = self.tick();
        self.files.borrow_mut().insert(
            path.to_owned(),
            VirtualFile {
                mtime,
                contents: contents.as_bytes().to_vec(),
            },
        );
    }

    /// Re-stamp an existing file without changing its contents.
    pub fn touch(&self, path: &str) {
        let mtime = self.tick();
        let mut files = self.files.borrow_mut();
        match files.get_mut(path) {
            Some(file) => file.mtime = mtime,
            None => {
                files.insert(
                    path.to_owned(),
                    VirtualFile {
                        mtime,
                        contents: Vec::new(),
                    },
                );
            }
        }
    }

    pub fn mtime(&self, path: &str) -> Option<Timestamp> {
        self.files.borrow().get(path).map(|f| f.mtime)
    }
}

impl DiskInterface for VirtualDisk {
    fn stat(&self, path: &str) -> anyhow::Result<MTime> {
        Ok(match self.files.borrow().get(path) {
            Some(file) => MTime::Stamp(file.mtime),
            None => MTime::Missing,
        })
    }

    fn read_file(&self, path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.files.borrow().get(path).map(|f| f.contents.clone()))
    }

    fn write_file(&self, path: &str, contents: &[u8]) -> anyhow::Result<()> {
        let mtime = self.tick();
        self.files.borrow_mut().insert(
            path.to_owned(),
            VirtualFile {
                mtime,
                contents: contents.to_vec(),
            },
        );
        Ok(())
    }

    fn make_dirs(&self, _path: &str) -> anyhow::Result<()> {
        Ok(())
    }

    fn remove_file(&self, path: &str) -> anyhow::Result<bool> {
        Ok(self.files.borrow_mut().remove(path).is_some())
    }
}
