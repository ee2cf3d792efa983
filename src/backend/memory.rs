//! In-memory backend for tests and ephemeral use.

use super::{apply_batch, group, select, Backend, WriteBatch};
use crate::error::Result;
use crate::types::Value;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

struct MemoryFile {
    root: BTreeMap<String, Value>,
    modified: SystemTime,
}

/// Backend keeping every "file" in a map. Data is lost when dropped.
///
/// Modification times come from a logical clock that advances on every
/// write, so two writes never share a timestamp.
#[derive(Default)]
pub struct MemoryBackend {
    files: RwLock<HashMap<PathBuf, MemoryFile>>,
    clock: AtomicU64,
    writes: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole file at `path`, as an external writer would.
    pub fn put_file(&self, path: impl AsRef<Path>, root: BTreeMap<String, Value>) {
        let modified = self.tick();
        self.files
            .write()
            .insert(path.as_ref().to_path_buf(), MemoryFile { root, modified });
    }

    /// Snapshot of the whole tree at `path`.
    pub fn file(&self, path: impl AsRef<Path>) -> Option<BTreeMap<String, Value>> {
        self.files
            .read()
            .get(path.as_ref())
            .map(|file| file.root.clone())
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn tick(&self) -> SystemTime {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        UNIX_EPOCH + Duration::from_micros(tick)
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("no store file at {}", path.display()),
    )
}

impl Backend for MemoryBackend {
    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn read(
        &self,
        path: &Path,
        prefix: Option<&str>,
        keys: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Value>> {
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| not_found(path))?;
        Ok(select(&file.root, prefix, keys))
    }

    fn list_keys(&self, path: &Path, prefix: Option<&str>) -> Result<BTreeSet<String>> {
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| not_found(path))?;
        Ok(group(&file.root, prefix)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn write(&self, path: &Path, prefix: Option<&str>, batch: &WriteBatch) -> Result<SystemTime> {
        let modified = self.tick();
        let mut files = self.files.write();
        let file = files.entry(path.to_path_buf()).or_insert_with(|| MemoryFile {
            root: BTreeMap::new(),
            modified,
        });
        apply_batch(&mut file.root, prefix, batch);
        file.modified = modified;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(modified)
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        let files = self.files.read();
        let file = files.get(path).ok_or_else(|| not_found(path))?;
        Ok(file.modified)
    }
}
