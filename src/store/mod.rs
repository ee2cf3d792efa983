//! The synchronized store engine.
//!
//! A [`Store`] is a string-keyed mapping that mirrors one group of a backing
//! file. Its behavior is split across submodules:
//!
//! - `access`: reads, nested addressing and child materialization
//! - `gate`: mutations and locks
//! - `load`: lazy loading, reloading and releasing values
//! - `persist`: saving with bounded retry

mod access;
mod gate;
mod load;
mod options;
mod persist;

pub use options::{OpenOptions, RetryPolicy};

use crate::backend::{Backend, FileBackend};
use crate::error::{Result, StoreError};
use crate::state::KeyState;
use crate::transform::normalize;
use crate::types::{join_prefix, validate_key, Mode, ReadOnly, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::info;

/// In-memory slot for one key.
pub(crate) enum Slot {
    /// Known to exist in the backing file, not read yet.
    Unloaded,
    Value(Value),
    /// Nested mapping handled by its own store.
    Store(Box<Store>),
}

/// A hierarchical key-value store synchronized with a backing file.
///
/// Values are loaded on open (or on first access when opened lazily), and
/// saves write only what changed since the last save. Nested mappings are
/// handed out as child stores that share this store's file under a key
/// prefix.
pub struct Store {
    pub(crate) entries: BTreeMap<String, Slot>,
    pub(crate) state: KeyState,
    pub(crate) path: Option<PathBuf>,
    pub(crate) prefix: Option<String>,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) auto_save: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) lazy: bool,
    /// Next save clears the whole group before writing.
    pub(crate) replace_pending: bool,
    /// Modification time of the backing file as of the last load or save.
    pub(crate) file_modified: Option<SystemTime>,
    /// Cached structural summary, dropped on every change.
    pub(crate) summary: Mutex<Option<String>>,
}

impl Store {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::with_backend(Arc::new(FileBackend::default()))
    }

    /// Create an empty in-memory store that saves through `backend`.
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            entries: BTreeMap::new(),
            state: KeyState::default(),
            path: None,
            prefix: None,
            backend,
            auto_save: false,
            retry: RetryPolicy::default(),
            lazy: false,
            replace_pending: false,
            file_modified: None,
            summary: Mutex::new(None),
        }
    }

    /// Create an in-memory store holding `data`. Every key starts dirty.
    pub fn from_map(data: BTreeMap<String, Value>) -> Result<Self> {
        let mut store = Self::new();
        for (key, value) in data {
            validate_key(&key)?;
            let value = normalize(value)?;
            store.state.register(&key);
            store.state.mark_dirty(&key);
            store.entries.insert(key, Slot::Value(value));
        }
        Ok(store)
    }

    /// Open the store at `path` with default options for `mode`.
    pub fn open(path: impl AsRef<Path>, mode: Mode) -> Result<Self> {
        Self::open_with(path, &OpenOptions::new(mode))
    }

    /// Open `path` in write mode, replacing whatever it holds on the first save.
    pub fn open_overwrite(path: impl AsRef<Path>) -> Result<Self> {
        OpenOptions::new(Mode::Write).overwrite(true).open(path)
    }

    /// Open the store at `path`.
    pub fn open_with(path: impl AsRef<Path>, options: &OpenOptions) -> Result<Self> {
        let path = path.as_ref();
        let (read_only, auto_save, overwrite) = options.resolve()?;
        let backend = options.backend_or_default();
        let exists = backend.exists(path);

        if !exists && read_only.is_all() {
            return Err(StoreError::Configuration(format!(
                "cannot open missing file {} in read mode",
                path.display()
            )));
        }
        if exists && options.mode.is_write() && overwrite.is_none() {
            return Err(StoreError::Configuration(format!(
                "{} already exists; choose whether to overwrite it or open it",
                path.display()
            )));
        }

        let mut store = Self::with_backend(backend);
        store.state = KeyState::new(read_only);
        store.path = Some(path.to_path_buf());
        store.auto_save = auto_save;
        store.retry = options.retry;
        store.lazy = options.lazy;

        if exists && overwrite == Some(true) {
            // Existing contents are replaced by the first save.
            store.replace_pending = true;
        } else if exists {
            store.load_initial()?;
        }

        info!(
            path = %path.display(),
            mode = ?options.mode,
            keys = store.state.known().len(),
            lazy = store.lazy,
            "opened store"
        );
        Ok(store)
    }

    // --- Introspection ---

    /// Backing file, if bound.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Group this store occupies inside the backing file.
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn is_auto_save(&self) -> bool {
        self.auto_save
    }

    pub fn is_lazy(&self) -> bool {
        self.lazy
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Lock state set on this store. See [`Store::is_read_only`] for the
    /// effective state including locks inherited from a parent.
    pub fn read_only(&self) -> &ReadOnly {
        self.state.read_only()
    }

    /// Whether every write to this store is rejected.
    pub fn is_read_only(&self) -> bool {
        self.state.is_fully_locked()
    }

    /// Whether writes to `key` are rejected.
    pub fn is_locked(&self, key: &str) -> bool {
        self.state.is_locked(key)
    }

    /// Keys currently rejecting writes.
    pub fn locked_keys(&self) -> Vec<String> {
        if self.state.is_fully_locked() {
            return self.state.known().iter().cloned().collect();
        }
        match self.state.read_only() {
            ReadOnly::Keys(keys) => keys.iter().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Keys mutated since the last save.
    pub fn dirty_keys(&self) -> &BTreeSet<String> {
        self.state.dirty()
    }

    /// Known keys not loaded yet.
    pub fn unopened_keys(&self) -> &BTreeSet<String> {
        self.state.unopened()
    }

    /// Whether this store or any materialized child has unsaved changes.
    pub fn has_unsaved_changes(&self) -> bool {
        self.replace_pending
            || self.state.has_pending()
            || self.children().any(|(_, child)| child.has_unsaved_changes())
    }

    /// Modification time of the backing file as of the last load or save,
    /// including saves made through child stores.
    pub fn last_synced(&self) -> Option<SystemTime> {
        self.latest_sync()
    }

    // --- Internal helpers ---

    pub(crate) fn children(&self) -> impl Iterator<Item = (&String, &Store)> {
        self.entries.iter().filter_map(|(key, slot)| match slot {
            Slot::Store(child) => Some((key, child.as_ref())),
            _ => None,
        })
    }

    pub(crate) fn children_mut(&mut self) -> impl Iterator<Item = (&String, &mut Store)> {
        self.entries.iter_mut().filter_map(|(key, slot)| match slot {
            Slot::Store(child) => Some((key, child.as_mut())),
            _ => None,
        })
    }

    pub(crate) fn invalidate_summary(&self) {
        *self.summary.lock() = None;
    }

    pub(crate) fn require_path(&self) -> Result<PathBuf> {
        self.path
            .clone()
            .ok_or_else(|| StoreError::Configuration("store has no backing file".into()))
    }

    /// Latest sync time of this store and of the children sharing its file.
    pub(crate) fn latest_sync(&self) -> Option<SystemTime> {
        self.children()
            .filter(|(_, child)| child.path == self.path)
            .filter_map(|(_, child)| child.latest_sync())
            .fold(self.file_modified, |latest, synced| latest.max(Some(synced)))
    }

    /// Build the child store for `key` from a mapping, sharing this store's
    /// file and settings.
    pub(crate) fn child_from_map(&self, key: &str, data: BTreeMap<String, Value>) -> Store {
        let mut child = Store::with_backend(Arc::clone(&self.backend));
        for (k, v) in data {
            child.state.register(&k);
            child.entries.insert(k, Slot::Value(v));
        }
        child.path = self.path.clone();
        child.prefix = Some(join_prefix(self.prefix.as_deref(), key));
        child.auto_save = self.auto_save;
        child.retry = self.retry;
        child.file_modified = self.file_modified;
        child.state.set_inherited(self.state.is_locked(key));
        child
    }

    /// Point this store and its children at a new location.
    pub(crate) fn rebind(
        &mut self,
        path: PathBuf,
        prefix: String,
        backend: Arc<dyn Backend>,
        auto_save: bool,
        retry: RetryPolicy,
    ) {
        for (key, child) in self.children_mut() {
            child.rebind(
                path.clone(),
                join_prefix(Some(&prefix), key),
                Arc::clone(&backend),
                auto_save,
                retry,
            );
        }
        self.path = Some(path);
        self.prefix = Some(prefix);
        self.backend = backend;
        self.auto_save = auto_save;
        self.retry = retry;
        self.file_modified = None;
    }

    /// Recompute the inherited lock of every materialized child.
    pub(crate) fn refresh_child_locks(&mut self) {
        let locks: Vec<(String, bool)> = self
            .children()
            .map(|(key, _)| (key.clone(), self.state.is_locked(key)))
            .collect();
        for (key, locked) in locks {
            if let Some(Slot::Store(child)) = self.entries.get_mut(&key) {
                child.state.set_inherited(locked);
                child.refresh_child_locks();
                child.invalidate_summary();
            }
        }
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("prefix", &self.prefix)
            .field("keys", self.state.known())
            .field("unopened", self.state.unopened())
            .field("dirty", self.state.dirty())
            .field("read_only", self.state.read_only())
            .field("inherited_lock", &self.state.inherited())
            .field("auto_save", &self.auto_save)
            .finish()
    }
}
