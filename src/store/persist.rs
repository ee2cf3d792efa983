//! Saving to the backing file.

use super::{Slot, Store};
use crate::backend::WriteBatch;
use crate::error::{Result, StoreError};
use crate::types::SaveScope;
use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::SystemTime;
use tracing::{debug, info, warn};

impl Store {
    /// Write every change made since the last save.
    pub fn save(&mut self) -> Result<&mut Self> {
        self.save_with(SaveScope::Dirty, None, false)
    }

    /// Write the whole mapping.
    pub fn save_all(&mut self) -> Result<&mut Self> {
        self.save_with(SaveScope::All, None, false)
    }

    /// Write the pending changes to `keys` only.
    pub fn save_keys<I, S>(&mut self, keys: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.save_with(SaveScope::keys(keys), None, false)
    }

    /// Write the whole mapping to another file, under this store's prefix.
    pub fn save_to(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        self.save_with(SaveScope::All, Some(path.as_ref()), false)
    }

    /// Save with explicit scope and target. An explicit path or `force`
    /// always writes everything.
    pub fn save_with(
        &mut self,
        scope: SaveScope,
        path: Option<&Path>,
        force: bool,
    ) -> Result<&mut Self> {
        if self.state.is_fully_locked() {
            return Err(StoreError::read_only_store("save"));
        }
        let scope = if force || path.is_some() {
            SaveScope::All
        } else {
            scope
        };
        self.persist(scope, path)?;
        Ok(self)
    }

    /// Flush `scope` and return the modification time of the last write,
    /// if anything was written.
    ///
    /// Locks are not checked here: a child locked through its parent may
    /// still hold changes made before the lock.
    pub(crate) fn persist(
        &mut self,
        scope: SaveScope,
        target: Option<&Path>,
    ) -> Result<Option<SystemTime>> {
        let path = match target {
            Some(path) => path.to_path_buf(),
            None => self.require_path()?,
        };
        let to_own = self.path.as_deref().map_or(true, |own| own == path);

        let scope = if self.replace_pending && to_own {
            SaveScope::All
        } else {
            scope
        };

        match scope {
            SaveScope::All => self.flush_all(&path, to_own),
            SaveScope::Dirty => {
                let keys = self.state.pending();
                self.flush_keys(&path, keys, true)
            }
            SaveScope::Keys(keys) => {
                let keys = self.state.pending().intersection(&keys).cloned().collect();
                self.flush_keys(&path, keys, false)
            }
        }
    }

    /// Write a full snapshot. Locked keys without pending changes are left
    /// untouched in the file, unless the group is being replaced.
    fn flush_all(&mut self, path: &Path, to_own: bool) -> Result<Option<SystemTime>> {
        self.resolve_deep()?;

        let pending = self.state.pending();
        let mut batch = WriteBatch {
            replace: self.replace_pending && to_own,
            ..WriteBatch::default()
        };
        let mut skipped = BTreeSet::new();

        for (key, slot) in self.entries.iter_mut() {
            if !batch.replace && self.state.read_only().contains(key) && !pending.contains(key) {
                skipped.insert(key.clone());
                continue;
            }
            match slot {
                Slot::Value(value) => batch.put(key.clone(), value.clone()),
                Slot::Store(child) => batch.put(key.clone(), child.to_value()?),
                Slot::Unloaded => {}
            }
        }
        for key in self.state.removed() {
            batch.delete(key.clone());
        }

        let mut last = None;
        if !batch.is_empty() {
            let modified = self.write_with_retry(path, &batch)?;
            debug!(keys = batch.len(), replace = batch.replace, "saved all keys");
            last = Some(modified);

            self.state.clear_pending(&pending);
            if to_own {
                self.replace_pending = false;
                self.file_modified = Some(modified);
            }
            for (key, child) in self.children_mut() {
                if !skipped.contains(key) {
                    child.mark_flushed(path, modified);
                }
            }
        }

        // Locked children were left out of the snapshot but may carry
        // changes of their own.
        if to_own {
            for key in skipped {
                if let Some(Slot::Store(child)) = self.entries.get_mut(&key) {
                    if child.has_unsaved_changes() {
                        if let Some(modified) = child.persist(SaveScope::Dirty, None)? {
                            last = Some(modified);
                        }
                    }
                }
            }
            if let Some(modified) = last {
                self.file_modified = Some(modified);
            }
        }
        Ok(last)
    }

    /// Write the pending changes of `keys` and let child stores flush
    /// themselves.
    fn flush_keys(
        &mut self,
        path: &Path,
        keys: BTreeSet<String>,
        include_children: bool,
    ) -> Result<Option<SystemTime>> {
        let mut batch = WriteBatch::new();
        let mut delegated = Vec::new();

        for key in &keys {
            if self.state.is_removed(key) {
                batch.delete(key.clone());
                continue;
            }
            match self.entries.get(key) {
                Some(Slot::Value(value)) => batch.put(key.clone(), value.clone()),
                Some(Slot::Store(_)) => delegated.push(key.clone()),
                Some(Slot::Unloaded) | None => {}
            }
        }
        if include_children {
            for (key, child) in self.children() {
                if !keys.contains(key) && child.has_unsaved_changes() {
                    delegated.push(key.clone());
                }
            }
        }

        let mut last = None;
        if !batch.is_empty() {
            let modified = self.write_with_retry(path, &batch)?;
            debug!(keys = batch.len(), "saved changed keys");
            let flushed: Vec<String> = batch.entries.keys().cloned().collect();
            self.state.clear_pending(&flushed);
            last = Some(modified);
        }

        for key in delegated {
            if let Some(Slot::Store(child)) = self.entries.get_mut(&key) {
                if let Some(modified) = child.persist(SaveScope::Dirty, None)? {
                    last = Some(modified);
                }
            }
            self.state.clear_pending([&key]);
        }

        if let Some(modified) = last {
            self.file_modified = Some(modified);
        }
        Ok(last)
    }

    /// Record that everything in this store was written as part of a parent
    /// snapshot to `path`.
    ///
    /// A snapshot to another file clears pending changes but leaves the
    /// group replace and sync time of the bound file alone.
    fn mark_flushed(&mut self, path: &Path, modified: SystemTime) {
        let pending = self.state.pending();
        self.state.clear_pending(&pending);
        if self.path.as_deref().map_or(true, |own| own == path) {
            self.replace_pending = false;
            self.file_modified = Some(modified);
        }
        for (_, child) in self.children_mut() {
            child.mark_flushed(path, modified);
        }
    }

    /// Write `batch` under this store's prefix, retrying while another
    /// writer holds the file.
    fn write_with_retry(&self, path: &Path, batch: &WriteBatch) -> Result<SystemTime> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.backend.write(path, self.prefix.as_deref(), batch) {
                Ok(modified) => return Ok(modified),
                Err(StoreError::FileLocked(reason)) if self.retry.should_retry(attempt) => {
                    info!(
                        path = %path.display(),
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        reason = reason.as_str(),
                        "backing file is locked, retrying"
                    );
                    thread::sleep(self.retry.delay);
                }
                Err(StoreError::FileLocked(reason)) => {
                    warn!(path = %path.display(), attempts = attempt, "giving up on locked backing file");
                    return Err(StoreError::FileLocked(format!(
                        "{} (not saved after {} attempts)",
                        reason, attempt
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::store::{OpenOptions, RetryPolicy};
    use crate::types::{Mode, Value};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Backend that reports contention for the first `busy` writes.
    struct BusyBackend {
        inner: MemoryBackend,
        busy: AtomicU32,
        attempts: AtomicU32,
    }

    impl BusyBackend {
        fn new(busy: u32) -> Self {
            Self {
                inner: MemoryBackend::new(),
                busy: AtomicU32::new(busy),
                attempts: AtomicU32::new(0),
            }
        }
    }

    impl Backend for BusyBackend {
        fn exists(&self, path: &Path) -> bool {
            self.inner.exists(path)
        }

        fn read(
            &self,
            path: &Path,
            prefix: Option<&str>,
            keys: Option<&BTreeSet<String>>,
        ) -> Result<BTreeMap<String, Value>> {
            self.inner.read(path, prefix, keys)
        }

        fn list_keys(&self, path: &Path, prefix: Option<&str>) -> Result<BTreeSet<String>> {
            self.inner.list_keys(path, prefix)
        }

        fn write(&self, path: &Path, prefix: Option<&str>, batch: &WriteBatch) -> Result<SystemTime> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let busy = self.busy.load(Ordering::SeqCst);
            if busy > 0 {
                self.busy.store(busy - 1, Ordering::SeqCst);
                return Err(StoreError::FileLocked("busy".into()));
            }
            self.inner.write(path, prefix, batch)
        }

        fn modified(&self, path: &Path) -> Result<SystemTime> {
            self.inner.modified(path)
        }
    }

    fn open(backend: Arc<dyn Backend>, retry: RetryPolicy) -> Store {
        OpenOptions::new(Mode::Append)
            .backend(backend)
            .retry(retry)
            .open("data.skv")
            .unwrap()
    }

    #[test]
    fn test_retry_then_succeed() {
        let backend = Arc::new(BusyBackend::new(2));
        let mut store = open(backend.clone(), RetryPolicy::new(5, Duration::ZERO));
        store.set("a", 1).unwrap();
        store.save().unwrap();

        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        assert!(!store.has_unsaved_changes());
    }

    #[test]
    fn test_retry_bound_keeps_changes() {
        let backend = Arc::new(BusyBackend::new(100));
        let mut store = open(backend.clone(), RetryPolicy::new(3, Duration::ZERO));
        store.set("a", 1).unwrap();

        let err = store.save().unwrap_err();
        assert!(matches!(err, StoreError::FileLocked(_)));
        assert_eq!(backend.attempts.load(Ordering::SeqCst), 3);
        assert!(store.dirty_keys().contains("a"));
    }

    #[test]
    fn test_save_writes_only_changes() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(backend.clone(), RetryPolicy::default());
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        store.save().unwrap();
        assert_eq!(backend.write_count(), 1);

        store.save().unwrap();
        assert_eq!(backend.write_count(), 1);

        store.set("b", 3).unwrap();
        store.remove("a").unwrap();
        store.save().unwrap();
        let file = backend.file("data.skv").unwrap();
        assert!(!file.contains_key("a"));
        assert_eq!(file["b"], Value::Int(3));
    }

    #[test]
    fn test_save_all_skips_clean_locked_keys() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(backend.clone(), RetryPolicy::default());
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        store.save().unwrap();

        backend.put_file(
            "data.skv",
            [
                ("a".to_string(), Value::Int(100)),
                ("b".to_string(), Value::Int(200)),
            ]
            .into_iter()
            .collect(),
        );
        store.lock(["a"]).unwrap();
        store.save_all().unwrap();

        let file = backend.file("data.skv").unwrap();
        assert_eq!(file["a"], Value::Int(100));
        assert_eq!(file["b"], Value::Int(2));
    }

    #[test]
    fn test_child_saves_under_prefix() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(backend.clone(), RetryPolicy::default());
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Int(1));
        store.set("a", inner).unwrap();
        store.save().unwrap();

        store.child("a").unwrap().set("y", 2).unwrap();
        assert!(store.has_unsaved_changes());
        store.save().unwrap();
        assert!(!store.has_unsaved_changes());

        let file = backend.file("data.skv").unwrap();
        let a = file["a"].as_map().unwrap();
        assert_eq!(a["x"], Value::Int(1));
        assert_eq!(a["y"], Value::Int(2));
    }

    #[test]
    fn test_read_only_save_fails() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file("data.skv", BTreeMap::new());
        let mut store = OpenOptions::new(Mode::Read)
            .backend(backend)
            .open("data.skv")
            .unwrap();
        assert!(matches!(store.save(), Err(StoreError::ReadOnly { .. })));
    }

    #[test]
    fn test_overwrite_snapshot_keeps_locked_keys() {
        let backend = Arc::new(MemoryBackend::new());
        backend.put_file(
            "data.skv",
            [
                ("a".to_string(), Value::Int(1)),
                ("b".to_string(), Value::Int(2)),
            ]
            .into_iter()
            .collect(),
        );
        let mut store = OpenOptions::new(Mode::Write)
            .overwrite(true)
            .backend(backend.clone())
            .open("data.skv")
            .unwrap();

        store.load(Some(&["a"])).unwrap();
        store.lock(["a"]).unwrap();
        store.set("c", 3).unwrap();
        store.save().unwrap();

        let file = backend.file("data.skv").unwrap();
        assert_eq!(file["a"], Value::Int(1));
        assert_eq!(file["c"], Value::Int(3));
        assert!(!file.contains_key("b"));
        assert!(!store.has_unsaved_changes());
    }

    #[test]
    fn test_save_to_other_file_clears_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(backend.clone(), RetryPolicy::default());
        store.set("a", 1).unwrap();
        store.set("b", 2).unwrap();
        store.save().unwrap();
        let synced = store.last_synced();

        store.set("a", 10).unwrap();
        store.remove("b").unwrap();
        store.save_to("copy.skv").unwrap();

        let copy = backend.file("copy.skv").unwrap();
        assert_eq!(copy["a"], Value::Int(10));
        assert!(!copy.contains_key("b"));
        assert!(store.dirty_keys().is_empty());
        assert!(!store.has_unsaved_changes());
        assert_eq!(store.last_synced(), synced);
        assert_eq!(backend.file("data.skv").unwrap()["a"], Value::Int(1));
    }

    #[test]
    fn test_save_to_other_file_clears_child_pending() {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(backend.clone(), RetryPolicy::default());
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Int(1));
        store.set("g", inner).unwrap();
        store.save().unwrap();

        store.child("g").unwrap().set("y", 2).unwrap();
        store.save_to("copy.skv").unwrap();

        let copy = backend.file("copy.skv").unwrap();
        assert_eq!(copy["g"].as_map().unwrap()["y"], Value::Int(2));
        assert!(!store.has_unsaved_changes());
        assert!(store.child("g").unwrap().dirty_keys().is_empty());
    }
}
