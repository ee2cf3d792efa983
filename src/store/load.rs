//! Lazy loading, reloading and releasing of values.

use super::{Slot, Store};
use crate::error::{Result, StoreError};
use crate::types::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info, warn};

impl Store {
    /// Populate a freshly opened store from its backing file.
    pub(crate) fn load_initial(&mut self) -> Result<()> {
        let path = self.require_path()?;
        let prefix = self.prefix.clone();

        if self.lazy {
            for key in self.backend.list_keys(&path, prefix.as_deref())? {
                self.state.register_unopened(&key);
                self.entries.insert(key, Slot::Unloaded);
            }
        } else {
            for (key, value) in self.backend.read(&path, prefix.as_deref(), None)? {
                self.state.register(&key);
                self.entries.insert(key, Slot::Value(value));
            }
        }
        self.file_modified = Some(self.backend.modified(&path)?);
        self.invalidate_summary();
        Ok(())
    }

    /// Load `key` if it is known but not loaded yet.
    ///
    /// A key that disappeared from the backing file since it was listed is
    /// forgotten rather than reported as an error.
    pub(crate) fn resolve(&mut self, key: &str) -> Result<()> {
        if !self.state.is_unopened(key) {
            return Ok(());
        }
        let path = self.path.clone().ok_or_else(|| {
            StoreError::Configuration(format!("cannot load '{}' without a backing file", key))
        })?;
        let wanted: BTreeSet<String> = [key.to_string()].into_iter().collect();

        let mut loaded = self.backend.read(&path, self.prefix.as_deref(), Some(&wanted))?;
        if !loaded.contains_key(key) {
            debug!(key, "key missing from backing file, retrying read");
            loaded = self.backend.read(&path, self.prefix.as_deref(), Some(&wanted))?;
        }

        match loaded.remove(key) {
            Some(value) => {
                debug!(key, prefix = self.prefix.as_deref().unwrap_or(""), "loaded key");
                self.entries.insert(key.to_string(), Slot::Value(value));
                self.state.mark_loaded(key);
            }
            None => {
                warn!(key, "key vanished from backing file, forgetting it");
                self.entries.remove(key);
                self.state.forget(key);
            }
        }
        self.invalidate_summary();
        Ok(())
    }

    /// Load every unopened key in one read.
    pub(crate) fn resolve_all(&mut self) -> Result<()> {
        if self.state.unopened().is_empty() {
            return Ok(());
        }
        let path = self.path.clone().ok_or_else(|| {
            StoreError::Configuration("cannot load keys without a backing file".into())
        })?;
        let wanted = self.state.unopened().clone();
        let mut loaded = self.backend.read(&path, self.prefix.as_deref(), Some(&wanted))?;

        for key in &wanted {
            match loaded.remove(key) {
                Some(value) => {
                    self.entries.insert(key.clone(), Slot::Value(value));
                    self.state.mark_loaded(key);
                }
                None => {
                    warn!(key = key.as_str(), "key vanished from backing file, forgetting it");
                    self.entries.remove(key);
                    self.state.forget(key);
                }
            }
        }
        debug!(keys = wanted.len(), "loaded unopened keys");
        self.invalidate_summary();
        Ok(())
    }

    /// Load every unopened key here and in all materialized children.
    pub(crate) fn resolve_deep(&mut self) -> Result<()> {
        self.resolve_all()?;
        for (_, child) in self.children_mut() {
            child.resolve_deep()?;
        }
        Ok(())
    }

    /// Re-read `keys` (or every key) from the backing file, discarding
    /// unsaved changes to them.
    pub fn load(&mut self, keys: Option<&[&str]>) -> Result<&mut Self> {
        let path = self.require_path()?;
        let wanted: Option<BTreeSet<String>> =
            keys.map(|keys| keys.iter().map(|k| k.to_string()).collect());
        let loaded = self
            .backend
            .read(&path, self.prefix.as_deref(), wanted.as_ref())?;

        let reloaded: Vec<String> = loaded.keys().cloned().collect();
        self.install(loaded);
        self.state.clear_pending(&reloaded);
        info!(path = %path.display(), keys = reloaded.len(), "reloaded keys");
        Ok(self)
    }

    /// Merge every key found under this store's prefix in another file.
    ///
    /// Merged values count as loaded, not as changes: a plain save does not
    /// write them back.
    pub fn load_from(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let loaded = self.backend.read(path, self.prefix.as_deref(), None)?;
        info!(path = %path.display(), keys = loaded.len(), "merged keys from file");
        self.install(loaded);
        Ok(self)
    }

    fn install(&mut self, loaded: BTreeMap<String, Value>) {
        for (key, value) in loaded {
            self.state.register(&key);
            self.state.unmark_saveable(&key);
            self.entries.insert(key, Slot::Value(value));
        }
        self.invalidate_summary();
    }

    /// Whether the backing file changed since the last load or save.
    pub fn pull_available(&self) -> Result<bool> {
        let path = self.require_path()?;
        let modified = self.backend.modified(&path)?;
        Ok(self.latest_sync() != Some(modified))
    }

    /// Reload from the backing file if it changed, or unconditionally when
    /// `force` is set. Unsaved changes are discarded.
    ///
    /// Returns whether a reload happened.
    pub fn pull(&mut self, force: bool) -> Result<bool> {
        if !force && !self.pull_available()? {
            return Ok(false);
        }
        if self.has_unsaved_changes() {
            warn!(
                dirty = self.state.dirty().len(),
                "discarding unsaved changes on reload"
            );
        }

        self.entries.clear();
        self.state.reset();
        self.replace_pending = false;
        self.load_initial()?;
        info!(keys = self.state.known().len(), "reloaded store");
        Ok(true)
    }

    /// Release the in-memory value of `key`; it is read again on next access.
    ///
    /// Keys with unsaved changes stay in memory.
    pub fn close(&mut self, key: &str) -> Result<&mut Self> {
        if !self.state.is_known(key) {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }
        if self.state.is_unopened(key) {
            return Ok(self);
        }
        self.require_path()?;

        let unsaved = self.replace_pending
            || self.state.dirty().contains(key)
            || matches!(self.entries.get(key), Some(Slot::Store(child)) if child.has_unsaved_changes());
        if unsaved {
            debug!(key, "keeping key with unsaved changes in memory");
            return Ok(self);
        }

        self.entries.insert(key.to_string(), Slot::Unloaded);
        self.state.mark_unopened(key);
        self.invalidate_summary();
        Ok(self)
    }

    /// Release every loaded value without unsaved changes.
    pub fn close_all(&mut self) -> Result<&mut Self> {
        let keys: Vec<String> = self.state.known().iter().cloned().collect();
        for key in keys {
            self.close(&key)?;
        }
        Ok(self)
    }
}
