//! Key classification for a single store instance.

use crate::error::{Result, StoreError};
use crate::types::ReadOnly;
use std::collections::BTreeSet;

/// Tracks which keys are known, unopened, dirty, deleted, store-backed and locked.
///
/// Invariants kept by every method:
/// - `unopened ⊆ known`, `dirty ⊆ known`, `saveable ⊆ known`
/// - `removed ∩ known = ∅`
/// - once `read_only` is [`ReadOnly::All`] it never changes
#[derive(Clone, Debug, Default)]
pub struct KeyState {
    known: BTreeSet<String>,
    unopened: BTreeSet<String>,
    dirty: BTreeSet<String>,
    /// Deleted keys whose removal has not been flushed yet.
    removed: BTreeSet<String>,
    /// Keys whose value is a store that persists itself.
    saveable: BTreeSet<String>,
    read_only: ReadOnly,
    /// Lock inherited from the parent key this store was materialized from.
    inherited: bool,
}

impl KeyState {
    pub fn new(read_only: ReadOnly) -> Self {
        Self {
            read_only,
            ..Default::default()
        }
    }

    // --- Registration ---

    /// Register a key whose value is materialized in memory.
    pub fn register(&mut self, key: &str) {
        self.known.insert(key.to_string());
        self.unopened.remove(key);
        self.removed.remove(key);
    }

    /// Register a key that exists in the backing store but is not loaded yet.
    pub fn register_unopened(&mut self, key: &str) {
        self.known.insert(key.to_string());
        self.unopened.insert(key.to_string());
    }

    /// Mark an unopened key as loaded.
    pub fn mark_loaded(&mut self, key: &str) {
        self.unopened.remove(key);
    }

    /// Move a materialized key back to the unopened set.
    pub fn mark_unopened(&mut self, key: &str) {
        if self.known.contains(key) {
            self.unopened.insert(key.to_string());
            self.saveable.remove(key);
        }
    }

    /// Remove a key and record a pending deletion for the next save.
    pub fn unregister(&mut self, key: &str) {
        self.forget(key);
        self.removed.insert(key.to_string());
    }

    /// Drop every trace of a key without recording a deletion.
    pub fn forget(&mut self, key: &str) {
        self.known.remove(key);
        self.unopened.remove(key);
        self.dirty.remove(key);
        self.saveable.remove(key);
    }

    /// Forget all keys and pending changes. The lock state is kept.
    pub fn reset(&mut self) {
        self.known.clear();
        self.unopened.clear();
        self.dirty.clear();
        self.removed.clear();
        self.saveable.clear();
    }

    // --- Dirty tracking ---

    pub fn mark_dirty(&mut self, key: &str) {
        debug_assert!(self.known.contains(key), "dirty key must be known");
        self.dirty.insert(key.to_string());
    }

    /// Mark every known key dirty.
    pub fn mark_all_dirty(&mut self) {
        self.dirty = self.known.clone();
    }

    /// Keys with changes not yet flushed: dirty keys plus pending deletions.
    pub fn pending(&self) -> BTreeSet<String> {
        self.dirty.union(&self.removed).cloned().collect()
    }

    pub fn has_pending(&self) -> bool {
        !self.dirty.is_empty() || !self.removed.is_empty()
    }

    /// Clear the given keys from the dirty and deleted sets.
    pub fn clear_pending<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            self.dirty.remove(key);
            self.removed.remove(key);
        }
    }

    pub fn is_removed(&self, key: &str) -> bool {
        self.removed.contains(key)
    }

    // --- Store-backed values ---

    pub fn mark_saveable(&mut self, key: &str) {
        if self.known.contains(key) {
            self.saveable.insert(key.to_string());
        }
    }

    pub fn unmark_saveable(&mut self, key: &str) {
        self.saveable.remove(key);
    }

    pub fn is_saveable(&self, key: &str) -> bool {
        self.saveable.contains(key)
    }

    // --- Locks ---

    /// Whether writes to `key` are rejected.
    pub fn is_locked(&self, key: &str) -> bool {
        self.inherited || self.read_only.contains(key)
    }

    /// Whether the whole store rejects writes.
    pub fn is_fully_locked(&self) -> bool {
        self.inherited || self.read_only.is_all()
    }

    /// Lock the given keys, or every known key when `keys` is `None`.
    ///
    /// Fails on a fully locked store, including one locked by its parent.
    pub fn lock(&mut self, keys: Option<&[String]>) -> Result<()> {
        if self.is_fully_locked() {
            return Err(StoreError::read_only_store("lock keys of"));
        }
        let mut locked = match std::mem::take(&mut self.read_only) {
            ReadOnly::Keys(locked) => locked,
            _ => BTreeSet::new(),
        };
        match keys {
            Some(keys) => locked.extend(keys.iter().cloned()),
            None => locked.extend(self.known.iter().cloned()),
        }
        self.read_only = ReadOnly::Keys(locked);
        Ok(())
    }

    /// Unlock the given keys, or every key when `keys` is `None`.
    pub fn unlock(&mut self, keys: Option<&[String]>) -> Result<()> {
        if self.is_fully_locked() {
            return Err(StoreError::read_only_store("unlock keys of"));
        }
        if let ReadOnly::Keys(locked) = &mut self.read_only {
            match keys {
                Some(keys) => {
                    for key in keys {
                        locked.remove(key);
                    }
                }
                None => self.read_only = ReadOnly::Mutable,
            }
        }
        Ok(())
    }

    pub fn set_inherited(&mut self, locked: bool) {
        self.inherited = locked;
    }

    pub fn inherited(&self) -> bool {
        self.inherited
    }

    // --- Accessors ---

    pub fn read_only(&self) -> &ReadOnly {
        &self.read_only
    }

    pub fn known(&self) -> &BTreeSet<String> {
        &self.known
    }

    pub fn unopened(&self) -> &BTreeSet<String> {
        &self.unopened
    }

    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }

    pub fn is_known(&self, key: &str) -> bool {
        self.known.contains(key)
    }

    pub fn is_unopened(&self, key: &str) -> bool {
        self.unopened.contains(key)
    }
}
