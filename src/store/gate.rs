//! Mutations and locks.
//!
//! Every mutation is checked against the lock state and fully prepared
//! before anything is registered, so a failed call leaves the store as it
//! was. Successful mutations mark their keys dirty and, with auto-save on,
//! are flushed right away.

use super::{Slot, Store};
use crate::error::{Result, StoreError};
use crate::transform::{normalize, to_value};
use crate::types::{join_prefix, validate_key, Item, KeyPath, Removed, SaveScope};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

impl Store {
    /// Store `value` at `path`.
    ///
    /// For a multi-segment path, the first segment must hold a mapping; the
    /// remaining segments are set inside its child store.
    pub fn set(&mut self, path: impl Into<KeyPath>, value: impl Into<Item>) -> Result<()> {
        let path = path.into();
        let (first, rest) = path.split_first()?;
        validate_key(first)?;
        if self.state.is_locked(first) {
            return Err(StoreError::read_only(first, "set"));
        }
        if !rest.is_empty() {
            let child = self
                .nested(first)?
                .ok_or_else(|| StoreError::KeyNotFound(first.to_string()))?;
            return child.set(rest, value);
        }

        let slot = prepare(value.into())?;
        self.commit(first, slot);
        self.invalidate_summary();
        self.auto_save_keys([first.to_string()].into_iter().collect())
    }

    /// Store any serializable value at `path`.
    pub fn set_serialized<T: Serialize + ?Sized>(
        &mut self,
        path: impl Into<KeyPath>,
        value: &T,
    ) -> Result<()> {
        self.set(path, Item::Value(to_value(value)?))
    }

    /// Store several values at once. Either all of them are applied or none.
    pub fn update<I, K, V>(&mut self, items: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Item>,
    {
        if self.state.is_fully_locked() {
            return Err(StoreError::read_only_store("update"));
        }

        let mut prepared = Vec::new();
        for (key, value) in items {
            let key = key.into();
            validate_key(&key)?;
            if self.state.is_locked(&key) {
                return Err(StoreError::read_only(key, "update"));
            }
            let slot = prepare(value.into())?;
            prepared.push((key, slot));
        }

        let keys: BTreeSet<String> = prepared.iter().map(|(k, _)| k.clone()).collect();
        for (key, slot) in prepared {
            self.commit(&key, slot);
        }
        self.invalidate_summary();
        self.auto_save_keys(keys)?;
        Ok(self)
    }

    /// Remove the value at `path` and return it.
    ///
    /// A key that was never loaded yields [`Removed::NotLoaded`]; its value
    /// is not read just to be handed back.
    pub fn pop(&mut self, path: impl Into<KeyPath>) -> Result<Removed> {
        let path = path.into();
        let (first, rest) = path.split_first()?;
        if self.state.is_locked(first) {
            return Err(StoreError::read_only(first, "pop"));
        }
        if !rest.is_empty() {
            let child = self
                .nested(first)?
                .ok_or_else(|| StoreError::KeyNotFound(first.to_string()))?;
            return child.pop(rest);
        }
        if !self.state.is_known(first) {
            return Err(StoreError::KeyNotFound(first.to_string()));
        }

        let unopened = self.state.is_unopened(first);
        let slot = self.entries.remove(first);
        self.state.unregister(first);
        self.invalidate_summary();
        debug!(key = first, "removed key");

        let removed = match slot {
            _ if unopened => Removed::NotLoaded,
            Some(Slot::Value(value)) => Removed::Value(value),
            Some(Slot::Store(child)) => Removed::Store(*child),
            Some(Slot::Unloaded) | None => Removed::NotLoaded,
        };
        self.auto_save_keys([first.to_string()].into_iter().collect())?;
        Ok(removed)
    }

    /// Remove the value at `path`.
    pub fn remove(&mut self, path: impl Into<KeyPath>) -> Result<&mut Self> {
        self.pop(path)?;
        Ok(self)
    }

    // --- Locks ---

    /// Lock `keys` against writes. Keys need not exist yet.
    pub fn lock<I, S>(&mut self, keys: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.state.lock(Some(&keys))?;
        self.after_lock_change();
        Ok(self)
    }

    /// Lock every currently known key.
    pub fn lock_all(&mut self) -> Result<&mut Self> {
        self.state.lock(None)?;
        self.after_lock_change();
        Ok(self)
    }

    pub fn unlock<I, S>(&mut self, keys: I) -> Result<&mut Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.state.unlock(Some(&keys))?;
        self.after_lock_change();
        Ok(self)
    }

    /// Drop the lock set entirely.
    pub fn unlock_all(&mut self) -> Result<&mut Self> {
        self.state.unlock(None)?;
        self.after_lock_change();
        Ok(self)
    }

    fn after_lock_change(&mut self) {
        self.refresh_child_locks();
        self.invalidate_summary();
    }

    // --- Internals ---

    /// Register a prepared value under `key`.
    fn commit(&mut self, key: &str, slot: Slot) {
        self.state.register(key);
        self.state.mark_dirty(key);
        match slot {
            Slot::Store(mut child) => {
                self.adopt(key, &mut child);
                self.entries.insert(key.to_string(), Slot::Store(child));
                self.state.mark_saveable(key);
            }
            other => {
                self.state.unmark_saveable(key);
                self.entries.insert(key.to_string(), other);
            }
        }
    }

    /// Bind a store assigned to `key` into this store's namespace.
    fn adopt(&self, key: &str, child: &mut Store) {
        child.state.set_inherited(false);
        child.refresh_child_locks();
        if let Some(path) = self.path.clone() {
            child.rebind(
                path,
                join_prefix(self.prefix.as_deref(), key),
                Arc::clone(&self.backend),
                self.auto_save,
                self.retry,
            );
            child.state.mark_all_dirty();
            child.replace_pending = true;
        }
        child.invalidate_summary();
    }

    fn auto_save_keys(&mut self, keys: BTreeSet<String>) -> Result<()> {
        if self.auto_save && self.path.is_some() {
            self.persist(SaveScope::Keys(keys), None)?;
        }
        Ok(())
    }
}

/// Turn an incoming item into a slot, loading whatever a store still lacks.
///
/// Fully read-only stores are copied in as plain data.
fn prepare(item: Item) -> Result<Slot> {
    match item {
        Item::Value(value) => Ok(Slot::Value(normalize(value)?)),
        Item::Store(mut store) if store.state.is_fully_locked() => {
            Ok(Slot::Value(store.to_value()?))
        }
        Item::Store(mut store) => {
            store.resolve_deep()?;
            Ok(Slot::Store(Box::new(store)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Entry, Value};
    use std::collections::BTreeMap;

    #[test]
    fn test_set_marks_dirty() {
        let mut store = Store::new();
        store.set("a", 1).unwrap();
        assert!(store.contains("a"));
        assert!(store.dirty_keys().contains("a"));
        assert_eq!(store.fetch("a").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_set_rejects_bad_keys() {
        let mut store = Store::new();
        assert!(matches!(store.set("", 1), Err(StoreError::InvalidKey(_))));
        assert!(matches!(store.set("a/b", 1), Err(StoreError::InvalidKey(_))));

        let mut nested = BTreeMap::new();
        nested.insert("bad/key".to_string(), Value::Int(1));
        assert!(matches!(
            store.set("m", nested),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn test_locked_key_rejects_writes() {
        let mut store = Store::new();
        store.set("a", 1).unwrap();
        store.lock(["a"]).unwrap();

        let err = store.set("a", 2).unwrap_err();
        assert!(matches!(err, StoreError::ReadOnly { key: Some(ref k), .. } if k == "a"));
        assert!(matches!(store.pop("a"), Err(StoreError::ReadOnly { .. })));
        store.set("b", 2).unwrap();

        store.unlock(["a"]).unwrap();
        store.set("a", 3).unwrap();
    }

    #[test]
    fn test_update_is_all_or_nothing() {
        let mut store = Store::new();
        store.lock(["locked"]).unwrap();

        let result = store.update([("a", Item::from(1)), ("locked", Item::from(2))]);
        assert!(result.is_err());
        assert!(store.is_empty());

        store
            .update([("a", Item::from(1)), ("b", Item::from("x"))])
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_pop_and_tombstone() {
        let mut store = Store::new();
        store.set("a", 1).unwrap();

        let removed = store.pop("a").unwrap();
        assert_eq!(removed.into_value(), Some(Value::Int(1)));
        assert!(!store.contains("a"));
        assert!(store.dirty_keys().is_empty());
        assert!(store.has_unsaved_changes());

        assert!(matches!(store.pop("a"), Err(StoreError::KeyNotFound(_))));
    }

    #[test]
    fn test_nested_set_through_child() {
        let mut store = Store::new();
        store.set("a", BTreeMap::<String, Value>::new()).unwrap();
        store.set(["a", "x"], 5).unwrap();

        assert_eq!(store.fetch(["a", "x"]).unwrap(), Value::Int(5));
        assert!(matches!(
            store.set(["missing", "x"], 1),
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_nested_set_respects_parent_lock() {
        let mut store = Store::new();
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Int(1));
        store.set("a", inner).unwrap();
        store.lock(["a"]).unwrap();

        assert!(matches!(
            store.set(["a", "x"], 2),
            Err(StoreError::ReadOnly { .. })
        ));

        let child = store.child("a").unwrap();
        assert!(matches!(child.set("x", 2), Err(StoreError::ReadOnly { .. })));
        assert!(matches!(child.unlock_all(), Err(StoreError::ReadOnly { .. })));
    }

    #[test]
    fn test_unlock_propagates_to_child() {
        let mut store = Store::new();
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Int(1));
        store.set("a", inner).unwrap();
        store.lock(["a"]).unwrap();
        assert!(store.child("a").unwrap().is_read_only());

        store.unlock_all().unwrap();
        let child = store.child("a").unwrap();
        assert!(!child.is_read_only());
        child.set("x", 2).unwrap();
    }

    #[test]
    fn test_set_store_value() {
        let mut child = Store::new();
        child.set("inner", 1).unwrap();

        let mut store = Store::new();
        store.set("c", child).unwrap();
        match store.get("c").unwrap() {
            Some(Entry::Store(child)) => {
                assert_eq!(child.fetch("inner").unwrap(), Value::Int(1))
            }
            other => panic!("expected a child store, got {:?}", other),
        }
    }

    #[test]
    fn test_set_serialized() {
        #[derive(Serialize)]
        struct Point {
            x: i64,
            y: i64,
        }

        let mut store = Store::new();
        store.set_serialized("p", &Point { x: 1, y: 2 }).unwrap();
        assert_eq!(store.fetch(["p", "y"]).unwrap(), Value::Int(2));
    }
}
