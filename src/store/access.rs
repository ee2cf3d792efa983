//! Reads and hierarchical addressing.

use super::{Slot, Store};
use crate::error::{Result, StoreError};
use crate::transform::from_value;
use crate::types::{Entry, KeyPath, Value};
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

impl Store {
    pub fn len(&self) -> usize {
        self.state.known().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.known().is_empty()
    }

    /// Whether `key` exists, loaded or not.
    pub fn contains(&self, key: &str) -> bool {
        self.state.is_known(key)
    }

    /// Every known key, including keys not loaded yet.
    pub fn keys(&self) -> &BTreeSet<String> {
        self.state.known()
    }

    /// Read the value at `path`.
    ///
    /// Non-empty mappings come back as child stores bound to this store's
    /// file. Values of locked keys are returned as copies. Absent keys give
    /// `Ok(None)`.
    pub fn get(&mut self, path: impl Into<KeyPath>) -> Result<Option<Entry<'_>>> {
        let path = path.into();
        let (first, rest) = path.split_first()?;
        if rest.is_empty() {
            return self.get_key(first);
        }
        match self.nested(first)? {
            Some(child) => child.get(rest),
            None => Ok(None),
        }
    }

    /// Read the value at `path`, failing with `KeyNotFound` when absent.
    pub fn fetch(&mut self, path: impl Into<KeyPath>) -> Result<Value> {
        let path = path.into();
        self.get_raw(path.clone())?
            .ok_or_else(|| StoreError::KeyNotFound(path.to_string()))
    }

    /// Read the plain value at `path`. Child stores are flattened back into
    /// mappings.
    pub fn get_raw(&mut self, path: impl Into<KeyPath>) -> Result<Option<Value>> {
        let path = path.into();
        let (first, rest) = path.split_first()?;
        if !rest.is_empty() {
            return match self.nested(first)? {
                Some(child) => child.get_raw(rest),
                None => Ok(None),
            };
        }

        self.resolve(first)?;
        match self.entries.get_mut(first) {
            Some(Slot::Value(value)) => Ok(Some(value.clone())),
            Some(Slot::Store(child)) => Ok(Some(child.to_value()?)),
            Some(Slot::Unloaded) | None => Ok(None),
        }
    }

    /// Like [`Store::get_raw`], falling back to `default`.
    pub fn get_raw_or(&mut self, path: impl Into<KeyPath>, default: Value) -> Result<Value> {
        Ok(self.get_raw(path)?.unwrap_or(default))
    }

    /// Decode the value at `path` into a caller type.
    pub fn get_as<T: DeserializeOwned>(&mut self, path: impl Into<KeyPath>) -> Result<Option<T>> {
        match self.get_raw(path)? {
            Some(value) => Ok(Some(from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The child store at `path`, materializing it from a mapping (empty or
    /// not) if needed.
    pub fn child(&mut self, path: impl Into<KeyPath>) -> Result<&mut Store> {
        let path = path.into();
        let (first, rest) = path.split_first()?;
        let child = self
            .nested(first)?
            .ok_or_else(|| StoreError::KeyNotFound(first.to_string()))?;
        if rest.is_empty() {
            Ok(child)
        } else {
            child.child(rest)
        }
    }

    /// Every key with its plain value. Unopened keys are loaded in one batch.
    pub fn items(&mut self) -> Result<Vec<(String, Value)>> {
        self.resolve_all()?;
        let keys: Vec<String> = self.state.known().iter().cloned().collect();
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get_raw(key.as_str())? {
                items.push((key, value));
            }
        }
        Ok(items)
    }

    /// Every plain value, in key order.
    pub fn values(&mut self) -> Result<Vec<Value>> {
        Ok(self.items()?.into_iter().map(|(_, value)| value).collect())
    }

    /// The whole store as one nested mapping, loading whatever is missing.
    pub fn to_value(&mut self) -> Result<Value> {
        self.resolve_all()?;
        let mut map = BTreeMap::new();
        for (key, slot) in self.entries.iter_mut() {
            match slot {
                Slot::Value(value) => {
                    map.insert(key.clone(), value.clone());
                }
                Slot::Store(child) => {
                    map.insert(key.clone(), child.to_value()?);
                }
                Slot::Unloaded => {}
            }
        }
        Ok(Value::Map(map))
    }

    fn get_key(&mut self, key: &str) -> Result<Option<Entry<'_>>> {
        self.resolve(key)?;
        let wraps = matches!(
            self.entries.get(key),
            Some(Slot::Value(Value::Map(map))) if !map.is_empty()
        );
        if wraps {
            self.materialize_child(key);
        }

        let locked = self.state.is_locked(key);
        match self.entries.get_mut(key) {
            Some(Slot::Store(child)) => Ok(Some(Entry::Store(child.as_mut()))),
            Some(Slot::Value(value)) if locked => Ok(Some(Entry::Value(Cow::Owned(value.clone())))),
            Some(Slot::Value(value)) => Ok(Some(Entry::Value(Cow::Borrowed(&*value)))),
            Some(Slot::Unloaded) | None => Ok(None),
        }
    }

    /// Child store for `key`, or `None` when the key is absent.
    pub(crate) fn nested(&mut self, key: &str) -> Result<Option<&mut Store>> {
        self.resolve(key)?;
        let is_map = match self.entries.get(key) {
            None => return Ok(None),
            Some(Slot::Value(Value::Map(_))) => true,
            Some(Slot::Value(other)) => {
                return Err(StoreError::InvalidKey(format!(
                    "'{}' holds {}, not a mapping",
                    key,
                    other.type_name()
                )))
            }
            Some(Slot::Store(_)) | Some(Slot::Unloaded) => false,
        };
        if is_map {
            self.materialize_child(key);
        }
        match self.entries.get_mut(key) {
            Some(Slot::Store(child)) => Ok(Some(child.as_mut())),
            _ => Ok(None),
        }
    }

    /// Replace the mapping at `key` with a child store over the same data.
    ///
    /// A child created from a key with unsaved changes owns those changes:
    /// its first save rewrites the whole group.
    fn materialize_child(&mut self, key: &str) {
        let data = match self.entries.get_mut(key) {
            Some(Slot::Value(Value::Map(data))) => std::mem::take(data),
            _ => return,
        };
        let mut child = self.child_from_map(key, data);
        if self.state.dirty().contains(key) {
            child.state.mark_all_dirty();
            child.replace_pending = true;
        }
        trace!(key, prefix = child.prefix.as_deref().unwrap_or(""), "materialized child store");

        self.entries.insert(key.to_string(), Slot::Store(Box::new(child)));
        self.state.mark_saveable(key);
    }
}
