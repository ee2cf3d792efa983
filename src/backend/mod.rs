//! Backing-store collaborators.
//!
//! A [`Backend`] persists a tree of [`Value`]s per file path. Stores address
//! their keys inside that tree through an optional `/`-joined prefix, so a
//! child store writes under its parent's namespace in the same file.

mod file;
mod memory;

pub use file::{FileBackend, FileLock};
pub use memory::MemoryBackend;

use crate::error::Result;
use crate::types::{Value, PREFIX_SEPARATOR};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::SystemTime;

/// A set of changes to apply under one prefix.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteBatch {
    /// Clear the group at the prefix before applying `entries`.
    pub replace: bool,
    /// `None` removes the key from the file.
    pub entries: BTreeMap<String, Option<Value>>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replacing() -> Self {
        Self {
            replace: true,
            entries: BTreeMap::new(),
        }
    }

    pub fn put(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), Some(value));
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.entries.insert(key.into(), None);
    }

    pub fn is_empty(&self) -> bool {
        !self.replace && self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Storage backend for synchronized stores.
///
/// Implementations must be thread-safe (`Send + Sync`); a store shares its
/// backend with every child store it materializes.
pub trait Backend: Send + Sync {
    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Read the values of `keys` (or every key) in the group at `prefix`.
    ///
    /// Missing keys are absent from the result. A missing prefix yields an
    /// empty map.
    fn read(
        &self,
        path: &Path,
        prefix: Option<&str>,
        keys: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Value>>;

    /// List the keys of the group at `prefix` without decoding their values
    /// into the caller.
    fn list_keys(&self, path: &Path, prefix: Option<&str>) -> Result<BTreeSet<String>>;

    /// Apply `batch` under `prefix` and return the new modification time.
    ///
    /// Fails with [`StoreError::FileLocked`](crate::StoreError::FileLocked)
    /// while another writer holds the file.
    fn write(&self, path: &Path, prefix: Option<&str>, batch: &WriteBatch) -> Result<SystemTime>;

    /// Last modification time of the file.
    fn modified(&self, path: &Path) -> Result<SystemTime>;
}

/// Group at `prefix`, if every segment exists and is a mapping.
pub(crate) fn group<'a>(
    root: &'a BTreeMap<String, Value>,
    prefix: Option<&str>,
) -> Option<&'a BTreeMap<String, Value>> {
    let mut current = root;
    if let Some(prefix) = prefix {
        for segment in prefix.split(PREFIX_SEPARATOR) {
            current = current.get(segment)?.as_map()?;
        }
    }
    Some(current)
}

/// Group at `prefix`, creating (or replacing non-mapping values with) empty
/// mappings along the way.
pub(crate) fn group_mut<'a>(
    root: &'a mut BTreeMap<String, Value>,
    prefix: Option<&str>,
) -> &'a mut BTreeMap<String, Value> {
    let mut current = root;
    if let Some(prefix) = prefix {
        for segment in prefix.split(PREFIX_SEPARATOR) {
            let slot = current.entry(segment.to_string()).or_insert_with(Value::map);
            current = ensure_map(slot);
        }
    }
    current
}

fn ensure_map(slot: &mut Value) -> &mut BTreeMap<String, Value> {
    if !matches!(slot, Value::Map(_)) {
        *slot = Value::map();
    }
    match slot {
        Value::Map(map) => map,
        _ => unreachable!("slot was just replaced by a mapping"),
    }
}

/// Select `keys` (or all keys) from the group at `prefix`.
pub(crate) fn select(
    root: &BTreeMap<String, Value>,
    prefix: Option<&str>,
    keys: Option<&BTreeSet<String>>,
) -> BTreeMap<String, Value> {
    let Some(found) = group(root, prefix) else {
        return BTreeMap::new();
    };
    match keys {
        Some(keys) => keys
            .iter()
            .filter_map(|k| found.get(k).map(|v| (k.clone(), v.clone())))
            .collect(),
        None => found.clone(),
    }
}

/// Apply a batch to an in-memory tree.
pub(crate) fn apply_batch(
    root: &mut BTreeMap<String, Value>,
    prefix: Option<&str>,
    batch: &WriteBatch,
) {
    let target = group_mut(root, prefix);
    if batch.replace {
        target.clear();
    }
    for (key, value) in &batch.entries {
        match value {
            Some(value) => {
                target.insert(key.clone(), value.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}
