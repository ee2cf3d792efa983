//! Human-readable summaries of a store's structure.

use crate::store::{Slot, Store};
use crate::transform::shape;
use crate::types::{ReadOnly, Value};
use serde_json::{Map, Value as Json};
use std::collections::BTreeMap;
use std::fmt;

/// Nested mappings are described down to this depth.
const MAX_DEPTH: usize = 3;

/// Mappings with more entries than this are collapsed to one line.
const MAX_ENTRIES: usize = 5;

/// Key structure of a store: `None` marks a leaf (or a key not loaded yet).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyTree(pub BTreeMap<String, Option<KeyTree>>);

impl KeyTree {
    pub fn get(&self, key: &str) -> Option<&Option<KeyTree>> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn of_map(map: &BTreeMap<String, Value>) -> Self {
        KeyTree(
            map.iter()
                .map(|(key, value)| {
                    let node = value.as_map().map(KeyTree::of_map);
                    (key.clone(), node)
                })
                .collect(),
        )
    }
}

impl Store {
    /// Nested key structure. Keys not loaded yet appear as leaves.
    pub fn keys_tree(&self) -> KeyTree {
        KeyTree(
            self.entries
                .iter()
                .map(|(key, slot)| {
                    let node = match slot {
                        Slot::Value(value) => value.as_map().map(KeyTree::of_map),
                        Slot::Store(child) => Some(child.keys_tree()),
                        Slot::Unloaded => None,
                    };
                    (key.clone(), node)
                })
                .collect(),
        )
    }

    /// Short mode tag: `r` read-only, `w` writable, `rw` partially locked,
    /// `l` not bound to a file.
    pub fn mode_tag(&self) -> &'static str {
        if self.state.is_fully_locked() {
            "r"
        } else if self.path.is_none() {
            "l"
        } else if matches!(self.state.read_only(), ReadOnly::Keys(keys) if !keys.is_empty()) {
            "rw"
        } else {
            "w"
        }
    }

    /// Structural summary, cached until the next change.
    ///
    /// Stores holding child stores are rendered fresh every time, since a
    /// child changes without its parent noticing.
    pub fn summary(&self) -> String {
        if self.children().next().is_some() {
            return render(self);
        }
        let mut cached = self.summary.lock();
        if let Some(summary) = cached.as_ref() {
            return summary.clone();
        }
        let summary = render(self);
        *cached = Some(summary.clone());
        summary
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = self.mode_tag();
        let not_saved = if mode != "r" && mode != "l" && self.has_unsaved_changes() {
            " (not saved)"
        } else {
            ""
        };
        writeln!(f, "Store ({}){}:", mode, not_saved)?;
        write!(f, "{}", self.summary())
    }
}

fn render(store: &Store) -> String {
    let structure = Json::Object(store_structure(store, MAX_DEPTH));
    let mut out = serde_json::to_string_pretty(&structure).unwrap_or_default();

    if let ReadOnly::Keys(locked) = store.state.read_only() {
        for key in locked {
            let quoted = Json::String(key.clone()).to_string();
            out = out.replace(
                &format!("\n  {}:", quoted),
                &format!("\n  {} (r):", quoted),
            );
        }
    }

    let unopened = store.state.unopened();
    if !unopened.is_empty() {
        let keys: Vec<&str> = unopened.iter().map(String::as_str).collect();
        out.push_str(&format!("\nUnloaded keys: [{}]", keys.join(", ")));
    }
    out
}

fn store_structure(store: &Store, level: usize) -> Map<String, Json> {
    let mut structure = Map::new();
    for (key, slot) in &store.entries {
        let described = match slot {
            Slot::Value(value) => describe(value, level),
            Slot::Store(child) => nested(store_structure(child, level.saturating_sub(1)), level),
            Slot::Unloaded => continue,
        };
        structure.insert(key.clone(), described);
    }
    structure
}

fn map_structure(map: &BTreeMap<String, Value>, level: usize) -> Map<String, Json> {
    map.iter()
        .map(|(key, value)| (key.clone(), describe(value, level)))
        .collect()
}

/// Collapse a nested structure that is too deep or too wide.
fn nested(inner: Map<String, Json>, level: usize) -> Json {
    if level == 0 || inner.len() > MAX_ENTRIES {
        Json::String("variable of type dict".into())
    } else if inner.is_empty() {
        Json::String("empty dict".into())
    } else {
        Json::Object(inner)
    }
}

fn describe(value: &Value, level: usize) -> Json {
    let text = match value {
        Value::Map(map) => return nested(map_structure(map, level.saturating_sub(1)), level),
        Value::Array(items) => {
            let dims = shape(value).unwrap_or_else(|| vec![items.len()]);
            format!("shape: {} (type: array)", format_shape(&dims))
        }
        Value::Int(i) => format!("{} (type: int)", i),
        Value::Float(v) => format!("{} (type: float)", format_float(*v)),
        Value::Bool(b) => format!("{} (type: bool)", b),
        other => format!("variable of type {}", other.type_name()),
    };
    Json::String(text)
}

fn format_shape(dims: &[usize]) -> String {
    match dims {
        [single] => format!("({},)", single),
        _ => {
            let parts: Vec<String> = dims.iter().map(|d| d.to_string()).collect();
            format!("({})", parts.join(", "))
        }
    }
}

fn format_float(v: f64) -> String {
    if (0.1..=100.0).contains(&v.abs()) {
        format!("{:.3}", v)
    } else {
        format!("{:.3e}", v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Store {
        let mut inner = BTreeMap::new();
        inner.insert("x".to_string(), Value::Int(1));
        let mut data = BTreeMap::new();
        data.insert("a".to_string(), Value::Map(inner));
        data.insert("f".to_string(), Value::Float(42.12345));
        data.insert("n".to_string(), Value::Int(7));
        data.insert(
            "m".to_string(),
            Value::Array(vec![
                Value::Array(vec![Value::Int(1), Value::Int(2)]),
                Value::Array(vec![Value::Int(3), Value::Int(4)]),
            ]),
        );
        Store::from_map(data).unwrap()
    }

    #[test]
    fn test_float_formatting() {
        assert_eq!(format_float(42.12345), "42.123");
        assert_eq!(format_float(0.01), "1.000e-2");
        assert_eq!(format_float(12346.0), "1.235e4");
    }

    #[test]
    fn test_shape_formatting() {
        assert_eq!(format_shape(&[3]), "(3,)");
        assert_eq!(format_shape(&[2, 3]), "(2, 3)");
    }

    #[test]
    fn test_summary_describes_values() {
        let store = sample();
        let summary = store.summary();
        assert!(summary.contains("7 (type: int)"));
        assert!(summary.contains("42.123 (type: float)"));
        assert!(summary.contains("shape: (2, 2) (type: array)"));
        assert!(summary.contains("\"x\": \"1 (type: int)\""));
    }

    #[test]
    fn test_wide_mapping_collapsed() {
        let wide: BTreeMap<String, Value> =
            (0..6).map(|i| (format!("k{}", i), Value::Int(i))).collect();
        let mut data = BTreeMap::new();
        data.insert("wide".to_string(), Value::Map(wide));
        let store = Store::from_map(data).unwrap();
        assert!(store.summary().contains("variable of type dict"));
    }

    #[test]
    fn test_display_header_and_lock_annotation() {
        let mut store = sample();
        assert!(store.to_string().starts_with("Store (l):"));

        store.lock(["n"]).unwrap();
        assert!(store.to_string().contains("\"n\" (r):"));
        assert_eq!(store.locked_keys(), vec!["n".to_string()]);
    }

    #[test]
    fn test_summary_cache_invalidated() {
        let mut store = Store::new();
        store.set("a", 1).unwrap();
        assert!(store.summary().contains("1 (type: int)"));
        store.set("a", 2).unwrap();
        assert!(store.summary().contains("2 (type: int)"));
    }

    #[test]
    fn test_keys_tree() {
        let mut store = sample();
        let tree = store.keys_tree();
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.get("n"), Some(&None));
        assert_eq!(tree.get("a").unwrap().as_ref().unwrap().len(), 1);

        store.child("a").unwrap();
        assert_eq!(store.keys_tree(), tree);
    }
}
