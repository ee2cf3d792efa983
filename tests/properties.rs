//! Property tests: a store driven by random operations must agree with a
//! plain map model, before and after going through the backend.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use syncmap::{MemoryBackend, Mode, OpenOptions, Store, Value};

const PATH: &str = "prop.skv";

#[derive(Clone, Debug)]
enum Op {
    Set(String, i64),
    Remove(String),
    Save,
    Close(String),
}

fn key() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["a", "b", "c", "d", "e"]).prop_map(str::to_string)
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (key(), any::<i64>()).prop_map(|(k, v)| Op::Set(k, v)),
        2 => key().prop_map(Op::Remove),
        1 => Just(Op::Save),
        1 => key().prop_map(Op::Close),
    ]
}

fn open(backend: &Arc<MemoryBackend>, lazy: bool) -> Store {
    OpenOptions::new(Mode::Append)
        .lazy(lazy)
        .backend(backend.clone())
        .open(PATH)
        .unwrap()
}

fn as_map(items: Vec<(String, Value)>) -> BTreeMap<String, Value> {
    items.into_iter().collect()
}

proptest! {
    #[test]
    fn prop_store_matches_model(ops in prop::collection::vec(op(), 1..40)) {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(&backend, false);
        let mut model: BTreeMap<String, Value> = BTreeMap::new();

        for op in ops {
            match op {
                Op::Set(k, v) => {
                    store.set(k.as_str(), v).unwrap();
                    model.insert(k, Value::Int(v));
                }
                Op::Remove(k) => {
                    let removed = store.pop(k.as_str());
                    prop_assert_eq!(removed.is_ok(), model.remove(&k).is_some());
                }
                Op::Save => {
                    store.save().unwrap();
                }
                Op::Close(k) => {
                    if model.contains_key(&k) {
                        store.close(&k).unwrap();
                    }
                }
            }
        }

        prop_assert_eq!(as_map(store.items().unwrap()), model.clone());

        store.save().unwrap();
        prop_assert!(!store.has_unsaved_changes());
        prop_assert_eq!(backend.file(PATH).unwrap_or_default(), model.clone());

        if backend.file(PATH).is_some() {
            let mut reopened = open(&backend, true);
            prop_assert_eq!(as_map(reopened.items().unwrap()), model);
        }
    }

    #[test]
    fn prop_second_save_writes_nothing(
        values in prop::collection::btree_map(key(), any::<i64>(), 1..5)
    ) {
        let backend = Arc::new(MemoryBackend::new());
        let mut store = open(&backend, false);
        store.update(values).unwrap();

        store.save().unwrap();
        let writes = backend.write_count();
        prop_assert!(store.dirty_keys().is_empty());

        store.save().unwrap();
        prop_assert_eq!(backend.write_count(), writes);
    }

    #[test]
    fn prop_locked_keys_never_change(
        locked in prop::collection::btree_set(key(), 1..4),
        writes in prop::collection::vec((key(), any::<i64>()), 1..20),
    ) {
        let mut store = Store::new();
        for k in ["a", "b", "c", "d", "e"] {
            store.set(k, 0).unwrap();
        }
        store.lock(locked.iter().cloned()).unwrap();

        for (k, v) in writes {
            let result = store.set(k.as_str(), v);
            prop_assert_eq!(result.is_err(), locked.contains(&k));
        }
        for k in &locked {
            prop_assert_eq!(store.fetch(k.as_str()).unwrap(), Value::Int(0));
            prop_assert!(store.pop(k.as_str()).is_err());
        }
    }
}
