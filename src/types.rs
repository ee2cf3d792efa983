//! Core types for the synchronized store.

use crate::error::{Result, StoreError};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

/// Separator used to join key segments into a backing-store prefix.
pub const PREFIX_SEPARATOR: char = '/';

/// A storable value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Capability tag of a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueKind {
    Scalar,
    Array,
    Mapping,
}

impl Value {
    /// Empty mapping.
    pub fn map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Array(_) => ValueKind::Array,
            Value::Map(_) => ValueKind::Mapping,
            _ => ValueKind::Scalar,
        }
    }

    /// Short type name used in structural summaries.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Value {
    fn from(v: BTreeMap<String, T>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(v: HashMap<String, T>) -> Self {
        Value::Map(v.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Anything the mutation gate accepts as a new value.
#[derive(Debug)]
pub enum Item {
    /// Plain data, serialized inline.
    Value(Value),
    /// A store-capable object that persists itself under this store's namespace.
    Store(Store),
}

impl From<Store> for Item {
    fn from(store: Store) -> Self {
        Item::Store(store)
    }
}

macro_rules! item_from_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Item {
                fn from(v: $ty) -> Self {
                    Item::Value(Value::from(v))
                }
            }
        )*
    };
}

item_from_value!(Value, bool, i32, i64, u32, f32, f64, &str, String, serde_json::Value);

impl<T: Into<Value>> From<Vec<T>> for Item {
    fn from(v: Vec<T>) -> Self {
        Item::Value(Value::from(v))
    }
}

impl<T: Into<Value>> From<BTreeMap<String, T>> for Item {
    fn from(v: BTreeMap<String, T>) -> Self {
        Item::Value(Value::from(v))
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Item {
    fn from(v: HashMap<String, T>) -> Self {
        Item::Value(Value::from(v))
    }
}

/// Result of reading a key through [`Store::get`].
#[derive(Debug)]
pub enum Entry<'a> {
    /// Plain value. Owned (a deep copy) when the key is locked.
    Value(Cow<'a, Value>),
    /// Nested mapping materialized as a child store.
    Store(&'a mut Store),
}

impl<'a> Entry<'a> {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Entry::Value(value) => Some(value),
            Entry::Store(_) => None,
        }
    }

    pub fn into_store(self) -> Option<&'a mut Store> {
        match self {
            Entry::Store(store) => Some(store),
            Entry::Value(_) => None,
        }
    }

    pub fn is_store(&self) -> bool {
        matches!(self, Entry::Store(_))
    }
}

/// What [`Store::pop`] hands back.
#[derive(Debug)]
pub enum Removed {
    Value(Value),
    Store(Store),
    /// The key was never pulled from the backing store, so its value is unknown.
    NotLoaded,
}

impl Removed {
    pub fn into_value(self) -> Option<Value> {
        match self {
            Removed::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_not_loaded(&self) -> bool {
        matches!(self, Removed::NotLoaded)
    }
}

/// An ordered sequence of key segments addressing a nested value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct KeyPath(Vec<String>);

impl KeyPath {
    pub fn new(segments: Vec<String>) -> Self {
        KeyPath(segments)
    }

    /// Split a `/`-joined path into segments.
    pub fn parse(path: &str) -> Self {
        KeyPath(path.split(PREFIX_SEPARATOR).map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment and the rest; fails on an empty path.
    pub fn split_first(&self) -> Result<(&str, KeyPath)> {
        match self.0.split_first() {
            Some((first, rest)) => Ok((first.as_str(), KeyPath(rest.to_vec()))),
            None => Err(StoreError::InvalidKey(
                "key path must have at least one segment".into(),
            )),
        }
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl From<&str> for KeyPath {
    fn from(key: &str) -> Self {
        KeyPath(vec![key.to_string()])
    }
}

impl From<String> for KeyPath {
    fn from(key: String) -> Self {
        KeyPath(vec![key])
    }
}

impl From<&String> for KeyPath {
    fn from(key: &String) -> Self {
        KeyPath(vec![key.clone()])
    }
}

impl<const N: usize> From<[&str; N]> for KeyPath {
    fn from(keys: [&str; N]) -> Self {
        KeyPath(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl From<&[&str]> for KeyPath {
    fn from(keys: &[&str]) -> Self {
        KeyPath(keys.iter().map(|k| k.to_string()).collect())
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(keys: Vec<String>) -> Self {
        KeyPath(keys)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(keys: Vec<&str>) -> Self {
        KeyPath(keys.into_iter().map(str::to_string).collect())
    }
}

/// Open mode for a file-backed store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// `"r"`: fully locked; the file must exist.
    Read,
    /// `"w"`: mutable; the file must not exist unless overwrite is decided.
    Write,
    /// `"a"`: mutable; opens the existing file or creates it.
    Append,
    /// `"w="`: write mode with auto-save.
    WriteAutoSave,
    /// `"a="`: append mode with auto-save.
    AppendAutoSave,
}

impl Mode {
    pub fn is_read_only(self) -> bool {
        self == Mode::Read
    }

    pub fn auto_save(self) -> bool {
        matches!(self, Mode::WriteAutoSave | Mode::AppendAutoSave)
    }

    pub fn is_write(self) -> bool {
        matches!(self, Mode::Write | Mode::WriteAutoSave)
    }
}

impl FromStr for Mode {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "r" => Ok(Mode::Read),
            "w" => Ok(Mode::Write),
            "a" => Ok(Mode::Append),
            "w=" => Ok(Mode::WriteAutoSave),
            "a=" => Ok(Mode::AppendAutoSave),
            other => Err(StoreError::Configuration(format!(
                "unknown open mode '{}' (expected r, w, a, w= or a=)",
                other
            ))),
        }
    }
}

/// Lock state of a store.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum ReadOnly {
    /// Everything may be mutated.
    #[default]
    Mutable,
    /// Nothing may be mutated. Cannot be downgraded without reopening.
    All,
    /// Only the listed keys are locked.
    Keys(BTreeSet<String>),
}

impl ReadOnly {
    pub fn is_all(&self) -> bool {
        matches!(self, ReadOnly::All)
    }

    pub fn contains(&self, key: &str) -> bool {
        match self {
            ReadOnly::Mutable => false,
            ReadOnly::All => true,
            ReadOnly::Keys(keys) => keys.contains(key),
        }
    }
}

impl From<bool> for ReadOnly {
    fn from(v: bool) -> Self {
        if v {
            ReadOnly::All
        } else {
            ReadOnly::Mutable
        }
    }
}

/// Which part of a store a save flushes.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum SaveScope {
    /// Only keys mutated since the last save.
    #[default]
    Dirty,
    /// The whole mapping.
    All,
    /// Only the pending keys among the listed ones.
    Keys(BTreeSet<String>),
}

impl SaveScope {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SaveScope::Keys(keys.into_iter().map(Into::into).collect())
    }
}

/// Check that a single key segment is usable.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("key must not be empty".into()));
    }
    if key.contains(PREFIX_SEPARATOR) {
        return Err(StoreError::InvalidKey(format!(
            "key '{}' must not contain '{}'",
            key, PREFIX_SEPARATOR
        )));
    }
    Ok(())
}

/// Join a parent prefix and a key into a child prefix.
pub fn join_prefix(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) => format!("{}{}{}", prefix, PREFIX_SEPARATOR, key),
        None => key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parsing() {
        assert_eq!("r".parse::<Mode>().unwrap(), Mode::Read);
        assert_eq!("a=".parse::<Mode>().unwrap(), Mode::AppendAutoSave);
        assert!("a=".parse::<Mode>().unwrap().auto_save());
        assert!("w".parse::<Mode>().unwrap().is_write());
        assert!(matches!(
            "x".parse::<Mode>(),
            Err(StoreError::Configuration(_))
        ));
    }

    #[test]
    fn test_key_path_split() {
        let path = KeyPath::from(["a", "b", "c"]);
        let (first, rest) = path.split_first().unwrap();
        assert_eq!(first, "a");
        assert_eq!(rest, KeyPath::from(["b", "c"]));

        let empty = KeyPath::new(Vec::new());
        assert!(matches!(empty.split_first(), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_key_path_parse() {
        assert_eq!(KeyPath::parse("a/b"), KeyPath::from(["a", "b"]));
        assert_eq!(KeyPath::parse("a/b").to_string(), "a/b");
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("a").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("a/b").is_err());
    }

    #[test]
    fn test_join_prefix() {
        assert_eq!(join_prefix(None, "a"), "a");
        assert_eq!(join_prefix(Some("a"), "b"), "a/b");
    }

    #[test]
    fn test_read_only_contains() {
        let keys = ReadOnly::Keys(["a".to_string()].into_iter().collect());
        assert!(keys.contains("a"));
        assert!(!keys.contains("b"));
        assert!(ReadOnly::All.contains("anything"));
        assert!(!ReadOnly::Mutable.contains("a"));
    }

    #[test]
    fn test_value_from_json() {
        let value = Value::from(serde_json::json!({"a": 1, "b": [1.5, "x"], "c": null}));
        let map = value.as_map().unwrap();
        assert_eq!(map["a"], Value::Int(1));
        assert_eq!(
            map["b"],
            Value::Array(vec![Value::Float(1.5), Value::Str("x".into())])
        );
        assert!(map["c"].is_null());
    }
}
