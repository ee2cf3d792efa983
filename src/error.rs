//! Error types for the synchronized store.

use thiserror::Error;

/// Main error type for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Mutation attempted against a locked key or a fully read-only store.
    #[error("{}", read_only_message(.key, .action))]
    ReadOnly { key: Option<String>, action: String },

    /// The backing file is held by another writer.
    #[error("File is locked: {0}")]
    FileLocked(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },
}

impl StoreError {
    /// Read-only violation on a single key.
    pub fn read_only(key: impl Into<String>, action: &str) -> Self {
        StoreError::ReadOnly {
            key: Some(key.into()),
            action: action.to_string(),
        }
    }

    /// Read-only violation on the whole store.
    pub fn read_only_store(action: &str) -> Self {
        StoreError::ReadOnly {
            key: None,
            action: action.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::FileLocked(_))
    }
}

fn read_only_message(key: &Option<String>, action: &str) -> String {
    match key {
        Some(key) => format!("Cannot {} a read-only key '{}'", action, key),
        None => format!("Cannot {} a read-only store", action),
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
