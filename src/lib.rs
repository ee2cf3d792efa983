//! # syncmap
//!
//! A hierarchical key-value store kept in sync with a single backing file.
//!
//! ## Core Concepts
//!
//! - **Lazy loading**: values can stay in the file until first accessed
//! - **Diff-based saves**: only keys changed since the last save are written
//! - **Locks**: a whole store, or single keys, can be made read-only
//! - **Child stores**: nested mappings are handed out as stores sharing the
//!   parent's file under a key prefix
//! - **Contention**: a save against a busy file is retried a bounded number
//!   of times before failing
//!
//! ## Example
//!
//! ```no_run
//! use syncmap::{Mode, OpenOptions, Store, Value};
//!
//! # fn main() -> syncmap::Result<()> {
//! let mut store = Store::open("results.skv", Mode::Append)?;
//! store.set("answer", 42)?;
//! store.set("params", Value::map())?;
//! store.set(["params", "lr"], 0.01)?;
//! store.save()?;
//!
//! let mut reader = OpenOptions::new(Mode::Read).lazy(true).open("results.skv")?;
//! assert_eq!(reader.fetch("answer")?.as_i64(), Some(42));
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod display;
pub mod error;
pub mod state;
pub mod store;
pub mod transform;
pub mod types;

// Re-exports
pub use backend::{Backend, FileBackend, FileLock, MemoryBackend, WriteBatch};
pub use display::KeyTree;
pub use error::{Result, StoreError};
pub use state::KeyState;
pub use store::{OpenOptions, RetryPolicy, Store};
pub use transform::{from_value, normalize, to_value};
pub use types::{
    Entry, Item, KeyPath, Mode, ReadOnly, Removed, SaveScope, Value, ValueKind, PREFIX_SEPARATOR,
};
