//! Key-state tracking.
//!
//! Every store instance owns one [`KeyState`] that classifies its keys as
//! known, unopened, dirty, deleted or locked. The store engine consults it on
//! every read and routes every write through it.

mod tracker;

pub use tracker::KeyState;
