//! Open options and retry configuration.

use crate::backend::{Backend, FileBackend};
use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::types::{Mode, ReadOnly};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// How many times a contended write is attempted, and how long to wait in between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total write attempts, including the first one.
    pub max_attempts: u32,
    /// Blocking wait between two attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Fail on the first contended write.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Whether another attempt may follow attempt number `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    /// 5 attempts, 1s apart.
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Options for opening a file-backed [`Store`].
#[derive(Clone)]
pub struct OpenOptions {
    pub(crate) mode: Mode,
    pub(crate) overwrite: Option<bool>,
    pub(crate) auto_save: bool,
    pub(crate) lazy: bool,
    pub(crate) read_only: Option<ReadOnly>,
    pub(crate) retry: RetryPolicy,
    pub(crate) backend: Option<Arc<dyn Backend>>,
}

impl OpenOptions {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            overwrite: None,
            auto_save: false,
            lazy: false,
            read_only: None,
            retry: RetryPolicy::default(),
            backend: None,
        }
    }

    /// Decide what happens to an existing file in write mode: `true`
    /// replaces it on the first save, `false` opens it.
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = Some(overwrite);
        self
    }

    /// Persist every mutation immediately.
    pub fn auto_save(mut self, auto_save: bool) -> Self {
        self.auto_save = auto_save;
        self
    }

    /// Only list keys on open; values are pulled on first access.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Lock state for a mutable mode, e.g. a set of locked keys.
    pub fn read_only(mut self, read_only: ReadOnly) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Open the store at `path`.
    pub fn open(&self, path: impl AsRef<Path>) -> Result<Store> {
        Store::open_with(path, self)
    }

    pub(crate) fn backend_or_default(&self) -> Arc<dyn Backend> {
        self.backend
            .clone()
            .unwrap_or_else(|| Arc::new(FileBackend::default()))
    }

    /// Effective lock state, auto-save flag and overwrite decision.
    pub(crate) fn resolve(&self) -> Result<(ReadOnly, bool, Option<bool>)> {
        let auto_save = self.auto_save || self.mode.auto_save();
        let read_only = if self.mode.is_read_only() {
            ReadOnly::All
        } else {
            self.read_only.clone().unwrap_or_default()
        };
        let overwrite = match self.mode {
            Mode::Append | Mode::AppendAutoSave => Some(false),
            _ => self.overwrite,
        };

        if read_only.is_all() && (overwrite == Some(true) || auto_save) {
            return Err(StoreError::Configuration(
                "a read-only store cannot be overwritten or auto-saved".into(),
            ));
        }
        if self.lazy && overwrite == Some(true) {
            return Err(StoreError::Configuration(
                "cannot overwrite a file and open it lazily".into(),
            ));
        }
        Ok((read_only, auto_save, overwrite))
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::new(Mode::Append)
    }
}

impl fmt::Debug for OpenOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenOptions")
            .field("mode", &self.mode)
            .field("overwrite", &self.overwrite)
            .field("auto_save", &self.auto_save)
            .field("lazy", &self.lazy)
            .field("read_only", &self.read_only)
            .field("retry", &self.retry)
            .field("custom_backend", &self.backend.is_some())
            .finish()
    }
}
