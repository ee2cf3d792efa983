//! Single-file backend.
//!
//! The whole tree is stored as one MessagePack document behind a small
//! header. Writers serialize on an advisory lock held on a sibling
//! `<file>.lock`; a held lock is reported as contention, never waited on.

use super::{apply_batch, group, select, Backend, WriteBatch};
use crate::error::{Result, StoreError};
use crate::types::Value;
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::debug;

/// Magic bytes for store files.
const FILE_MAGIC: &[u8; 4] = b"SKV\0";

/// Current file format version.
const FILE_VERSION: u8 = 1;

/// Header size: magic + version + payload length.
const HEADER_LEN: usize = 4 + 1 + 8;

/// Default number of decoded files kept in memory.
const DEFAULT_CACHE_SIZE: usize = 16;

type Tree = BTreeMap<String, Value>;

/// Decoded file contents, valid while the file's mtime, length and stored
/// checksum match.
#[derive(Clone)]
struct CachedTree {
    modified: SystemTime,
    len: u64,
    checksum: u32,
    root: Arc<Tree>,
}

/// Backend storing each tree in a single binary file.
pub struct FileBackend {
    /// LRU cache of decoded trees keyed by file path.
    cache: Mutex<LruCache<PathBuf, CachedTree>>,
}

impl FileBackend {
    /// Create a backend caching up to `cache_size` decoded files.
    pub fn new(cache_size: usize) -> Self {
        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// Decode the tree at `path`, reusing the cached copy when the file is unchanged.
    fn load(&self, path: &Path) -> Result<Arc<Tree>> {
        let metadata = fs::metadata(path)?;
        let modified = metadata.modified()?;
        let len = metadata.len();

        if len >= 4 {
            let checksum = read_trailer(path)?;
            if let Some(cached) = self.cache.lock().get(path) {
                if cached.modified == modified && cached.len == len && cached.checksum == checksum
                {
                    return Ok(Arc::clone(&cached.root));
                }
            }
        }

        let bytes = fs::read(path)?;
        let (root, checksum) = decode(&bytes)?;
        let root = Arc::new(root);
        self.cache.lock().put(
            path.to_path_buf(),
            CachedTree {
                modified,
                len: bytes.len() as u64,
                checksum,
                root: Arc::clone(&root),
            },
        );
        Ok(root)
    }
}

impl Default for FileBackend {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_SIZE)
    }
}

impl Backend for FileBackend {
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn read(
        &self,
        path: &Path,
        prefix: Option<&str>,
        keys: Option<&BTreeSet<String>>,
    ) -> Result<BTreeMap<String, Value>> {
        let root = self.load(path)?;
        Ok(select(&root, prefix, keys))
    }

    fn list_keys(&self, path: &Path, prefix: Option<&str>) -> Result<BTreeSet<String>> {
        let root = self.load(path)?;
        Ok(group(&root, prefix)
            .map(|g| g.keys().cloned().collect())
            .unwrap_or_default())
    }

    fn write(&self, path: &Path, prefix: Option<&str>, batch: &WriteBatch) -> Result<SystemTime> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }

        let lock = FileLock::acquire(path)?;

        let mut root = if path.exists() {
            (*self.load(path)?).clone()
        } else {
            Tree::new()
        };
        apply_batch(&mut root, prefix, batch);

        let (encoded, checksum) = encode(&root)?;
        let tmp = sibling(path, ".tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;

        let metadata = fs::metadata(path)?;
        let modified = metadata.modified()?;
        self.cache.lock().put(
            path.to_path_buf(),
            CachedTree {
                modified,
                len: metadata.len(),
                checksum,
                root: Arc::new(root),
            },
        );
        drop(lock);

        debug!(
            path = %path.display(),
            prefix = prefix.unwrap_or(""),
            keys = batch.len(),
            replace = batch.replace,
            "wrote store file"
        );
        Ok(modified)
    }

    fn modified(&self, path: &Path) -> Result<SystemTime> {
        Ok(fs::metadata(path)?.modified()?)
    }
}

/// Exclusive advisory lock on `<file>.lock`, released on drop.
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Try to take the write lock for `path` without blocking.
    pub fn acquire(path: &Path) -> Result<Self> {
        let lock_path = sibling(path, ".lock");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        file.try_lock_exclusive().map_err(|_| {
            StoreError::FileLocked(format!(
                "{} is being written by another writer",
                path.display()
            ))
        })?;

        Ok(Self {
            file,
            path: lock_path,
        })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// `path` with `suffix` appended to its file name.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Stored checksum, read from the last four bytes of the file.
fn read_trailer(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::End(-4))?;
    let mut trailer = [0u8; 4];
    file.read_exact(&mut trailer)?;
    Ok(u32::from_le_bytes(trailer))
}

fn encode(root: &Tree) -> Result<(Vec<u8>, u32)> {
    let payload = rmp_serde::to_vec(root)?;
    let checksum = crc32fast::hash(&payload);

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
    out.extend_from_slice(FILE_MAGIC);
    out.push(FILE_VERSION);
    out.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok((out, checksum))
}

fn decode(bytes: &[u8]) -> Result<(Tree, u32)> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(StoreError::InvalidFormat("Store file is truncated".into()));
    }
    if &bytes[0..4] != FILE_MAGIC {
        return Err(StoreError::InvalidFormat("Invalid store file magic".into()));
    }
    if bytes[4] != FILE_VERSION {
        return Err(StoreError::InvalidFormat(format!(
            "Unsupported store file version: {}",
            bytes[4]
        )));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
    let len = u64::from_le_bytes(len_bytes) as usize;
    if bytes.len() != HEADER_LEN + len + 4 {
        return Err(StoreError::InvalidFormat(format!(
            "Payload length {} does not match file size {}",
            len,
            bytes.len()
        )));
    }

    let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&bytes[HEADER_LEN + len..]);
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    Ok((rmp_serde::from_slice(payload)?, stored))
}
