//! Versioned key/value storage for geomon
//!
//! Every stored value carries a monotonically increasing version so that
//! read-modify-write cycles can be made safe with [`Store::compare_and_swap`].
//! Two implementations are provided:
//!
//! - [`MemoryStore`]: mutex-guarded map for tests and single-process use.
//! - [`FileStore`]: one JSON envelope per key under a root directory, written
//!   atomically and serialized across processes with an advisory lock.

#![forbid(unsafe_code)]

pub mod codec;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),
}

impl StorageError {
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Conflict { .. } => "CONFLICT",
            Self::LockTimeout(_) => "LOCK_TIMEOUT",
            Self::InvalidKey(_) => "INVALID_KEY",
        }
    }

    /// True for a lost compare-and-swap race.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A stored value and the version it was written at. Version `0` is reserved
/// for "absent".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub bytes: Vec<u8>,
}

/// Persistent string-keyed blob store.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Unconditional write. Returns the new version.
    fn set(&self, key: &str, bytes: &[u8]) -> Result<u64>;

    /// Remove `key`. Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Write `bytes` only if the stored version still equals
    /// `expected_version` (`0` when the caller saw no value). Returns the new
    /// version, or [`StorageError::Conflict`] when another writer got there
    /// first.
    fn compare_and_swap(&self, key: &str, expected_version: u64, bytes: &[u8]) -> Result<u64>;

    /// Write `bytes` over a value that [`Store::get`] could not decode.
    ///
    /// Like `compare_and_swap(key, 0, bytes)`, except that an unreadable
    /// stored value also counts as absent. Once any writer has replaced it,
    /// later callers get [`StorageError::Conflict`] and must re-read.
    fn replace_unreadable(&self, key: &str, bytes: &[u8]) -> Result<u64> {
        self.compare_and_swap(key, 0, bytes)
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Key prefix for a metric's anomaly event history.
pub const ANOMALY_HISTORY_PREFIX: &str = "anomaly_history_";
/// Key prefix for a metric's sample history.
pub const METRIC_STATS_PREFIX: &str = "metric_stats_";

const fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-')
}

/// Reject keys that are empty, contain characters outside `[A-Za-z0-9_.:-]`,
/// or consist only of dots.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || !key.chars().all(is_key_char) || key.chars().all(|c| c == '.') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Escape a metric key into the storage key alphabet.
///
/// `-` is the escape character: disallowed bytes (and `-` itself) become
/// `-HH`, so distinct metric keys never share a storage key.
#[must_use]
pub fn escape_metric_key(metric_key: &str) -> String {
    let mut out = String::with_capacity(metric_key.len());
    for c in metric_key.chars() {
        if c != '-' && is_key_char(c) {
            out.push(c);
        } else {
            let mut buf = [0u8; 4];
            for b in c.encode_utf8(&mut buf).bytes() {
                let _ = write!(out, "-{b:02X}");
            }
        }
    }
    out
}

#[must_use]
pub fn anomaly_history_key(metric_key: &str) -> String {
    format!("{ANOMALY_HISTORY_PREFIX}{}", escape_metric_key(metric_key))
}

#[must_use]
pub fn metric_stats_key(metric_key: &str) -> String {
    format!("{METRIC_STATS_PREFIX}{}", escape_metric_key(metric_key))
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Versioned>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Versioned>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        validate_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<u64> {
        validate_key(key)?;
        let mut entries = self.entries();
        let version = entries.get(key).map_or(0, |v| v.version) + 1;
        entries.insert(
            key.to_string(),
            Versioned {
                version,
                bytes: bytes.to_vec(),
            },
        );
        Ok(version)
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.entries().remove(key);
        Ok(())
    }

    fn compare_and_swap(&self, key: &str, expected_version: u64, bytes: &[u8]) -> Result<u64> {
        validate_key(key)?;
        let mut entries = self.entries();
        let actual = entries.get(key).map_or(0, |v| v.version);
        if actual != expected_version {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        let version = actual + 1;
        entries.insert(
            key.to_string(),
            Versioned {
                version,
                bytes: bytes.to_vec(),
            },
        );
        Ok(version)
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// On-disk representation of one key.
#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u64,
    data: serde_json::Value,
}

/// File-backed store: `<root>/<key>.json`, guarded by `<root>/<key>.lock`.
///
/// Payloads must be JSON; every geomon history is.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FileStore {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock_timeout: Self::DEFAULT_LOCK_TIMEOUT,
        })
    }

    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    fn read_envelope(&self, key: &str) -> Result<Option<Envelope>> {
        match fs::read(self.data_path(key)) {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_envelope(&self, key: &str, version: u64, bytes: &[u8]) -> Result<u64> {
        let data: serde_json::Value = serde_json::from_slice(bytes)?;
        let envelope = serde_json::to_vec(&Envelope { version, data })?;
        atomic_write_bytes(&self.data_path(key), &envelope)?;
        Ok(version)
    }

    /// Take the per-key advisory lock, retrying with backoff until the
    /// configured timeout elapses.
    fn lock_key(&self, key: &str) -> Result<KeyLock> {
        let path = self.root.join(format!("{key}.lock"));
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            if file.try_lock_exclusive().is_ok() {
                return Ok(KeyLock { file });
            }
            if started.elapsed() >= self.lock_timeout {
                tracing::warn!(key, waited = ?started.elapsed(), "store lock timed out");
                return Err(StorageError::LockTimeout(key.to_string()));
            }
            let sleep_ms = (5u64 << attempt.min(5)).min(100);
            std::thread::sleep(Duration::from_millis(sleep_ms));
            attempt = attempt.saturating_add(1);
        }
    }
}

struct KeyLock {
    file: fs::File,
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        validate_key(key)?;
        let Some(envelope) = self.read_envelope(key)? else {
            return Ok(None);
        };
        Ok(Some(Versioned {
            version: envelope.version,
            bytes: serde_json::to_vec(&envelope.data)?,
        }))
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<u64> {
        validate_key(key)?;
        let _lock = self.lock_key(key)?;
        // An unreadable envelope is overwritten rather than blocking writes.
        let current = self.read_envelope(key).ok().flatten().map_or(0, |e| e.version);
        self.write_envelope(key, current + 1, bytes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let _lock = self.lock_key(key)?;
        match fs::remove_file(self.data_path(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn compare_and_swap(&self, key: &str, expected_version: u64, bytes: &[u8]) -> Result<u64> {
        validate_key(key)?;
        let _lock = self.lock_key(key)?;
        let actual = self.read_envelope(key)?.map_or(0, |e| e.version);
        if actual != expected_version {
            return Err(StorageError::Conflict {
                key: key.to_string(),
                expected: expected_version,
                actual,
            });
        }
        self.write_envelope(key, actual + 1, bytes)
    }

    fn replace_unreadable(&self, key: &str, bytes: &[u8]) -> Result<u64> {
        validate_key(key)?;
        let _lock = self.lock_key(key)?;
        match self.read_envelope(key) {
            Ok(None) | Err(StorageError::Json(_)) => self.write_envelope(key, 1, bytes),
            Ok(Some(envelope)) => Err(StorageError::Conflict {
                key: key.to_string(),
                expected: 0,
                actual: envelope.version,
            }),
            Err(e) => Err(e),
        }
    }
}

/// Write `data` to `path` via a temp file in the same directory and a rename.
fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    use std::io::Write as _;
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = parent.join(format!(
        ".tmp-{}-{seq}-{}",
        std::process::id(),
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    ));
    let mut f = fs::File::create(&tmp_path)?;
    f.write_all(data)?;
    f.sync_data()?;
    fs::rename(&tmp_path, path).map_err(|e| {
        let _ = fs::remove_file(&tmp_path);
        e.into()
    })
}
