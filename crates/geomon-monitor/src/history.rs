//! Read-modify-write access to one persisted history list.

use geomon_core::global_metrics;
use geomon_storage::codec::{decode_history, encode_history};
use geomon_storage::{StorageError, Store};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// How a write should be applied after a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Base {
    /// Compare-and-swap against this version (`0` = absent).
    Version(u64),
    /// The stored value is unreadable as a whole; replace it, unless another
    /// writer already has.
    Overwrite,
    /// The store could not be reached; do not write.
    Unavailable,
}

/// Why an update did not land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    ReadUnavailable,
    Store,
    RetriesExhausted,
}

#[derive(Clone)]
pub struct PersistedHistory {
    key: String,
    store: Arc<dyn Store>,
    cas_max_retries: u32,
}

impl std::fmt::Debug for PersistedHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedHistory")
            .field("key", &self.key)
            .field("cas_max_retries", &self.cas_max_retries)
            .finish_non_exhaustive()
    }
}

impl PersistedHistory {
    pub fn new(key: String, store: Arc<dyn Store>, cas_max_retries: u32) -> Self {
        Self {
            key,
            store,
            cas_max_retries,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn read<T: DeserializeOwned>(&self) -> (Base, Vec<T>) {
        match self.store.get(&self.key) {
            Ok(Some(stored)) => (
                Base::Version(stored.version),
                decode_history(&self.key, &stored.bytes).entries,
            ),
            Ok(None) => (Base::Version(0), Vec::new()),
            Err(e) => {
                global_metrics().store_read_failures.inc();
                tracing::warn!(key = %self.key, error = %e, "history read failed; treating as empty");
                let base = if matches!(e, StorageError::Json(_)) {
                    Base::Overwrite
                } else {
                    Base::Unavailable
                };
                (base, Vec::new())
            }
        }
    }

    /// Current entries; empty when absent or unreadable.
    pub fn load<T: DeserializeOwned>(&self) -> Vec<T> {
        self.read().1
    }

    /// Apply `mutate` to a fresh copy of the history and write it back,
    /// retrying on version conflicts.
    pub fn update<T, F>(&self, mut mutate: F) -> Result<Vec<T>, WriteFailure>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut Vec<T>),
    {
        for _ in 0..=self.cas_max_retries {
            let (base, mut entries) = self.read::<T>();
            if base == Base::Unavailable {
                return Err(WriteFailure::ReadUnavailable);
            }
            mutate(&mut entries);
            let bytes = encode_history(&entries).map_err(|e| self.write_failed(&e))?;
            let written = match base {
                Base::Version(version) => self.store.compare_and_swap(&self.key, version, &bytes),
                Base::Overwrite => self.store.replace_unreadable(&self.key, &bytes),
                Base::Unavailable => return Err(WriteFailure::ReadUnavailable),
            };
            match written {
                Ok(_) => return Ok(entries),
                Err(e) if e.is_conflict() => {
                    global_metrics().cas_conflicts.inc();
                    tracing::debug!(key = %self.key, "history write lost a race; retrying");
                }
                Err(e) => return Err(self.write_failed(&e)),
            }
        }
        global_metrics().store_write_failures.inc();
        tracing::warn!(
            key = %self.key,
            retries = self.cas_max_retries,
            "history write abandoned after repeated conflicts"
        );
        Err(WriteFailure::RetriesExhausted)
    }

    pub fn clear(&self) -> geomon_storage::Result<()> {
        self.store.delete(&self.key)
    }

    fn write_failed(&self, e: &StorageError) -> WriteFailure {
        global_metrics().store_write_failures.inc();
        tracing::warn!(key = %self.key, error = %e, "history write failed");
        WriteFailure::Store
    }
}
