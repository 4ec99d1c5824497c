//! JSON encoding of stored histories.
//!
//! Histories are JSON arrays of records with RFC 3339 timestamps. Decoding is
//! tolerant: a malformed entry is skipped, and a blob that is not an array at
//! all decodes as an empty history. Both cases are counted in
//! `store_decode_skips`.

use geomon_core::global_metrics;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialize a history list.
pub fn encode_history<T: Serialize>(entries: &[T]) -> crate::Result<Vec<u8>> {
    Ok(serde_json::to_vec(entries)?)
}

/// Result of a tolerant decode.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<T> {
    pub entries: Vec<T>,
    /// Entries dropped because they did not match the record shape.
    pub skipped: usize,
    /// The blob as a whole was not a JSON array.
    pub corrupt: bool,
}

/// Decode a stored history, skipping anything that does not parse.
///
/// `key` is only used for log context.
#[must_use]
pub fn decode_history<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Decoded<T> {
    let raw: Vec<serde_json::Value> = match serde_json::from_slice(bytes) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(key, error = %e, "stored history is unreadable; treating as empty");
            global_metrics().store_decode_skips.inc();
            return Decoded {
                entries: Vec::new(),
                skipped: 0,
                corrupt: true,
            };
        }
    };

    let mut entries = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;
    for value in raw {
        match serde_json::from_value::<T>(value) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                tracing::debug!(key, error = %e, "skipping malformed history entry");
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        global_metrics()
            .store_decode_skips
            .add(u64::try_from(skipped).unwrap_or(u64::MAX));
    }
    Decoded {
        entries,
        skipped,
        corrupt: false,
    }
}
