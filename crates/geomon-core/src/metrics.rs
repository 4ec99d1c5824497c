//! Lock-free engine counters and a global snapshot surface.
//!
//! Recording is O(1) with relaxed atomics so the sample path never blocks on
//! bookkeeping. Failures that the engine swallows (store read/write errors,
//! malformed stored entries) are made visible here instead.

#![forbid(unsafe_code)]

use serde::Serialize;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counter {
    v: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            v: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc(&self) {
        self.v.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, delta: u64) {
        self.v.fetch_add(delta, Ordering::Relaxed);
    }

    #[inline]
    pub fn load(&self) -> u64 {
        self.v.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store(&self, value: u64) {
        self.v.store(value, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Samples passed to an anomaly tracker.
    pub samples_observed: Counter,
    /// Normal-to-anomalous edges persisted.
    pub anomaly_events_logged: Counter,
    /// Finite samples accepted by an aggregator.
    pub samples_recorded: Counter,
    /// Non-finite samples dropped by an aggregator.
    pub samples_rejected: Counter,
    pub stats_flushes: Counter,
    pub store_read_failures: Counter,
    pub store_write_failures: Counter,
    /// Malformed entries skipped while decoding a stored history.
    pub store_decode_skips: Counter,
    /// Compare-and-swap attempts that lost a race and retried.
    pub cas_conflicts: Counter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineMetricsSnapshot {
    pub samples_observed: u64,
    pub anomaly_events_logged: u64,
    pub samples_recorded: u64,
    pub samples_rejected: u64,
    pub stats_flushes: u64,
    pub store_read_failures: u64,
    pub store_write_failures: u64,
    pub store_decode_skips: u64,
    pub cas_conflicts: u64,
}

impl EngineMetrics {
    #[must_use]
    pub fn snapshot(&self) -> EngineMetricsSnapshot {
        EngineMetricsSnapshot {
            samples_observed: self.samples_observed.load(),
            anomaly_events_logged: self.anomaly_events_logged.load(),
            samples_recorded: self.samples_recorded.load(),
            samples_rejected: self.samples_rejected.load(),
            stats_flushes: self.stats_flushes.load(),
            store_read_failures: self.store_read_failures.load(),
            store_write_failures: self.store_write_failures.load(),
            store_decode_skips: self.store_decode_skips.load(),
            cas_conflicts: self.cas_conflicts.load(),
        }
    }
}

static GLOBAL_METRICS: LazyLock<EngineMetrics> = LazyLock::new(EngineMetrics::default);

#[must_use]
pub fn global_metrics() -> &'static EngineMetrics {
    &GLOBAL_METRICS
}
