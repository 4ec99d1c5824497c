//! A failing store degrades to a quiet baseline, and the degradation is
//! visible in the engine counters rather than silent.

use chrono::{Duration, TimeZone, Utc};
use geomon_core::{AnomalyCounts, Clock, ManualClock, Threshold, WindowStats, global_metrics};
use geomon_monitor::{AnomalyTracker, EngineOptions, SampleAggregator};
use geomon_storage::{MemoryStore, Result, StorageError, Store, Versioned};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Wraps a `MemoryStore` and fails every call while `down` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(StorageError::Io(std::io::Error::other("store offline")))
        } else {
            Ok(())
        }
    }
}

impl Store for FlakyStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        self.check()?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<u64> {
        self.check()?;
        self.inner.set(key, bytes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.check()?;
        self.inner.delete(key)
    }

    fn compare_and_swap(&self, key: &str, expected_version: u64, bytes: &[u8]) -> Result<u64> {
        self.check()?;
        self.inner.compare_and_swap(key, expected_version, bytes)
    }
}

fn thresholds() -> Threshold {
    Threshold {
        warning_high: Some(80.0),
        abnormal_high: Some(90.0),
        ..Threshold::default()
    }
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap(),
    ))
}

#[test]
fn unreadable_store_reports_zero_counts_and_stats() {
    let store = Arc::new(FlakyStore::default());
    let clock = clock();

    // Real history exists before the outage.
    let mut tracker = AnomalyTracker::new(
        "pressure",
        Some(thresholds()),
        store.clone(),
        clock.clone(),
        EngineOptions::default(),
    );
    let mut agg = SampleAggregator::new(
        "pressure",
        store.clone(),
        clock.clone(),
        EngineOptions::default(),
    );
    tracker.observe(95.0, clock.now());
    agg.record(95.0, clock.now());
    assert_eq!(tracker.counts().last12h, 1);

    store.down.store(true, Ordering::SeqCst);
    let reads_before = global_metrics().store_read_failures.load();

    // Quiet baseline: indistinguishable from "nothing happened"...
    assert_eq!(tracker.counts(), AnomalyCounts::default());
    assert_eq!(agg.stats(), WindowStats::default());

    // ...except through the failure counters.
    assert!(global_metrics().store_read_failures.load() >= reads_before + 2);

    // Back online: the history was never clobbered.
    store.down.store(false, Ordering::SeqCst);
    assert_eq!(tracker.counts().last12h, 1);
    assert_eq!(agg.history().len(), 1);
}

#[test]
fn events_detected_during_outage_are_kept_and_persisted_later() {
    let store = Arc::new(FlakyStore::default());
    let clock = clock();
    let mut tracker = AnomalyTracker::new(
        "temperature",
        Some(thresholds()),
        store.clone(),
        clock.clone(),
        EngineOptions::default(),
    );

    store.down.store(true, Ordering::SeqCst);
    let obs = tracker.observe(95.0, clock.now());
    assert!(obs.edge);
    assert!(!obs.persisted);
    assert_eq!(tracker.unsaved_len(), 1);

    store.down.store(false, Ordering::SeqCst);
    tracker.observe(50.0, clock.now());
    clock.advance(Duration::minutes(1));
    let obs = tracker.observe(85.0, clock.now());
    assert!(obs.persisted);
    assert_eq!(tracker.unsaved_len(), 0);
    assert_eq!(tracker.events().len(), 2);
    assert_eq!(tracker.counts().last12h, 2);
}

#[test]
fn write_failures_never_reach_the_caller() {
    let store = Arc::new(FlakyStore::default());
    let clock = clock();
    let mut agg = SampleAggregator::new(
        "flow",
        store.clone(),
        clock.clone(),
        EngineOptions::default(),
    );
    store.down.store(true, Ordering::SeqCst);
    assert!(!agg.offer(250.0, clock.now()));
    assert!(!agg.flush());
    assert!((agg.stats().current - 250.0).abs() < f64::EPSILON);

    // The first value is still pending, so the next flush retries it.
    store.down.store(false, Ordering::SeqCst);
    assert!(agg.flush());
    assert_eq!(agg.history().len(), 1);
}

#[test]
fn corrupt_blob_decodes_empty_and_is_overwritten() {
    let store = Arc::new(MemoryStore::new());
    let clock = clock();
    store
        .set(&geomon_storage::metric_stats_key("dryness"), b"{not json")
        .unwrap();
    let mut agg = SampleAggregator::new(
        "dryness",
        store.clone(),
        clock.clone(),
        EngineOptions::default(),
    );
    assert_eq!(agg.stats(), WindowStats::default());
    assert!(agg.record(99.0, clock.now()));
    assert_eq!(agg.history().len(), 1);
}

/// Answers the first `remaining` reads with an undecodable-envelope error,
/// as a `FileStore` does for a corrupt file.
struct CorruptReads {
    inner: MemoryStore,
    remaining: AtomicUsize,
}

impl Store for CorruptReads {
    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let corrupt = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if corrupt {
            return Err(serde_json::from_slice::<serde_json::Value>(b"{").unwrap_err().into());
        }
        self.inner.get(key)
    }

    fn set(&self, key: &str, bytes: &[u8]) -> Result<u64> {
        self.inner.set(key, bytes)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn compare_and_swap(&self, key: &str, expected_version: u64, bytes: &[u8]) -> Result<u64> {
        self.inner.compare_and_swap(key, expected_version, bytes)
    }
}

#[test]
fn two_writers_replacing_a_corrupt_history_keep_both_events() {
    let store = Arc::new(CorruptReads {
        inner: MemoryStore::new(),
        remaining: AtomicUsize::new(2),
    });
    let clock = clock();
    let tracker = |store: Arc<CorruptReads>| {
        AnomalyTracker::new(
            "pressure",
            Some(thresholds()),
            store,
            clock.clone(),
            EngineOptions::default(),
        )
    };
    let mut a = tracker(store.clone());
    let mut b = tracker(store.clone());

    // The second tracker still reads the corrupt value after the first
    // one has replaced it.
    assert!(a.observe(95.0, clock.now()).persisted);
    assert!(b.observe(96.0, clock.now()).persisted);

    let events = a.events();
    assert_eq!(events.len(), 2);
    assert!((events[0].value - 95.0).abs() < f64::EPSILON);
    assert!((events[1].value - 96.0).abs() < f64::EPSILON);
}
