//! Per-metric monitors and the registry that hands them out.
//!
//! A [`MetricMonitor`] is the single owner of one metric key's tracker and
//! aggregator. Consumers share it through [`MonitorHub`] and receive fresh
//! [`MonitorSnapshot`]s via [`MetricMonitor::subscribe`] instead of polling
//! and rewriting the store themselves.

#![forbid(unsafe_code)]

use crate::aggregator::SampleAggregator;
use crate::anomaly::{AnomalyTracker, Observation};
use crate::ticker::Ticker;
use crate::{EngineOptions, MonitorIntervals};
use chrono::{DateTime, Utc};
use geomon_core::{
    AnomalyCounts, Clock, Config, MetricSample, Status, Threshold, ThresholdCatalog, WindowStats,
};
use geomon_storage::Store;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a consumer displays for one metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub metric_key: String,
    pub status: Status,
    pub counts: AnomalyCounts,
    pub stats: WindowStats,
    pub updated_at: DateTime<Utc>,
}

/// State shared between a monitor and its workers.
struct MonitorState {
    metric_key: String,
    clock: Arc<dyn Clock>,
    tracker: Mutex<AnomalyTracker>,
    aggregator: Mutex<SampleAggregator>,
    snapshot: Mutex<MonitorSnapshot>,
    subscribers: Mutex<Vec<Sender<MonitorSnapshot>>>,
}

impl MonitorState {
    fn update_snapshot(&self, apply: impl FnOnce(&mut MonitorSnapshot)) {
        let current = {
            let mut snapshot = lock(&self.snapshot);
            apply(&mut snapshot);
            snapshot.updated_at = self.clock.now();
            snapshot.clone()
        };
        let mut subscribers = lock(&self.subscribers);
        subscribers.retain(|tx| tx.send(current.clone()).is_ok());
    }

    fn refresh_counts(&self) -> AnomalyCounts {
        let counts = lock(&self.tracker).counts();
        self.update_snapshot(|s| s.counts = counts);
        counts
    }

    fn refresh_stats(&self) -> WindowStats {
        let stats = lock(&self.aggregator).stats();
        self.update_snapshot(|s| s.stats = stats);
        stats
    }

    fn flush(&self) -> bool {
        let flushed = lock(&self.aggregator).flush();
        if flushed {
            self.refresh_stats();
        }
        flushed
    }
}

pub struct MetricMonitor {
    state: Arc<MonitorState>,
    workers: Mutex<Vec<Ticker>>,
}

impl std::fmt::Debug for MetricMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricMonitor")
            .field("metric_key", &self.state.metric_key)
            .field("workers", &lock(&self.workers).len())
            .finish_non_exhaustive()
    }
}

impl MetricMonitor {
    /// Build a monitor without background workers. Counts and statistics are
    /// computed once up front.
    #[must_use]
    pub fn new(
        metric_key: impl Into<String>,
        thresholds: Option<Threshold>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let metric_key = metric_key.into();
        let tracker = AnomalyTracker::new(
            metric_key.clone(),
            thresholds,
            Arc::clone(&store),
            Arc::clone(&clock),
            options,
        );
        let aggregator =
            SampleAggregator::new(metric_key.clone(), store, Arc::clone(&clock), options);
        let snapshot = MonitorSnapshot {
            metric_key: metric_key.clone(),
            status: Status::Normal,
            counts: tracker.counts(),
            stats: aggregator.stats(),
            updated_at: clock.now(),
        };
        Self {
            state: Arc::new(MonitorState {
                metric_key,
                clock,
                tracker: Mutex::new(tracker),
                aggregator: Mutex::new(aggregator),
                snapshot: Mutex::new(snapshot),
                subscribers: Mutex::new(Vec::new()),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn metric_key(&self) -> &str {
        &self.state.metric_key
    }

    /// Start the counts-refresh, stats-refresh and flush workers. A running
    /// monitor is left as is.
    pub fn start(&self, intervals: MonitorIntervals) -> std::io::Result<()> {
        let mut workers = lock(&self.workers);
        if !workers.is_empty() {
            return Ok(());
        }
        let key = &self.state.metric_key;

        let state = Arc::clone(&self.state);
        workers.push(Ticker::spawn(
            format!("geomon-counts-{key}"),
            intervals.counts_refresh,
            move || {
                state.refresh_counts();
            },
        )?);
        let state = Arc::clone(&self.state);
        workers.push(Ticker::spawn(
            format!("geomon-stats-{key}"),
            intervals.stats_refresh,
            move || {
                state.refresh_stats();
            },
        )?);
        let state = Arc::clone(&self.state);
        workers.push(Ticker::spawn(
            format!("geomon-flush-{key}"),
            intervals.stats_flush,
            move || {
                state.flush();
            },
        )?);
        Ok(())
    }

    /// Cancel and join all workers.
    pub fn stop(&self) {
        let workers: Vec<Ticker> = lock(&self.workers).drain(..).collect();
        drop(workers);
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !lock(&self.workers).is_empty()
    }

    /// Feed one sample to the tracker and the aggregator.
    pub fn ingest(&self, value: f64, timestamp: DateTime<Utc>) -> Observation {
        let observation = lock(&self.state.tracker).observe(value, timestamp);
        let persisted = lock(&self.state.aggregator).offer(value, timestamp);

        let previous = lock(&self.state.snapshot).status;
        if observation.edge {
            let counts = lock(&self.state.tracker).counts();
            self.state.update_snapshot(|s| {
                s.status = observation.status;
                s.counts = counts;
            });
        } else if previous != observation.status {
            tracing::info!(
                metric = %self.state.metric_key,
                from = previous.label(),
                to = observation.status.label(),
                "status changed"
            );
            self.state.update_snapshot(|s| s.status = observation.status);
        }
        if persisted {
            self.state.refresh_stats();
        }
        observation
    }

    pub fn refresh_counts(&self) -> AnomalyCounts {
        self.state.refresh_counts()
    }

    pub fn refresh_stats(&self) -> WindowStats {
        self.state.refresh_stats()
    }

    /// Persist the latest value if it changed since the last write.
    pub fn flush(&self) -> bool {
        self.state.flush()
    }

    #[must_use]
    pub fn snapshot(&self) -> MonitorSnapshot {
        lock(&self.state.snapshot).clone()
    }

    /// Receive every snapshot published from now on. Dropping the receiver
    /// unsubscribes.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<MonitorSnapshot> {
        let (tx, rx) = channel();
        lock(&self.state.subscribers).push(tx);
        rx
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        lock(&self.state.subscribers).len()
    }

    pub fn set_thresholds(&self, thresholds: Option<Threshold>) {
        lock(&self.state.tracker).set_thresholds(thresholds);
    }

    /// Delete both histories and publish the emptied snapshot.
    pub fn reset(&self) -> geomon_storage::Result<()> {
        lock(&self.state.tracker).reset()?;
        lock(&self.state.aggregator).reset()?;
        let counts = lock(&self.state.tracker).counts();
        let stats = lock(&self.state.aggregator).stats();
        self.state.update_snapshot(|s| {
            s.status = Status::Normal;
            s.counts = counts;
            s.stats = stats;
        });
        Ok(())
    }
}

impl Drop for MetricMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Registry of monitors: the same key always yields the same monitor.
pub struct MonitorHub {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    catalog: ThresholdCatalog,
    options: EngineOptions,
    intervals: Option<MonitorIntervals>,
    monitors: Mutex<HashMap<String, Arc<MetricMonitor>>>,
}

impl std::fmt::Debug for MonitorHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorHub")
            .field("metrics", &self.keys())
            .field("intervals", &self.intervals)
            .finish_non_exhaustive()
    }
}

impl MonitorHub {
    /// Hub whose monitors run no background workers; drive them with
    /// [`MetricMonitor::refresh_counts`], [`MetricMonitor::refresh_stats`]
    /// and [`MetricMonitor::flush`].
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        catalog: ThresholdCatalog,
        options: EngineOptions,
    ) -> Self {
        Self {
            store,
            clock,
            catalog,
            options,
            intervals: None,
            monitors: Mutex::new(HashMap::new()),
        }
    }

    /// Start workers with these periods on every monitor handed out.
    #[must_use]
    pub const fn with_workers(mut self, intervals: MonitorIntervals) -> Self {
        self.intervals = Some(intervals);
        self
    }

    /// Hub configured from `config`, with workers enabled.
    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
    ) -> geomon_core::Result<Self> {
        let catalog = config.threshold_catalog()?;
        Ok(Self::new(store, clock, catalog, EngineOptions::from_config(config))
            .with_workers(MonitorIntervals::from_config(config)))
    }

    #[must_use]
    pub const fn catalog(&self) -> &ThresholdCatalog {
        &self.catalog
    }

    /// Catalog name for `metric_key` (resolving aliases), or the key itself.
    #[must_use]
    pub fn canonical_key(&self, metric_key: &str) -> String {
        self.catalog
            .resolve_key(metric_key)
            .unwrap_or(metric_key)
            .to_string()
    }

    /// The monitor for `metric_key`, created (and started) on first use.
    pub fn monitor(&self, metric_key: &str) -> std::io::Result<Arc<MetricMonitor>> {
        let key = self.canonical_key(metric_key);
        let mut monitors = lock(&self.monitors);
        if let Some(existing) = monitors.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let monitor = Arc::new(MetricMonitor::new(
            key.clone(),
            self.catalog.get(&key).cloned(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            self.options,
        ));
        if let Some(intervals) = self.intervals {
            monitor.start(intervals)?;
        }
        tracing::debug!(metric = %key, "monitor created");
        monitors.insert(key, Arc::clone(&monitor));
        Ok(monitor)
    }

    #[must_use]
    pub fn get(&self, metric_key: &str) -> Option<Arc<MetricMonitor>> {
        lock(&self.monitors)
            .get(&self.canonical_key(metric_key))
            .cloned()
    }

    /// Route a sample to its metric's monitor.
    pub fn ingest(&self, sample: &MetricSample) -> std::io::Result<Observation> {
        Ok(self
            .monitor(&sample.metric_key)?
            .ingest(sample.value, sample.timestamp))
    }

    /// Registered metric keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.monitors).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Snapshots of every registered monitor, sorted by key.
    #[must_use]
    pub fn snapshots(&self) -> Vec<MonitorSnapshot> {
        let mut snaps: Vec<MonitorSnapshot> =
            lock(&self.monitors).values().map(|m| m.snapshot()).collect();
        snaps.sort_by(|a, b| a.metric_key.cmp(&b.metric_key));
        snaps
    }

    /// Unregister a monitor and stop its workers.
    pub fn remove(&self, metric_key: &str) -> Option<Arc<MetricMonitor>> {
        let removed = lock(&self.monitors).remove(&self.canonical_key(metric_key));
        if let Some(monitor) = &removed {
            monitor.stop();
        }
        removed
    }

    /// Flush pending values and stop every worker.
    pub fn shutdown(&self) {
        let monitors: Vec<Arc<MetricMonitor>> =
            lock(&self.monitors).drain().map(|(_, m)| m).collect();
        for monitor in monitors {
            monitor.stop();
            monitor.flush();
        }
    }
}
