//! Sliding-window statistics over a persisted sample history.
//!
//! Writes are decoupled from the sample cadence: [`SampleAggregator::offer`]
//! persists the first value at once and afterwards only remembers the latest
//! one, which [`SampleAggregator::flush`] writes on its own timer. Short
//! spikes between flushes never reach the history.

use crate::EngineOptions;
use crate::history::PersistedHistory;
use chrono::{DateTime, Utc};
use geomon_core::{
    Clock, SampleRecord, Window, WindowStats, WindowSummary, global_metrics, prune_expired,
    round3,
};
use geomon_storage::{Store, metric_stats_key};
use std::sync::Arc;

#[derive(Debug)]
pub struct SampleAggregator {
    metric_key: String,
    history: PersistedHistory,
    clock: Arc<dyn Clock>,
    options: EngineOptions,
    latest: Option<f64>,
    last_persisted: Option<f64>,
}

impl SampleAggregator {
    #[must_use]
    pub fn new(
        metric_key: impl Into<String>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let metric_key = metric_key.into();
        let history =
            PersistedHistory::new(metric_stats_key(&metric_key), store, options.cas_max_retries);
        Self {
            metric_key,
            history,
            clock,
            options,
            latest: None,
            last_persisted: None,
        }
    }

    #[must_use]
    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }

    /// Most recent finite value offered.
    #[must_use]
    pub const fn latest(&self) -> Option<f64> {
        self.latest
    }

    /// Append one sample to the persisted history. Non-finite values are
    /// dropped. Returns whether the history was written.
    pub fn record(&mut self, value: f64, timestamp: DateTime<Utc>) -> bool {
        let written = self.record_batch([(value, timestamp)]) > 0;
        if written {
            self.last_persisted = Some(value);
        }
        written
    }

    /// Append many samples in a single write (backfill). Returns the number
    /// of samples written.
    pub fn record_batch<I>(&mut self, samples: I) -> usize
    where
        I: IntoIterator<Item = (f64, DateTime<Utc>)>,
    {
        let mut accepted = Vec::new();
        for (value, timestamp) in samples {
            if value.is_finite() {
                accepted.push(SampleRecord {
                    value: round3(value),
                    timestamp,
                });
            } else {
                global_metrics().samples_rejected.inc();
                tracing::debug!(metric = %self.metric_key, value, "non-finite sample dropped");
            }
        }
        if accepted.is_empty() {
            return 0;
        }
        let count = accepted.len();
        global_metrics()
            .samples_recorded
            .add(u64::try_from(count).unwrap_or(u64::MAX));

        let now = self.clock.now();
        let EngineOptions {
            retention,
            history_cap,
            ..
        } = self.options;
        let result = self.history.update(|history: &mut Vec<SampleRecord>| {
            history.extend_from_slice(&accepted);
            prune_expired(history, now, retention);
            if history.len() > history_cap {
                let excess = history.len() - history_cap;
                history.drain(..excess);
            }
        });
        if result.is_ok() { count } else { 0 }
    }

    /// Feed the live value. Persists immediately on the first value, or when
    /// the change ratio is configured and exceeded; otherwise the value waits
    /// for the next [`flush`](Self::flush).
    pub fn offer(&mut self, value: f64, timestamp: DateTime<Utc>) -> bool {
        if !value.is_finite() {
            global_metrics().samples_rejected.inc();
            return false;
        }
        self.latest = Some(value);
        let save_now = match (self.last_persisted, self.options.stats_change_ratio) {
            (None, _) => true,
            (Some(last), Some(ratio)) => (value - last).abs() > (last * ratio).abs(),
            (Some(_), None) => false,
        };
        save_now && self.record(value, timestamp)
    }

    /// Persist the latest value if it differs from the last persisted one.
    pub fn flush(&mut self) -> bool {
        let Some(value) = self.latest else {
            return false;
        };
        #[allow(clippy::float_cmp)]
        let unchanged = self.last_persisted == Some(value);
        if unchanged {
            return false;
        }
        global_metrics().stats_flushes.inc();
        let now = self.clock.now();
        self.record(value, now)
    }

    /// Persisted samples; empty when absent or unreadable.
    #[must_use]
    pub fn history(&self) -> Vec<SampleRecord> {
        self.history.load()
    }

    /// Summary over samples strictly newer than `now - window`.
    #[must_use]
    pub fn summary(&self, window: Window) -> WindowSummary {
        summarize(&self.history(), self.clock.now(), window)
    }

    /// Window statistics; every field is 0 when its window is empty.
    #[must_use]
    pub fn stats(&self) -> WindowStats {
        let history = self.history();
        let now = self.clock.now();
        let [w12h, w24h, w7d] = Window::ALL.map(|window| summarize(&history, now, window));
        WindowStats::from_summaries(self.latest.map_or(0.0, round3), w12h, w24h, w7d)
    }

    /// Delete the persisted history and forget the live value.
    pub fn reset(&mut self) -> geomon_storage::Result<()> {
        self.history.clear()?;
        self.latest = None;
        self.last_persisted = None;
        tracing::info!(metric = %self.metric_key, "sample history reset");
        Ok(())
    }
}

fn summarize(history: &[SampleRecord], now: DateTime<Utc>, window: Window) -> WindowSummary {
    let cutoff = now - window.duration();
    WindowSummary::from_values(
        history
            .iter()
            .filter(|r| r.timestamp > cutoff)
            .map(|r| r.value),
    )
}
