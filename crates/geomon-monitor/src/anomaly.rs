//! Edge-triggered anomaly tracking for one metric.
//!
//! An [`AnomalyEvent`] is logged only when the classified status leaves
//! `normal`; the metric staying anomalous tick after tick logs nothing more.
//! The persisted history is pruned to the retention window on every append.

use crate::EngineOptions;
use crate::history::PersistedHistory;
use chrono::{DateTime, Utc};
use geomon_core::{
    AnomalyCounts, AnomalyEvent, Clock, Status, Threshold, Window, classify, global_metrics,
    prune_expired,
};
use geomon_storage::{Store, anomaly_history_key};
use std::sync::Arc;

/// Outcome of one [`AnomalyTracker::observe`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub status: Status,
    /// A normal-to-anomalous edge was detected on this sample.
    pub edge: bool,
    /// The edge (and any earlier unsaved ones) reached the store.
    pub persisted: bool,
}

#[derive(Debug)]
pub struct AnomalyTracker {
    metric_key: String,
    thresholds: Option<Threshold>,
    history: PersistedHistory,
    clock: Arc<dyn Clock>,
    retention: chrono::Duration,
    last_status: Status,
    /// Events detected while the store was failing. Counted and retried on
    /// the next append.
    unsaved: Vec<AnomalyEvent>,
}

impl AnomalyTracker {
    #[must_use]
    pub fn new(
        metric_key: impl Into<String>,
        thresholds: Option<Threshold>,
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        options: EngineOptions,
    ) -> Self {
        let metric_key = metric_key.into();
        let history = PersistedHistory::new(
            anomaly_history_key(&metric_key),
            store,
            options.cas_max_retries,
        );
        Self {
            metric_key,
            thresholds,
            history,
            clock,
            retention: options.retention,
            last_status: Status::Normal,
            unsaved: Vec::new(),
        }
    }

    #[must_use]
    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }

    /// Status assigned to the most recent sample (`normal` before any).
    #[must_use]
    pub const fn current_status(&self) -> Status {
        self.last_status
    }

    /// Replace the thresholds. Edge state is kept.
    pub fn set_thresholds(&mut self, thresholds: Option<Threshold>) {
        self.thresholds = thresholds;
    }

    /// Number of detected events not yet persisted.
    #[must_use]
    pub fn unsaved_len(&self) -> usize {
        self.unsaved.len()
    }

    /// Classify one sample and log an event on a normal-to-anomalous edge.
    ///
    /// Samples must be fed in production order. Never fails: store errors are
    /// logged and the event is kept in memory.
    pub fn observe(&mut self, value: f64, timestamp: DateTime<Utc>) -> Observation {
        global_metrics().samples_observed.inc();
        let status = classify(Some(value), self.thresholds.as_ref());
        let previous = self.last_status;
        self.last_status = status;

        let Some(level) = status.anomaly_level() else {
            return Observation {
                status,
                edge: false,
                persisted: false,
            };
        };
        if !previous.is_normal() {
            return Observation {
                status,
                edge: false,
                persisted: false,
            };
        }

        tracing::info!(
            metric = %self.metric_key,
            status = level.label(),
            value,
            "anomaly detected"
        );
        self.unsaved.push(AnomalyEvent {
            metric_key: self.metric_key.clone(),
            status: level,
            value,
            timestamp,
        });
        let persisted = self.persist_unsaved();
        Observation {
            status,
            edge: true,
            persisted,
        }
    }

    fn persist_unsaved(&mut self) -> bool {
        let now = self.clock.now();
        let retention = self.retention;
        let pending = &self.unsaved;
        let surviving = retained_count(pending, now, retention);
        let result = self.history.update(|history: &mut Vec<AnomalyEvent>| {
            history.extend(pending.iter().cloned());
            prune_expired(history, now, retention);
        });
        match result {
            Ok(_) => {
                if surviving < self.unsaved.len() {
                    tracing::debug!(
                        metric = %self.metric_key,
                        expired = self.unsaved.len() - surviving,
                        "events older than retention were not stored"
                    );
                }
                let logged = u64::try_from(surviving).unwrap_or(u64::MAX);
                global_metrics().anomaly_events_logged.add(logged);
                self.unsaved.clear();
                true
            }
            Err(failure) => {
                tracing::warn!(
                    key = %self.history.key(),
                    ?failure,
                    unsaved = self.unsaved.len(),
                    "anomaly event kept in memory"
                );
                false
            }
        }
    }

    /// Persisted history merged with unsaved events.
    #[must_use]
    pub fn events(&self) -> Vec<AnomalyEvent> {
        let mut events: Vec<AnomalyEvent> = self.history.load();
        events.extend(self.unsaved.iter().cloned());
        events
    }

    /// Events within `[now - window, now]` for each window.
    #[must_use]
    pub fn counts(&self) -> AnomalyCounts {
        let now = self.clock.now();
        let events = self.events();
        let [last12h, last24h, last7d] = Window::ALL.map(|window| {
            let cutoff = now - window.duration();
            events
                .iter()
                .filter(|e| e.timestamp >= cutoff && e.timestamp <= now)
                .count()
        });
        AnomalyCounts {
            last12h,
            last24h,
            last7d,
        }
    }

    /// Delete the persisted history and return to the initial state.
    pub fn reset(&mut self) -> geomon_storage::Result<()> {
        self.history.clear()?;
        self.unsaved.clear();
        self.last_status = Status::Normal;
        tracing::info!(metric = %self.metric_key, "anomaly history reset");
        Ok(())
    }
}

/// How many of `events` survive [`prune_expired`] at `now`.
fn retained_count(
    events: &[AnomalyEvent],
    now: DateTime<Utc>,
    retention: chrono::Duration,
) -> usize {
    let cutoff = now - retention;
    events.iter().filter(|e| e.timestamp > cutoff).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use geomon_core::{AnomalyLevel, ManualClock};
    use geomon_storage::MemoryStore;

    fn thresholds() -> Threshold {
        Threshold {
            abnormal_low: Some(10.0),
            warning_low: Some(20.0),
            warning_high: Some(80.0),
            abnormal_high: Some(90.0),
            ..Threshold::default()
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    fn tracker() -> (Arc<MemoryStore>, Arc<ManualClock>, AnomalyTracker) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let tracker = AnomalyTracker::new(
            "pressure",
            Some(thresholds()),
            store.clone(),
            clock.clone(),
            EngineOptions::default(),
        );
        (store, clock, tracker)
    }

    #[test]
    fn logs_one_event_per_edge() {
        let (_store, clock, mut tracker) = tracker();
        // normal, warning, warning, warning, normal, abnormal
        let values = [50.0, 85.0, 86.0, 84.0, 50.0, 95.0];
        let mut edges = 0;
        for v in values {
            clock.advance(Duration::seconds(5));
            if tracker.observe(v, clock.now()).edge {
                edges += 1;
            }
        }
        assert_eq!(edges, 2);
        let events = tracker.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, AnomalyLevel::Warning);
        assert_eq!(events[1].status, AnomalyLevel::Abnormal);
        assert_eq!(events[1].metric_key, "pressure");
        assert_eq!(tracker.current_status(), Status::Abnormal);
    }

    #[test]
    fn escalation_without_returning_to_normal_is_not_an_edge() {
        let (_store, clock, mut tracker) = tracker();
        for v in [85.0, 95.0, 85.0] {
            tracker.observe(v, clock.now());
        }
        assert_eq!(tracker.events().len(), 1);
    }

    #[test]
    fn missing_thresholds_never_log() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(start()));
        let mut tracker =
            AnomalyTracker::new("ncg", None, store, clock.clone(), EngineOptions::default());
        for v in [0.0, 1e9, -1e9, f64::NAN] {
            assert_eq!(tracker.observe(v, clock.now()).status, Status::Normal);
        }
        assert!(tracker.events().is_empty());
    }

    #[test]
    fn counts_follow_the_clock() {
        let (_store, clock, mut tracker) = tracker();
        tracker.observe(95.0, clock.now());
        tracker.observe(50.0, clock.now());
        clock.advance(Duration::hours(13));
        tracker.observe(5.0, clock.now());

        assert_eq!(
            tracker.counts(),
            AnomalyCounts {
                last12h: 1,
                last24h: 2,
                last7d: 2
            }
        );

        // No new samples; ages still move. The second event is now just
        // past the 12h boundary.
        clock.advance(Duration::hours(12) + Duration::seconds(1));
        assert_eq!(
            tracker.counts(),
            AnomalyCounts {
                last12h: 0,
                last24h: 1,
                last7d: 2
            }
        );
    }

    #[test]
    fn window_boundaries_are_inclusive_and_future_events_excluded() {
        let (_store, clock, mut tracker) = tracker();
        tracker.observe(95.0, start());
        tracker.observe(50.0, start());
        tracker.observe(95.0, start() + Duration::hours(1));
        clock.set(start() + Duration::hours(12));
        tracker.observe(50.0, clock.now());
        tracker.observe(95.0, clock.now() + Duration::minutes(1));

        let counts = tracker.counts();
        assert_eq!(counts.last12h, 2);
        assert_eq!(counts.last7d, 2);
    }

    #[test]
    fn append_prunes_events_past_retention() {
        let (_store, clock, mut tracker) = tracker();
        tracker.observe(95.0, clock.now());
        tracker.observe(50.0, clock.now());
        clock.advance(Duration::days(8));
        tracker.observe(95.0, clock.now());
        let events = tracker.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].timestamp, clock.now());
    }

    #[test]
    fn reset_clears_history_and_edge_state() {
        let (store, clock, mut tracker) = tracker();
        tracker.observe(95.0, clock.now());
        tracker.reset().unwrap();
        assert!(tracker.events().is_empty());
        assert_eq!(tracker.current_status(), Status::Normal);
        assert_eq!(store.get(&anomaly_history_key("pressure")).unwrap(), None);

        // Still anomalous after reset: logged again as a fresh edge.
        assert!(tracker.observe(95.0, clock.now()).edge);
    }

    #[test]
    fn trackers_for_one_key_share_history() {
        let (store, clock, mut a) = tracker();
        let mut b = AnomalyTracker::new(
            "pressure",
            Some(thresholds()),
            store,
            clock.clone(),
            EngineOptions::default(),
        );
        a.observe(95.0, clock.now());
        b.observe(5.0, clock.now());
        assert_eq!(a.counts().last12h, 2);
        assert_eq!(b.counts().last12h, 2);
    }

    #[test]
    fn expired_edge_is_stored_nowhere_and_not_counted() {
        let (_store, clock, mut tracker) = tracker();
        let now = clock.now();
        let stale = AnomalyEvent {
            metric_key: "pressure".into(),
            status: AnomalyLevel::Abnormal,
            value: 95.0,
            timestamp: now - Duration::days(8),
        };
        let fresh = AnomalyEvent {
            timestamp: now,
            ..stale.clone()
        };
        let retention = EngineOptions::default().retention;
        assert_eq!(retained_count(&[stale.clone(), fresh], now, retention), 1);
        assert_eq!(retained_count(&[stale], now, retention), 0);

        let obs = tracker.observe(95.0, now - Duration::days(8));
        assert!(obs.edge);
        assert!(obs.persisted);
        assert_eq!(tracker.unsaved_len(), 0);
        assert!(tracker.events().is_empty());
    }

    #[test]
    fn tracker_debug_names_the_metric() {
        let (_store, _clock, tracker) = tracker();
        let rendered = format!("{tracker:?}");
        assert!(rendered.starts_with("AnomalyTracker"));
        assert!(rendered.contains("pressure"));
        assert!(rendered.contains("ManualClock"));
    }
}
