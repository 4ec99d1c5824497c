//! Data models for the monitoring engine.
//!
//! Samples, anomaly events, and stored history records are immutable values;
//! window statistics are derived on demand and never persisted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Maximum age of any stored anomaly event or sample record.
pub const RETENTION_DAYS: i64 = 7;

/// Hard cap on the number of persisted samples per metric.
pub const HISTORY_CAP: usize = 10_000;

/// Round to 3 decimal places, the precision used for stored and reported values.
#[must_use]
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Classification of one sample against its thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    Normal,
    Warning,
    Abnormal,
}

impl Status {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Warning => "warning",
            Self::Abnormal => "abnormal",
        }
    }

    /// The anomaly level for a non-normal status.
    #[must_use]
    pub const fn anomaly_level(self) -> Option<AnomalyLevel> {
        match self {
            Self::Normal => None,
            Self::Warning => Some(AnomalyLevel::Warning),
            Self::Abnormal => Some(AnomalyLevel::Abnormal),
        }
    }

    #[must_use]
    pub const fn is_normal(self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// The subset of [`Status`] that can appear on a logged anomaly event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyLevel {
    Warning,
    Abnormal,
}

impl AnomalyLevel {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Abnormal => "abnormal",
        }
    }
}

impl From<AnomalyLevel> for Status {
    fn from(level: AnomalyLevel) -> Self {
        match level {
            AnomalyLevel::Warning => Self::Warning,
            AnomalyLevel::Abnormal => Self::Abnormal,
        }
    }
}

// ---------------------------------------------------------------------------
// Samples and history records
// ---------------------------------------------------------------------------

/// One sensor reading produced by the sample source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricSample {
    pub metric_key: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    #[must_use]
    pub fn new(metric_key: impl Into<String>, value: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            metric_key: metric_key.into(),
            value,
            timestamp,
        }
    }
}

/// A logged normal-to-anomalous transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyEvent {
    #[serde(default)]
    pub metric_key: String,
    pub status: AnomalyLevel,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// One entry of a metric's persisted sample history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

/// Anything stored in a time-ordered history list.
pub trait Timestamped {
    fn timestamp(&self) -> DateTime<Utc>;
}

impl Timestamped for AnomalyEvent {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Timestamped for SampleRecord {
    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Default retention window.
#[must_use]
pub fn default_retention() -> Duration {
    Duration::days(RETENTION_DAYS)
}

/// Drop every entry at or before `now - retention`.
///
/// Idempotent: pruning an already-pruned history with the same `now` is a no-op.
pub fn prune_expired<T: Timestamped>(history: &mut Vec<T>, now: DateTime<Utc>, retention: Duration) {
    let cutoff = now - retention;
    history.retain(|entry| entry.timestamp() > cutoff);
}

// ---------------------------------------------------------------------------
// Query results
// ---------------------------------------------------------------------------

/// Sliding windows reported by the anomaly counter and the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Last12h,
    Last24h,
    Last7d,
}

impl Window {
    pub const ALL: [Self; 3] = [Self::Last12h, Self::Last24h, Self::Last7d];

    #[must_use]
    pub fn duration(self) -> Duration {
        match self {
            Self::Last12h => Duration::hours(12),
            Self::Last24h => Duration::hours(24),
            Self::Last7d => Duration::days(7),
        }
    }
}

/// Anomaly event counts per window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyCounts {
    pub last12h: usize,
    pub last24h: usize,
    pub last7d: usize,
}

/// `{min, max, avg, count}` over one window; all zero when the window is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: usize,
}

impl WindowSummary {
    /// Reduce an iterator of values, rounding results to 3 decimals.
    pub fn from_values<I: IntoIterator<Item = f64>>(values: I) -> Self {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v;
            count += 1;
        }
        if count == 0 {
            return Self::default();
        }
        #[allow(clippy::cast_precision_loss)]
        let avg = sum / count as f64;
        Self {
            min: round3(min),
            max: round3(max),
            avg: round3(avg),
            count,
        }
    }
}

/// Derived statistics for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowStats {
    pub current: f64,
    pub min12h: f64,
    pub max12h: f64,
    pub avg12h: f64,
    pub min24h: f64,
    pub max24h: f64,
    pub avg24h: f64,
    pub min7d: f64,
    pub max7d: f64,
    pub avg7d: f64,
}

impl WindowStats {
    #[must_use]
    pub const fn from_summaries(
        current: f64,
        w12h: WindowSummary,
        w24h: WindowSummary,
        w7d: WindowSummary,
    ) -> Self {
        Self {
            current,
            min12h: w12h.min,
            max12h: w12h.max,
            avg12h: w12h.avg,
            min24h: w24h.min,
            max24h: w24h.max,
            avg24h: w24h.avg,
            min7d: w7d.min,
            max7d: w7d.max,
            avg7d: w7d.avg,
        }
    }
}
