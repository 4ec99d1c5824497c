//! Multi-level threshold configuration and sample classification.
//!
//! Every bound is optional. A missing bound never triggers; it is not treated
//! as zero.

#![forbid(unsafe_code)]

use crate::error::{Error, Result};
use crate::models::{Status, round3};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Threshold set for one metric.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threshold {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormal_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideal_low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ideal_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abnormal_high: Option<f64>,

    /// Display range lower bound; used as the ideal-band fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    /// Display range upper bound; used as the ideal-band fallback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl Threshold {
    /// Classify `value` against this threshold set.
    ///
    /// High-side bounds are checked before low-side bounds, so overlapping
    /// (misconfigured) thresholds resolve to the high-side status.
    #[must_use]
    pub fn classify(&self, value: f64) -> Status {
        if self.abnormal_high.is_some_and(|b| value >= b) {
            return Status::Abnormal;
        }
        if self.warning_high.is_some_and(|b| value >= b) {
            return Status::Warning;
        }
        if self.abnormal_low.is_some_and(|b| value <= b) {
            return Status::Abnormal;
        }
        if self.warning_low.is_some_and(|b| value <= b) {
            return Status::Warning;
        }
        Status::Normal
    }

    /// Whether `value` sits inside the ideal band.
    ///
    /// Falls back to `min`/`max` for a missing ideal bound; returns `false`
    /// when neither side is known. Informational only.
    #[must_use]
    pub fn is_ideal(&self, value: f64) -> bool {
        let low = self.ideal_low.or(self.min);
        let high = self.ideal_high.or(self.max);
        if low.is_none() && high.is_none() {
            return false;
        }
        low.is_none_or(|l| value >= l) && high.is_none_or(|h| value <= h)
    }
}

/// Classify a possibly-absent value against possibly-absent thresholds.
///
/// Never fails: an absent value or absent thresholds map to [`Status::Normal`],
/// and so does NaN (no comparison against NaN succeeds).
#[must_use]
pub fn classify(value: Option<f64>, thresholds: Option<&Threshold>) -> Status {
    match (value, thresholds) {
        (Some(v), Some(t)) => t.classify(v),
        _ => Status::Normal,
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// Alternate metric names accepted by [`ThresholdCatalog::get`].
const METRIC_ALIASES: &[(&str, &str)] = &[
    ("tds", "TDS: Overall"),
    ("flow_rate", "flow"),
    ("active_power", "gen_output"),
    ("gen_reactive_power", "reactive_power"),
    ("speed", "speed_detection"),
];

/// Read-only mapping from metric key to [`Threshold`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThresholdCatalog {
    entries: BTreeMap<String, Threshold>,
}

impl ThresholdCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Built-in plant defaults, used when no limit file is configured.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn builtin() -> Self {
        fn t(
            unit: &str,
            range: (f64, f64),
            low: (Option<f64>, Option<f64>),
            ideal: (Option<f64>, Option<f64>),
            high: (Option<f64>, Option<f64>),
        ) -> Threshold {
            Threshold {
                abnormal_low: low.0,
                warning_low: low.1,
                ideal_low: ideal.0,
                ideal_high: ideal.1,
                warning_high: high.0,
                abnormal_high: high.1,
                min: Some(range.0),
                max: Some(range.1),
                unit: Some(unit.to_string()),
            }
        }

        let mut catalog = Self::new();
        catalog.insert(
            "gen_output",
            t(
                "W",
                (0.0, 50_000.0),
                (Some(100.0), Some(500.0)),
                (Some(1000.0), Some(40_000.0)),
                (Some(45_000.0), Some(50_000.0)),
            ),
        );
        catalog.insert(
            "voltage",
            t(
                "V",
                (0.0, 500.0),
                (Some(180.0), Some(200.0)),
                (Some(380.0), Some(420.0)),
                (Some(440.0), Some(460.0)),
            ),
        );
        catalog.insert(
            "reactive_power",
            t(
                "VAR",
                (0.0, 20_000.0),
                (None, None),
                (None, Some(5000.0)),
                (Some(10_000.0), Some(15_000.0)),
            ),
        );
        catalog.insert(
            "speed_detection",
            t(
                "RPM",
                (0.0, 5000.0),
                (Some(500.0), Some(1000.0)),
                (Some(2500.0), Some(3500.0)),
                (Some(4000.0), Some(4500.0)),
            ),
        );
        catalog.insert(
            "current",
            t(
                "A",
                (0.0, 200.0),
                (None, None),
                (None, Some(50.0)),
                (Some(100.0), Some(150.0)),
            ),
        );
        catalog.insert(
            "pressure",
            t(
                "kPa",
                (222.0, 1778.0),
                (Some(222.0), Some(444.0)),
                (None, None),
                (Some(1556.0), Some(1778.0)),
            ),
        );
        catalog.insert(
            "temperature",
            t(
                "°C",
                (120.0, 200.0),
                (Some(120.0), Some(125.0)),
                (None, None),
                (Some(150.0), Some(190.0)),
            ),
        );
        catalog.insert(
            "flow",
            t(
                "t/h",
                (200.0, 288.0),
                (Some(200.0), Some(220.0)),
                (None, None),
                (Some(270.0), Some(285.0)),
            ),
        );
        catalog.insert(
            "TDS: Overall",
            t(
                "ppm",
                (0.0, 10.0),
                (Some(0.0), Some(2.0)),
                (None, None),
                (Some(8.0), Some(9.5)),
            ),
        );
        catalog.insert(
            "dryness",
            t(
                "%",
                (80.0, 100.1),
                (Some(80.0), Some(90.0)),
                (None, None),
                (Some(99.5), Some(100.0)),
            ),
        );
        catalog
    }

    /// Load a limit file: a JSON object keyed by metric.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let entries: BTreeMap<String, Threshold> = serde_json::from_str(contents)?;
        Ok(Self { entries })
    }

    pub fn insert(&mut self, key: impl Into<String>, threshold: Threshold) {
        self.entries.insert(key.into(), threshold);
    }

    /// Resolve `key` (or its alias) to a stored key.
    #[must_use]
    pub fn resolve_key<'a>(&'a self, key: &'a str) -> Option<&'a str> {
        if let Some((stored, _)) = self.entries.get_key_value(key) {
            return Some(stored.as_str());
        }
        METRIC_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .and_then(|(_, target)| self.entries.get_key_value(*target))
            .map(|(stored, _)| stored.as_str())
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Threshold> {
        self.resolve_key(key).and_then(|k| self.entries.get(k))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Derive abnormal bounds and the ideal band from chart reference lines.
    ///
    /// `min` becomes `abnormalLow`, `max` becomes `abnormalHigh`, and the ideal
    /// band is `avg ± 0.5` (`± 0.2` for dryness). Warning bounds are kept.
    pub fn apply_reference(&mut self, key: &str, min: f64, max: f64, avg: f64) -> Result<()> {
        if !(min.is_finite() && max.is_finite() && avg.is_finite()) {
            return Err(Error::InvalidArgument(format!(
                "reference lines for {key} must be finite"
            )));
        }
        let stored = self
            .resolve_key(key)
            .map(str::to_string)
            .ok_or_else(|| Error::UnknownMetric(key.to_string()))?;
        let band = if stored == "dryness" { 0.2 } else { 0.5 };
        if let Some(threshold) = self.entries.get_mut(&stored) {
            threshold.abnormal_low = Some(round3(min));
            threshold.abnormal_high = Some(round3(max));
            threshold.ideal_low = Some(round3(avg - band));
            threshold.ideal_high = Some(round3(avg + band));
            tracing::info!(
                metric = %stored,
                abnormal_low = min,
                abnormal_high = max,
                ideal_low = avg - band,
                ideal_high = avg + band,
                "thresholds updated from reference lines"
            );
        }
        Ok(())
    }
}
