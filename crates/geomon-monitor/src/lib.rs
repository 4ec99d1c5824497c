//! Stateful monitoring engine for geomon
//!
//! - [`AnomalyTracker`]: edge-triggered anomaly event log with windowed counts
//! - [`SampleAggregator`]: debounced sample history and window statistics
//! - [`Ticker`]: cancellable periodic worker thread
//! - [`MetricMonitor`] / [`MonitorHub`]: one owner per metric key, with
//!   subscribers notified of fresh snapshots
//!
//! Store failures never reach callers of the sample path. They are logged,
//! counted in [`geomon_core::global_metrics`], and degrade to an empty
//! history.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod anomaly;
mod history;
pub mod service;
pub mod ticker;

pub use aggregator::SampleAggregator;
pub use anomaly::{AnomalyTracker, Observation};
pub use service::{MetricMonitor, MonitorHub, MonitorSnapshot};
pub use ticker::Ticker;

use geomon_core::Config;
use std::time::Duration;

/// Retention and store-concurrency settings shared by trackers and aggregators.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineOptions {
    pub retention: chrono::Duration,
    pub history_cap: usize,
    pub cas_max_retries: u32,
    pub stats_change_ratio: Option<f64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl EngineOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            retention: config.retention(),
            history_cap: config.history_cap,
            cas_max_retries: config.cas_max_retries,
            stats_change_ratio: config.stats_change_ratio,
        }
    }
}

/// Periods of the three per-metric workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorIntervals {
    pub counts_refresh: Duration,
    pub stats_refresh: Duration,
    pub stats_flush: Duration,
}

impl Default for MonitorIntervals {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl MonitorIntervals {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            counts_refresh: config.counts_refresh_interval,
            stats_refresh: config.stats_refresh_interval,
            stats_flush: config.effective_flush_interval(),
        }
    }
}
