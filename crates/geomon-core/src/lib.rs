//! Core types, thresholds, and calibration for geomon
//!
//! This crate provides:
//! - Threshold classification and the metric limit catalog
//! - Sample, anomaly event, and window statistics models
//! - The 4–20 mA calibration transfer function
//! - Configuration, error types, clocks, and engine counters

#![forbid(unsafe_code)]

pub mod calibration;
pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod thresholds;

// Re-export key types for convenience
pub use calibration::{
    CalibrationChannel, ChannelIssue, OutputMode, ScalingType, SignalDriver, signal_percent,
    to_output_signal,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use metrics::{Counter, EngineMetrics, EngineMetricsSnapshot, global_metrics};
pub use models::{
    AnomalyCounts, AnomalyEvent, AnomalyLevel, HISTORY_CAP, MetricSample, RETENTION_DAYS,
    SampleRecord, Status, Timestamped, Window, WindowStats, WindowSummary, prune_expired, round3,
};
pub use thresholds::{Threshold, ThresholdCatalog, classify};
