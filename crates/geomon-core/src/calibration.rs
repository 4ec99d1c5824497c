//! Analog output calibration: process value to a bounded 4–20 mA signal.
//!
//! [`to_output_signal`] is a pure transfer function that never fails: every
//! input is clamped rather than rejected. Priority order is failsafe (disabled
//! channel), then manual override, then the computed linear mapping.

#![forbid(unsafe_code)]

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lower end of the live-zero current loop.
pub const LOOP_MIN_MA: f64 = 4.0;
/// Upper end of the current loop.
pub const LOOP_MAX_MA: f64 = 20.0;

/// Normalisation curve requested by the channel configuration.
///
/// Only `Linear` has defined semantics; the other variants are accepted so
/// stored configurations round-trip, are reported by
/// [`CalibrationChannel::validate`], and are computed as linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingType {
    #[default]
    Linear,
    Square,
    Logarithmic,
}

impl ScalingType {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Linear => "linear",
            Self::Square => "square",
            Self::Logarithmic => "logarithmic",
        }
    }
}

/// Configuration of one physical analog output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
#[allow(clippy::struct_excessive_bools)]
pub struct CalibrationChannel {
    pub enabled: bool,
    pub input_min: f64,
    pub input_max: f64,
    pub output_min: f64,
    pub output_max: f64,
    pub zero_offset: f64,
    pub span_multiplier: f64,
    pub scaling_type: ScalingType,
    pub deadband: f64,
    #[serde(alias = "updateRate")]
    pub update_rate_ms: u64,
    pub override_enabled: bool,
    pub manual_value: f64,
    pub failsafe_value: f64,
    pub output_clamp_min: f64,
    pub output_clamp_max: f64,
}

impl Default for CalibrationChannel {
    fn default() -> Self {
        Self {
            enabled: true,
            input_min: 0.0,
            input_max: 100.0,
            output_min: LOOP_MIN_MA,
            output_max: LOOP_MAX_MA,
            zero_offset: 0.0,
            span_multiplier: 1.0,
            scaling_type: ScalingType::Linear,
            deadband: 0.0,
            update_rate_ms: 1000,
            override_enabled: false,
            manual_value: 12.0,
            failsafe_value: LOOP_MIN_MA,
            output_clamp_min: LOOP_MIN_MA,
            output_clamp_max: LOOP_MAX_MA,
        }
    }
}

/// Non-fatal configuration findings.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelIssue {
    /// `square`/`logarithmic` have no defined curve; the linear path is used.
    UnsupportedScaling(ScalingType),
    /// `input_min == input_max`; the normalized value is pinned to 0.
    DegenerateInputRange,
    InvertedOutputClamp { min: f64, max: f64 },
    FailsafeOutsideClamp { failsafe: f64 },
    NegativeDeadband(f64),
    NonFinite(&'static str),
}

impl std::fmt::Display for ChannelIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedScaling(s) => write!(
                f,
                "scaling type '{}' has no defined curve; computing as linear",
                s.label()
            ),
            Self::DegenerateInputRange => {
                write!(f, "input range is empty; normalized value pinned to 0")
            }
            Self::InvertedOutputClamp { min, max } => {
                write!(f, "output clamp is inverted (min {min} > max {max})")
            }
            Self::FailsafeOutsideClamp { failsafe } => {
                write!(f, "failsafe value {failsafe} lies outside the output clamp")
            }
            Self::NegativeDeadband(d) => write!(f, "deadband {d} is negative"),
            Self::NonFinite(field) => write!(f, "{field} is not a finite number"),
        }
    }
}

impl CalibrationChannel {
    /// Report configuration problems without rejecting the channel.
    #[must_use]
    #[allow(clippy::float_cmp)]
    pub fn validate(&self) -> Vec<ChannelIssue> {
        let mut issues = Vec::new();
        let fields = [
            ("inputMin", self.input_min),
            ("inputMax", self.input_max),
            ("outputMin", self.output_min),
            ("outputMax", self.output_max),
            ("zeroOffset", self.zero_offset),
            ("spanMultiplier", self.span_multiplier),
            ("deadband", self.deadband),
            ("manualValue", self.manual_value),
            ("failsafeValue", self.failsafe_value),
            ("outputClampMin", self.output_clamp_min),
            ("outputClampMax", self.output_clamp_max),
        ];
        for (name, v) in fields {
            if !v.is_finite() {
                issues.push(ChannelIssue::NonFinite(name));
            }
        }
        if self.scaling_type != ScalingType::Linear {
            issues.push(ChannelIssue::UnsupportedScaling(self.scaling_type));
        }
        if self.input_min == self.input_max {
            issues.push(ChannelIssue::DegenerateInputRange);
        }
        if self.output_clamp_min > self.output_clamp_max {
            issues.push(ChannelIssue::InvertedOutputClamp {
                min: self.output_clamp_min,
                max: self.output_clamp_max,
            });
        } else if self.failsafe_value < self.output_clamp_min
            || self.failsafe_value > self.output_clamp_max
        {
            issues.push(ChannelIssue::FailsafeOutsideClamp {
                failsafe: self.failsafe_value,
            });
        }
        if self.deadband < 0.0 {
            issues.push(ChannelIssue::NegativeDeadband(self.deadband));
        }
        issues
    }
}

/// Clamp that tolerates inverted bounds and maps NaN to the lower bound.
fn clamp_lenient(value: f64, a: f64, b: f64) -> f64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    if value.is_nan() {
        return lo;
    }
    value.max(lo).min(hi)
}

/// Which branch of the transfer function produced an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Failsafe,
    Manual,
    Computed,
}

impl OutputMode {
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Failsafe => "failsafe",
            Self::Manual => "manual",
            Self::Computed => "computed",
        }
    }
}

/// Compute the output signal and the branch that produced it.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn evaluate(process_value: f64, channel: &CalibrationChannel) -> (f64, OutputMode) {
    if !channel.enabled {
        return (channel.failsafe_value, OutputMode::Failsafe);
    }
    if channel.override_enabled {
        return (channel.manual_value, OutputMode::Manual);
    }

    let clamped = clamp_lenient(process_value, channel.input_min, channel.input_max);
    let range = channel.input_max - channel.input_min;
    let normalized = if range == 0.0 {
        0.0
    } else {
        (clamped - channel.input_min) / range
    };
    let adjusted = (normalized + channel.zero_offset) * channel.span_multiplier;
    let output = adjusted.mul_add(channel.output_max - channel.output_min, channel.output_min);
    let output = clamp_lenient(output, channel.output_clamp_min, channel.output_clamp_max);
    (output, OutputMode::Computed)
}

/// Convert a process value into the channel's output current (mA).
#[must_use]
pub fn to_output_signal(process_value: f64, channel: &CalibrationChannel) -> f64 {
    evaluate(process_value, channel).0
}

/// Position of `output_ma` within the 4–20 mA loop, in percent.
#[must_use]
pub fn signal_percent(output_ma: f64) -> f64 {
    (output_ma - LOOP_MIN_MA) / (LOOP_MAX_MA - LOOP_MIN_MA) * 100.0
}

// ---------------------------------------------------------------------------
// Deadband / update-rate driver
// ---------------------------------------------------------------------------

/// Stateful wrapper that decides when a new output should be sent to the
/// actuator.
///
/// A computed output is emitted only when at least `update_rate_ms` has
/// elapsed since the previous emission and it differs from the previous
/// emission by at least `deadband` mA. Branch changes (into or out of failsafe
/// or manual override) are always emitted immediately.
#[derive(Debug, Clone, Default)]
pub struct SignalDriver {
    last: Option<Emitted>,
}

#[derive(Debug, Clone, Copy)]
struct Emitted {
    value: f64,
    mode: OutputMode,
    at: DateTime<Utc>,
}

impl SignalDriver {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Last value handed to the actuator.
    #[must_use]
    pub fn last_output(&self) -> Option<f64> {
        self.last.map(|e| e.value)
    }

    /// Feed one process value; returns the output to transmit, if any.
    pub fn update(
        &mut self,
        process_value: f64,
        channel: &CalibrationChannel,
        now: DateTime<Utc>,
    ) -> Option<f64> {
        let (value, mode) = evaluate(process_value, channel);
        let emit = match self.last {
            None => true,
            Some(prev) if prev.mode != mode => true,
            Some(prev) => {
                let min_gap =
                    Duration::milliseconds(i64::try_from(channel.update_rate_ms).unwrap_or(i64::MAX));
                let due = now - prev.at >= min_gap;
                let moved = (value - prev.value).abs() >= channel.deadband.max(0.0);
                #[allow(clippy::float_cmp)]
                let changed = value != prev.value;
                due && moved && changed
            }
        };
        if !emit {
            return None;
        }
        self.last = Some(Emitted {
            value,
            mode,
            at: now,
        });
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn linear() -> CalibrationChannel {
        CalibrationChannel {
            input_min: 0.0,
            input_max: 100.0,
            output_min: 4.0,
            output_max: 20.0,
            zero_offset: 0.0,
            span_multiplier: 1.0,
            enabled: true,
            ..CalibrationChannel::default()
        }
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn linear_endpoints_and_midpoint() {
        let ch = linear();
        assert!(approx(to_output_signal(0.0, &ch), 4.0));
        assert!(approx(to_output_signal(100.0, &ch), 20.0));
        assert!(approx(to_output_signal(50.0, &ch), 12.0));
    }

    #[test]
    fn input_is_clamped_to_range() {
        let ch = linear();
        assert!(approx(to_output_signal(-50.0, &ch), 4.0));
        assert!(approx(to_output_signal(250.0, &ch), 20.0));
        assert!(approx(to_output_signal(f64::INFINITY, &ch), 20.0));
        assert!(approx(to_output_signal(f64::NAN, &ch), 4.0));
    }

    #[test]
    fn disabled_channel_returns_failsafe_even_with_override() {
        let ch = CalibrationChannel {
            enabled: false,
            override_enabled: true,
            manual_value: 15.0,
            failsafe_value: 3.6,
            ..linear()
        };
        assert!(approx(to_output_signal(50.0, &ch), 3.6));
        assert_eq!(evaluate(50.0, &ch).1, OutputMode::Failsafe);
    }

    #[test]
    fn override_bypasses_transfer_function() {
        let ch = CalibrationChannel {
            override_enabled: true,
            manual_value: 15.0,
            ..linear()
        };
        assert!(approx(to_output_signal(0.0, &ch), 15.0));
        assert!(approx(to_output_signal(100.0, &ch), 15.0));
    }

    #[test]
    fn zero_offset_and_span_shift_output() {
        let ch = CalibrationChannel {
            zero_offset: 0.1,
            span_multiplier: 0.5,
            ..linear()
        };
        // (0.5 + 0.1) * 0.5 = 0.3 → 4 + 0.3 * 16 = 8.8
        assert!(approx(to_output_signal(50.0, &ch), 8.8));
    }

    #[test]
    fn output_clamp_applies_after_span() {
        let ch = CalibrationChannel {
            span_multiplier: 2.0,
            output_clamp_max: 20.5,
            ..linear()
        };
        assert!(approx(to_output_signal(100.0, &ch), 20.5));
        let ch = CalibrationChannel {
            zero_offset: -0.5,
            output_clamp_min: 3.8,
            ..linear()
        };
        assert!(approx(to_output_signal(0.0, &ch), 3.8));
    }

    #[test]
    fn degenerate_input_range_pins_normalized_to_zero() {
        let ch = CalibrationChannel {
            input_min: 10.0,
            input_max: 10.0,
            ..linear()
        };
        assert!(approx(to_output_signal(10.0, &ch), 4.0));
        assert!(approx(to_output_signal(99.0, &ch), 4.0));
        assert!(ch.validate().contains(&ChannelIssue::DegenerateInputRange));
    }

    #[test]
    fn non_linear_scaling_is_flagged_and_computed_linearly() {
        let ch = CalibrationChannel {
            scaling_type: ScalingType::Square,
            ..linear()
        };
        assert!(approx(to_output_signal(50.0, &ch), 12.0));
        assert_eq!(
            ch.validate(),
            vec![ChannelIssue::UnsupportedScaling(ScalingType::Square)]
        );
    }

    #[test]
    fn validate_reports_clamp_and_failsafe_problems() {
        assert!(CalibrationChannel::default().validate().is_empty());

        let ch = CalibrationChannel {
            output_clamp_min: 20.0,
            output_clamp_max: 4.0,
            ..linear()
        };
        assert!(matches!(
            ch.validate().as_slice(),
            [ChannelIssue::InvertedOutputClamp { .. }]
        ));

        let ch = CalibrationChannel {
            failsafe_value: 22.0,
            deadband: -1.0,
            ..linear()
        };
        let issues = ch.validate();
        assert!(issues.contains(&ChannelIssue::FailsafeOutsideClamp { failsafe: 22.0 }));
        assert!(issues.contains(&ChannelIssue::NegativeDeadband(-1.0)));
    }

    #[test]
    fn channel_deserializes_source_field_names() {
        let json = r#"{
            "enabled": true, "inputMin": 0, "inputMax": 1, "outputMin": 4, "outputMax": 20,
            "zeroOffset": 0, "spanMultiplier": 1, "scalingType": "logarithmic",
            "deadband": 0.1, "updateRate": 500, "failsafeValue": 4,
            "outputClampMin": 4, "outputClampMax": 20
        }"#;
        let ch: CalibrationChannel = serde_json::from_str(json).unwrap();
        assert_eq!(ch.update_rate_ms, 500);
        assert_eq!(ch.scaling_type, ScalingType::Logarithmic);
        assert!(!ch.override_enabled);
        assert!(approx(to_output_signal(0.5, &ch), 12.0));
    }

    #[test]
    fn signal_percent_spans_loop() {
        assert!(approx(signal_percent(4.0), 0.0));
        assert!(approx(signal_percent(12.0), 50.0));
        assert!(approx(signal_percent(20.0), 100.0));
    }

    #[test]
    fn driver_applies_deadband_and_update_rate() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let ch = CalibrationChannel {
            deadband: 0.5,
            update_rate_ms: 1000,
            ..linear()
        };
        let mut driver = SignalDriver::new();
        assert_eq!(driver.update(50.0, &ch, t0), Some(12.0));
        // Too soon.
        assert_eq!(driver.update(80.0, &ch, t0 + Duration::milliseconds(500)), None);
        // Due, but inside the deadband (51 → 12.16 mA).
        assert_eq!(driver.update(51.0, &ch, t0 + Duration::seconds(2)), None);
        // Due and outside the deadband.
        let out = driver.update(60.0, &ch, t0 + Duration::seconds(3)).unwrap();
        assert!(approx(out, 13.6));
        assert_eq!(driver.last_output(), Some(out));
    }

    #[test]
    fn driver_emits_mode_changes_immediately() {
        let t0 = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut ch = CalibrationChannel {
            update_rate_ms: 60_000,
            ..linear()
        };
        let mut driver = SignalDriver::new();
        assert_eq!(driver.update(50.0, &ch, t0), Some(12.0));
        ch.enabled = false;
        assert_eq!(driver.update(50.0, &ch, t0), Some(4.0));
        ch.enabled = true;
        ch.override_enabled = true;
        ch.manual_value = 15.0;
        assert_eq!(driver.update(50.0, &ch, t0), Some(15.0));
        // Same mode, same value: nothing to send.
        assert_eq!(driver.update(50.0, &ch, t0 + Duration::hours(1)), None);
    }

    proptest! {
        #[test]
        fn computed_output_stays_within_clamp(
            v in proptest::num::f64::ANY,
            offset in -1.0f64..1.0,
            span in 0.0f64..4.0,
        ) {
            let ch = CalibrationChannel {
                zero_offset: offset,
                span_multiplier: span,
                ..linear()
            };
            let out = to_output_signal(v, &ch);
            prop_assert!((4.0..=20.0).contains(&out));
        }

        #[test]
        fn disabled_channel_always_failsafe(
            v in proptest::num::f64::ANY,
            override_enabled in any::<bool>(),
            manual in 0.0f64..24.0,
        ) {
            let ch = CalibrationChannel {
                enabled: false,
                override_enabled,
                manual_value: manual,
                failsafe_value: 3.6,
                ..linear()
            };
            prop_assert_eq!(to_output_signal(v, &ch), 3.6);
        }
    }
}
