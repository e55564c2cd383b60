//! Declarative sweep definitions.
//!
//! A [`SweepConfig`] is pure data: the axes to visit, how they combine, what to
//! capture at every point. It is validated when it is built or deserialized, so
//! an invalid sweep never reaches the Runner.
//!
//! # Example
//!
//! ```rust
//! use tera_daq::experiment::sweep::{CaptureTarget, SweepAxis, SweepConfig};
//!
//! let temperature = SweepAxis::new("temperature", "K", vec![10.0, 20.0, 30.0])
//!     .targeting("temperature-control", "temperature")
//!     .wait_for_stable(true);
//! let field = SweepAxis::from_range("field", "T", 0.0, 1.0, 1.0)
//!     .unwrap()
//!     .targeting("field-control", "field");
//!
//! let sweep = SweepConfig::nested(vec![temperature, field])
//!     .unwrap()
//!     .with_capture(CaptureTarget::new("thz", "source"));
//! assert_eq!(sweep.axis_names(), vec!["temperature", "field"]);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::CaptureParams;

/// Largest number of points a range axis may generate.
pub const MAX_AXIS_POINTS: usize = 10_000_000;

/// Name and unit of a time axis.
pub const TIME_AXIS: &str = "time";
const TIME_UNIT: &str = "s";

/// Instrument parameter an axis drives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisTarget {
    /// Instrument role, e.g. `temperature-control`
    pub role: String,
    /// Parameter name on that instrument
    pub parameter: String,
    /// Wait for the instrument to report a stable value after each set
    #[serde(default)]
    pub wait_for_stable: bool,
}

/// One declared dimension of variation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepAxis {
    /// Axis name, also the coordinate dataset name
    pub name: String,
    /// Physical unit of the values
    pub unit: String,
    /// Ordered target values
    pub values: Vec<f64>,
    /// Parameter driven by this axis; `None` for count and time axes
    #[serde(default)]
    pub target: Option<AxisTarget>,
    /// Each value is a wait in seconds, applied at every point
    #[serde(default)]
    pub wait: bool,
}

impl SweepAxis {
    /// Axis over explicit values, with no instrument target yet.
    pub fn new(name: impl Into<String>, unit: impl Into<String>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            unit: unit.into(),
            values,
            target: None,
            wait: false,
        }
    }

    /// Inclusive range from `start` to `stop` in increments of `step`.
    ///
    /// Values are computed as `start + k * step`; `stop` is included when it lies
    /// within `|step| * 1e-12` of a grid point.
    ///
    /// # Errors
    ///
    /// Configuration error if `step` is zero, any bound is not finite, `step`
    /// does not move `start` toward `stop`, or the range would exceed
    /// [`MAX_AXIS_POINTS`].
    pub fn from_range(
        name: impl Into<String>,
        unit: impl Into<String>,
        start: f64,
        stop: f64,
        step: f64,
    ) -> AppResult<Self> {
        let name = name.into();
        if !(start.is_finite() && stop.is_finite() && step.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "Axis '{}': range bounds must be finite",
                name
            )));
        }
        if step == 0.0 {
            return Err(DaqError::Configuration(format!(
                "Axis '{}': sweep step must be non-zero",
                name
            )));
        }
        if (stop - start) * step < 0.0 {
            return Err(DaqError::Configuration(format!(
                "Axis '{}': step sign does not move start toward stop",
                name
            )));
        }

        let eps = step.abs() * 1e-12;
        let steps = (((stop - start).abs() + eps) / step.abs()).floor();
        if !steps.is_finite() || steps >= MAX_AXIS_POINTS as f64 {
            return Err(DaqError::Configuration(format!(
                "Axis '{}': range {}..{} by {} exceeds {} points",
                name, start, stop, step, MAX_AXIS_POINTS
            )));
        }
        let steps = steps as usize;
        let values = (0..=steps).map(|k| start + k as f64 * step).collect();
        Ok(Self::new(name, unit, values))
    }

    /// Measurement-count axis `0..n` with no instrument target.
    ///
    /// Useful for averaging and stability runs.
    pub fn count(n: usize) -> Self {
        Self::new("count", "#", (0..n).map(|i| i as f64).collect())
    }

    /// Time axis: the Runner waits `values_s[k]` seconds when it applies
    /// value `k`, at every point.
    ///
    /// Values must be non-negative; checked when the sweep is built.
    pub fn time(values_s: Vec<f64>) -> Self {
        Self {
            wait: true,
            ..Self::new(TIME_AXIS, TIME_UNIT, values_s)
        }
    }

    /// Wait to apply for `value`, for a time axis.
    pub fn wait_for(&self, value: f64) -> Option<Duration> {
        if self.wait {
            Duration::try_from_secs_f64(value).ok()
        } else {
            None
        }
    }

    /// Drive `parameter` on `role` with this axis.
    pub fn targeting(mut self, role: impl Into<String>, parameter: impl Into<String>) -> Self {
        self.target = Some(AxisTarget {
            role: role.into(),
            parameter: parameter.into(),
            wait_for_stable: false,
        });
        self
    }

    /// Wait for stabilisation after every set.
    pub fn wait_for_stable(mut self, wait: bool) -> Self {
        if let Some(target) = self.target.as_mut() {
            target.wait_for_stable = wait;
        }
        self
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the axis has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn validate(&self) -> AppResult<()> {
        if self.name.trim().is_empty() {
            return Err(DaqError::Configuration("Axis name must not be empty".into()));
        }
        if self.values.is_empty() {
            return Err(DaqError::Configuration(format!(
                "Axis '{}' has no values",
                self.name
            )));
        }
        if let Some(bad) = self.values.iter().find(|v| !v.is_finite()) {
            return Err(DaqError::Configuration(format!(
                "Axis '{}' contains non-finite value {}",
                self.name, bad
            )));
        }
        if let Some(target) = &self.target {
            if target.role.is_empty() || target.parameter.is_empty() {
                return Err(DaqError::Configuration(format!(
                    "Axis '{}' has an incomplete instrument target",
                    self.name
                )));
            }
        }
        if self.wait {
            if self.unit != TIME_UNIT {
                return Err(DaqError::Configuration(format!(
                    "Time axis '{}' expects unit '{}', got '{}'",
                    self.name, TIME_UNIT, self.unit
                )));
            }
            if self.target.is_some() {
                return Err(DaqError::Configuration(format!(
                    "Time axis '{}' cannot drive an instrument",
                    self.name
                )));
            }
            if let Some(bad) = self.values.iter().find(|v| self.wait_for(**v).is_none()) {
                return Err(DaqError::Configuration(format!(
                    "Time axis '{}' has invalid wait {} s",
                    self.name, bad
                )));
            }
        }
        Ok(())
    }
}

/// How multiple axes combine into coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Composition {
    /// Cartesian product, first-declared axis varies slowest
    Nested,
    /// Axes advance together; lengths must match
    Zipped,
}

/// Capture issued at every point.
///
/// Each returned sample vector becomes channel `<name>.<vector>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureTarget {
    /// Channel prefix
    pub name: String,
    /// Instrument role performing the capture
    pub role: String,
    /// Instrument-specific capture parameters
    #[serde(default)]
    pub params: CaptureParams,
}

impl CaptureTarget {
    /// Capture on `role`, stored under channel prefix `name`.
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            params: CaptureParams::new(),
        }
    }

    /// Add a capture parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

/// Scalar query issued at every point after the axes are set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadbackTarget {
    /// Instrument role to query
    pub role: String,
    /// Parameter to read
    pub parameter: String,
    /// Channel the value is stored under
    pub channel: String,
}

impl ReadbackTarget {
    /// Query `parameter` on `role` into `channel`.
    pub fn new(
        role: impl Into<String>,
        parameter: impl Into<String>,
        channel: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            parameter: parameter.into(),
            channel: channel.into(),
        }
    }
}

#[derive(Deserialize)]
struct RawSweepConfig {
    composition: Composition,
    axes: Vec<SweepAxis>,
    #[serde(default)]
    dwell_s: f64,
    #[serde(default)]
    captures: Vec<CaptureTarget>,
    #[serde(default)]
    readbacks: Vec<ReadbackTarget>,
}

impl TryFrom<RawSweepConfig> for SweepConfig {
    type Error = DaqError;

    fn try_from(raw: RawSweepConfig) -> AppResult<Self> {
        let config = SweepConfig {
            composition: raw.composition,
            axes: raw.axes,
            dwell_s: raw.dwell_s,
            captures: raw.captures,
            readbacks: raw.readbacks,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Full sweep definition for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawSweepConfig")]
pub struct SweepConfig {
    composition: Composition,
    axes: Vec<SweepAxis>,
    dwell_s: f64,
    captures: Vec<CaptureTarget>,
    readbacks: Vec<ReadbackTarget>,
}

impl SweepConfig {
    /// Validated sweep over `axes` combined by `composition`.
    pub fn new(composition: Composition, axes: Vec<SweepAxis>) -> AppResult<Self> {
        let config = Self {
            composition,
            axes,
            dwell_s: 0.0,
            captures: Vec::new(),
            readbacks: Vec::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Cartesian product of `axes`, first axis slowest.
    pub fn nested(axes: Vec<SweepAxis>) -> AppResult<Self> {
        Self::new(Composition::Nested, axes)
    }

    /// Lock-step combination of equal-length `axes`.
    pub fn zipped(axes: Vec<SweepAxis>) -> AppResult<Self> {
        Self::new(Composition::Zipped, axes)
    }

    /// Settle time after setting the axes at every point.
    pub fn with_dwell(mut self, dwell: Duration) -> Self {
        self.dwell_s = dwell.as_secs_f64();
        self
    }

    /// Add a capture.
    pub fn with_capture(mut self, capture: CaptureTarget) -> Self {
        self.captures.push(capture);
        self
    }

    /// Add a readback.
    pub fn with_readback(mut self, readback: ReadbackTarget) -> Self {
        self.readbacks.push(readback);
        self
    }

    /// Composition rule.
    pub fn composition(&self) -> Composition {
        self.composition
    }

    /// Declared axes in order.
    pub fn axes(&self) -> &[SweepAxis] {
        &self.axes
    }

    /// Axis names in declaration order.
    pub fn axis_names(&self) -> Vec<&str> {
        self.axes.iter().map(|a| a.name.as_str()).collect()
    }

    /// Dwell per point.
    pub fn dwell(&self) -> Duration {
        Duration::from_secs_f64(self.dwell_s.max(0.0))
    }

    /// Captures issued at every point.
    pub fn captures(&self) -> &[CaptureTarget] {
        &self.captures
    }

    /// Readbacks issued at every point.
    pub fn readbacks(&self) -> &[ReadbackTarget] {
        &self.readbacks
    }

    /// Every instrument role this sweep touches.
    pub fn roles(&self) -> BTreeSet<String> {
        self.axes
            .iter()
            .filter_map(|a| a.target.as_ref().map(|t| t.role.clone()))
            .chain(self.captures.iter().map(|c| c.role.clone()))
            .chain(self.readbacks.iter().map(|r| r.role.clone()))
            .collect()
    }

    /// Check every invariant of the sweep.
    ///
    /// # Errors
    ///
    /// Configuration error for: no axes, an invalid axis, duplicate axis names,
    /// zipped axes of unequal length, a negative or non-finite dwell, or
    /// colliding channel names.
    pub fn validate(&self) -> AppResult<()> {
        if self.axes.is_empty() {
            return Err(DaqError::Configuration(
                "Sweep must declare at least one axis".into(),
            ));
        }

        let mut names = BTreeSet::new();
        for axis in &self.axes {
            axis.validate()?;
            if !names.insert(axis.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate axis name '{}'",
                    axis.name
                )));
            }
        }

        if self.composition == Composition::Zipped {
            let first = &self.axes[0];
            if let Some(other) = self.axes.iter().find(|a| a.len() != first.len()) {
                return Err(DaqError::Configuration(format!(
                    "Zipped axes must have equal length: '{}' has {} values, '{}' has {}",
                    first.name,
                    first.len(),
                    other.name,
                    other.len()
                )));
            }
        }

        if !self.dwell_s.is_finite() || self.dwell_s < 0.0 {
            return Err(DaqError::Configuration(format!(
                "Dwell must be a non-negative number of seconds, got {}",
                self.dwell_s
            )));
        }

        let mut prefixes = BTreeSet::new();
        for capture in &self.captures {
            if capture.name.is_empty() || capture.role.is_empty() {
                return Err(DaqError::Configuration(
                    "Capture needs a name and a role".into(),
                ));
            }
            if !prefixes.insert(capture.name.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate capture name '{}'",
                    capture.name
                )));
            }
        }

        let mut channels = BTreeSet::new();
        for readback in &self.readbacks {
            if readback.channel.is_empty() || readback.role.is_empty() {
                return Err(DaqError::Configuration(
                    "Readback needs a channel and a role".into(),
                ));
            }
            let prefix = readback.channel.split('.').next().unwrap_or_default();
            if !channels.insert(readback.channel.as_str()) || prefixes.contains(prefix) {
                return Err(DaqError::Configuration(format!(
                    "Readback channel '{}' collides with another channel",
                    readback.channel
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> SweepAxis {
        SweepAxis::new("temperature", "K", vec![10.0, 20.0, 30.0])
            .targeting("temperature-control", "temperature")
    }

    #[test]
    fn range_is_inclusive_and_drift_free() {
        let axis = SweepAxis::from_range("field", "T", 0.0, 1.0, 0.1).unwrap();
        assert_eq!(axis.len(), 11);
        assert_eq!(axis.values[3], 0.0 + 3.0 * 0.1);
        assert!((axis.values[10] - 1.0).abs() < 1e-12);

        let down = SweepAxis::from_range("t", "K", 30.0, 10.0, -10.0).unwrap();
        assert_eq!(down.values, vec![30.0, 20.0, 10.0]);

        let single = SweepAxis::from_range("t", "K", 5.0, 5.0, 1.0).unwrap();
        assert_eq!(single.values, vec![5.0]);
    }

    #[test]
    fn range_rejects_bad_step() {
        assert!(SweepAxis::from_range("f", "T", 0.0, 1.0, 0.0).is_err());
        let err = SweepAxis::from_range("f", "T", 0.0, 1.0, -0.5).unwrap_err();
        assert!(err.to_string().contains("does not move start toward stop"));
    }

    #[test]
    fn range_rejects_unbounded_point_count() {
        let err = SweepAxis::from_range("x", "", 0.0, 1e300, 1e-300).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert!(SweepAxis::from_range("x", "", 0.0, f64::MAX, f64::MIN_POSITIVE).is_err());
        assert!(SweepAxis::from_range("x", "", 0.0, 1.0, 1e-9).is_err());
        assert!(SweepAxis::from_range("x", "", 0.0, 1.0, 1e-6).is_ok());
    }

    #[test]
    fn time_axis_waits_are_validated() {
        let axis = SweepAxis::time(vec![0.0, 0.5, 2.0]);
        assert_eq!(axis.name, TIME_AXIS);
        assert_eq!(axis.unit, "s");
        assert_eq!(axis.wait_for(0.5), Some(Duration::from_millis(500)));
        assert_eq!(SweepAxis::count(1).wait_for(0.5), None);
        assert!(SweepConfig::nested(vec![axis.clone()]).is_ok());

        let negative = SweepAxis::time(vec![1.0, -0.1]);
        assert!(matches!(
            SweepConfig::nested(vec![negative]),
            Err(DaqError::Configuration(_))
        ));

        let mut minutes = axis.clone();
        minutes.unit = "min".into();
        assert!(SweepConfig::nested(vec![minutes]).is_err());

        let driven = axis.targeting("temperature-control", "temperature");
        assert!(SweepConfig::nested(vec![driven]).is_err());
    }

    #[test]
    fn range_values_survive_json_bit_for_bit() {
        let sweep = SweepConfig::nested(vec![SweepAxis::from_range(
            "field", "T", 0.0, 7.0, 0.007,
        )
        .unwrap()
        .targeting("field-control", "field")])
        .unwrap();
        let json = serde_json::to_string(&sweep).unwrap();
        let back: SweepConfig = serde_json::from_str(&json).unwrap();

        let bits = |config: &SweepConfig| -> Vec<u64> {
            config.axes()[0].values.iter().map(|v| v.to_bits()).collect()
        };
        assert_eq!(bits(&back).len(), 1001);
        assert_eq!(bits(&back), bits(&sweep));
    }

    #[test]
    fn count_axis_has_no_target() {
        let axis = SweepAxis::count(4);
        assert_eq!(axis.name, "count");
        assert_eq!(axis.unit, "#");
        assert_eq!(axis.values, vec![0.0, 1.0, 2.0, 3.0]);
        assert!(axis.target.is_none());
    }

    #[test]
    fn zipped_length_mismatch_is_configuration_error() {
        let field = SweepAxis::new("field", "T", vec![0.0, 1.0]).targeting("field-control", "field");
        let err = SweepConfig::zipped(vec![temperature(), field]).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[test]
    fn rejects_empty_and_duplicate_axes() {
        assert!(SweepConfig::nested(vec![]).is_err());
        assert!(SweepConfig::nested(vec![SweepAxis::new("x", "", vec![])]).is_err());
        assert!(SweepConfig::nested(vec![temperature(), temperature()]).is_err());
        assert!(SweepConfig::nested(vec![SweepAxis::new("x", "", vec![f64::NAN])]).is_err());
    }

    #[test]
    fn channel_collisions_are_rejected() {
        let sweep = SweepConfig::nested(vec![temperature()])
            .unwrap()
            .with_capture(CaptureTarget::new("thz", "source"))
            .with_readback(ReadbackTarget::new("source", "counter", "thz"));
        assert!(sweep.validate().is_err());
    }

    #[test]
    fn roles_cover_axes_captures_and_readbacks() {
        let sweep = SweepConfig::nested(vec![temperature(), SweepAxis::count(2)])
            .unwrap()
            .with_capture(CaptureTarget::new("thz", "source"))
            .with_readback(ReadbackTarget::new("field-control", "field", "field_readback"));
        let roles: Vec<_> = sweep.roles().into_iter().collect();
        assert_eq!(roles, vec!["field-control", "source", "temperature-control"]);
    }

    #[test]
    fn deserialization_validates() {
        let bad = r#"{
            "composition": "zipped",
            "axes": [
                {"name": "a", "unit": "", "values": [1.0, 2.0]},
                {"name": "b", "unit": "", "values": [1.0]}
            ]
        }"#;
        assert!(serde_json::from_str::<SweepConfig>(bad).is_err());

        let sweep = SweepConfig::nested(vec![temperature()])
            .unwrap()
            .with_dwell(Duration::from_millis(250));
        let json = serde_json::to_string(&sweep).unwrap();
        let back: SweepConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, sweep);
        assert_eq!(back.dwell(), Duration::from_millis(250));
    }
}
