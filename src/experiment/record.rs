//! Data records and run provenance.

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::experiment::resolver::Coordinate;
use crate::experiment::sweep::SweepConfig;

/// One acquired point. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Position in the sweep enumeration
    pub index: usize,
    /// One value per axis
    pub coordinate: Coordinate,
    /// Channel name to measured values (scalars are one-element vectors)
    pub channels: BTreeMap<String, Vec<f64>>,
    /// Acquisition time
    pub timestamp: DateTime<Utc>,
}

impl DataRecord {
    /// Record for `index` at `coordinate`, stamped now.
    pub fn new(
        index: usize,
        coordinate: Coordinate,
        channels: BTreeMap<String, Vec<f64>>,
    ) -> Self {
        Self {
            index,
            coordinate,
            channels,
            timestamp: Utc::now(),
        }
    }

    /// First value of a scalar channel.
    pub fn scalar(&self, channel: &str) -> Option<f64> {
        self.channels.get(channel).and_then(|v| v.first().copied())
    }
}

/// Who ran the experiment and why. Supplied with `start`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunDescription {
    /// Operator name
    #[serde(default)]
    pub operator: String,
    /// Free-text description
    #[serde(default)]
    pub description: String,
    /// Lab or setup
    #[serde(default)]
    pub location: String,
    /// Additional user attributes
    #[serde(default)]
    pub user: BTreeMap<String, String>,
}

/// Provenance written once at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Unique run identifier (UUID v4)
    pub run_id: String,
    /// Operator and free-text fields
    #[serde(flatten)]
    pub description: RunDescription,
    /// Run creation time (UTC)
    pub created_at_utc: DateTime<Utc>,
    /// Run creation time in the host's local zone (RFC 3339)
    pub created_at_local: String,
    /// Host the Runner executed on
    pub host: String,
    /// Crate version that produced the data
    pub software_version: String,
    /// Full sweep definition
    pub sweep: SweepConfig,
    /// Axis names, the coordinate dataset order
    pub axes: Vec<String>,
    /// Instrument role to identity string
    pub instruments: BTreeMap<String, String>,
    /// Instrument role to driver description
    #[serde(default)]
    pub instrument_details: BTreeMap<String, BTreeMap<String, String>>,
    /// Number of points in the sweep
    pub total_points: usize,
}

impl RunMetadata {
    /// Provenance for a fresh run of `sweep`.
    pub fn new(sweep: SweepConfig, description: RunDescription, total_points: usize) -> Self {
        let now = Utc::now();
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            description,
            created_at_utc: now,
            created_at_local: now.with_timezone(&Local).to_rfc3339(),
            host,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            axes: sweep.axis_names().iter().map(|s| s.to_string()).collect(),
            sweep,
            instruments: BTreeMap::new(),
            instrument_details: BTreeMap::new(),
            total_points,
        }
    }
}
