//! Status snapshots published by the Runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DaqError, ErrorKind};
use crate::experiment::state::ExperimentState;

/// Kind and human-readable detail of the failure that halted a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Failure class
    pub kind: ErrorKind,
    /// Human-readable detail
    pub detail: String,
    /// Point being acquired when the failure happened, if any
    pub index: Option<usize>,
}

impl ErrorReport {
    /// Build a report from an error raised while acquiring `index`.
    pub fn new(err: &DaqError, index: Option<usize>) -> Self {
        Self {
            kind: err.kind(),
            detail: err.to_string(),
            index,
        }
    }
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "{} at point {}: {}", self.kind, i, self.detail),
            None => write!(f, "{}: {}", self.kind, self.detail),
        }
    }
}

/// Immutable view of the run, produced after every point and every transition.
///
/// This is the only thing observers read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Run the snapshot belongs to
    pub run_id: Option<String>,
    /// Current state
    pub state: ExperimentState,
    /// Index of the last durably written point
    pub index: Option<usize>,
    /// Coordinate of that point
    pub coordinate: Option<Vec<f64>>,
    /// Points written so far
    pub completed_points: usize,
    /// Points in the sweep
    pub total_points: usize,
    /// Failure that halted the run, if any
    pub last_error: Option<ErrorReport>,
    /// When the snapshot was produced
    pub timestamp: DateTime<Utc>,
}

impl StatusSnapshot {
    /// Snapshot of a Runner with no run.
    pub fn idle() -> Self {
        Self {
            run_id: None,
            state: ExperimentState::Idle,
            index: None,
            coordinate: None,
            completed_points: 0,
            total_points: 0,
            last_error: None,
            timestamp: Utc::now(),
        }
    }

    /// Fraction of points completed, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_points == 0 {
            return 0.0;
        }
        (self.completed_points as f64 / self.total_points as f64).min(1.0)
    }

    /// Next point the Runner will acquire.
    pub fn next_index(&self) -> usize {
        self.index.map_or(0, |i| i + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_fraction() {
        let mut snapshot = StatusSnapshot::idle();
        assert_eq!(snapshot.progress(), 0.0);
        snapshot.total_points = 6;
        snapshot.completed_points = 3;
        assert!((snapshot.progress() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn report_carries_kind_and_detail() {
        let err = DaqError::acquisition("source", "no trigger");
        let report = ErrorReport::new(&err, Some(3));
        assert_eq!(report.kind, ErrorKind::Acquisition);
        assert_eq!(
            report.to_string(),
            "acquisition at point 3: Acquisition error on 'source': no trigger"
        );
    }
}
