//! Experiment state management and checkpointing.
//!
//! This module provides the authoritative run state for the Runner, including
//! transition validation and checkpoint serialization for resume after a
//! pause, an acknowledged error, or a process restart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::experiment::status::ErrorReport;

/// Experiment execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──start──> Running ──exhausted──> Completed
///  ▲  ▲            │   ▲
///  │  │       pause│   │resume
///  │  │            ▼   │
///  │  └───stop─── Paused
///  │
///  └──acknowledge── Error <──failure── Running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExperimentState {
    /// No run in progress (initial, stopped or acknowledged)
    Idle,
    /// Control loop actively executing points
    Running,
    /// Suspended at a point boundary
    Paused,
    /// Halted by an unrecoverable failure, awaiting acknowledgment
    Error,
    /// Resolver exhausted without error
    Completed,
}

impl std::fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExperimentState::Idle => write!(f, "Idle"),
            ExperimentState::Running => write!(f, "Running"),
            ExperimentState::Paused => write!(f, "Paused"),
            ExperimentState::Error => write!(f, "Error"),
            ExperimentState::Completed => write!(f, "Completed"),
        }
    }
}

impl ExperimentState {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        matches!(self, ExperimentState::Idle | ExperimentState::Completed)
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(self, ExperimentState::Running)
    }

    /// Check if the state allows resuming.
    pub fn can_resume(&self) -> bool {
        matches!(self, ExperimentState::Paused)
    }
}

/// A named state change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// IDLE → RUNNING
    Start,
    /// RUNNING → PAUSED
    Pause,
    /// PAUSED → RUNNING
    Resume,
    /// PAUSED → IDLE
    Stop,
    /// RUNNING → ERROR
    Fail,
    /// RUNNING → COMPLETED
    Complete,
    /// ERROR → IDLE
    Acknowledge,
}

impl Transition {
    /// State this transition leads to.
    pub fn target(&self) -> ExperimentState {
        match self {
            Transition::Start | Transition::Resume => ExperimentState::Running,
            Transition::Pause => ExperimentState::Paused,
            Transition::Stop | Transition::Acknowledge => ExperimentState::Idle,
            Transition::Fail => ExperimentState::Error,
            Transition::Complete => ExperimentState::Completed,
        }
    }

    /// State this transition must start from.
    pub fn source(&self) -> ExperimentState {
        match self {
            Transition::Start => ExperimentState::Idle,
            Transition::Pause | Transition::Fail | Transition::Complete => {
                ExperimentState::Running
            }
            Transition::Resume | Transition::Stop => ExperimentState::Paused,
            Transition::Acknowledge => ExperimentState::Error,
        }
    }
}

/// Owner of the authoritative experiment state.
///
/// Every change goes through [`StateMachine::apply`]; a rejected transition
/// leaves the state untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    state: ExperimentState,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// New machine in IDLE.
    pub fn new() -> Self {
        Self {
            state: ExperimentState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> ExperimentState {
        self.state
    }

    /// Apply `transition`, returning the new state.
    pub fn apply(&mut self, transition: Transition) -> AppResult<ExperimentState> {
        if self.state != transition.source() {
            return Err(DaqError::IllegalTransition {
                from: self.state,
                to: transition.target(),
            });
        }
        self.state = transition.target();
        Ok(self.state)
    }
}

/// Lifecycle label of a persisted run.
///
/// Tracked in the checkpoint next to the immutable run metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Points are being acquired
    Running,
    /// Suspended, resumable
    Paused,
    /// Halted by a failure, resumable after acknowledgment
    Error,
    /// Abandoned by a stop, resumable with continue
    Stopped,
    /// All points acquired
    Completed,
}

impl RunStatus {
    /// Whether a run with this status may be continued.
    pub fn is_resumable(&self) -> bool {
        !matches!(self, RunStatus::Completed)
    }
}

/// Serializable checkpoint for a run.
///
/// Written after every persisted point, so the Resolver and Runner can
/// reconstruct the exact continuation without any in-memory state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique run identifier
    pub run_id: String,
    /// Checkpoint creation timestamp
    pub timestamp: DateTime<Utc>,
    /// Experiment state when checkpoint was created
    pub state: ExperimentState,
    /// Run lifecycle label
    pub status: RunStatus,
    /// Index of the last durably written point
    pub last_completed_index: Option<usize>,
    /// Total number of points in the sweep
    pub total_points: usize,
    /// Failure that halted the run, if any
    pub error: Option<ErrorReport>,
    /// Set when the run reached a final status
    pub finished_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    /// Create a new checkpoint.
    pub fn new(run_id: impl Into<String>, state: ExperimentState, total_points: usize) -> Self {
        Self {
            run_id: run_id.into(),
            timestamp: Utc::now(),
            state,
            status: RunStatus::Running,
            last_completed_index: None,
            total_points,
            error: None,
            finished_at: None,
        }
    }

    /// Set the run status; final statuses stamp `finished_at`.
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        if matches!(status, RunStatus::Completed | RunStatus::Stopped) {
            self.finished_at = Some(Utc::now());
        }
        self
    }

    /// Set the last completed index.
    pub fn with_last_completed(mut self, index: Option<usize>) -> Self {
        self.last_completed_index = index;
        self
    }

    /// Set the error report.
    pub fn with_error(mut self, error: Option<ErrorReport>) -> Self {
        self.error = error;
        self
    }

    /// Index the next point to acquire.
    pub fn next_index(&self) -> usize {
        self.last_completed_index.map_or(0, |i| i + 1)
    }

    /// Save checkpoint atomically to a JSON file.
    ///
    /// The document is written to a sibling temporary file, synced, then renamed
    /// over `path`, so a crash leaves either the old or the new checkpoint.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if serialization, the write or the rename fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_vec_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| DaqError::persistence("Failed to create checkpoint directory", e))?;
        }

        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| DaqError::persistence(format!("Failed to create {:?}", tmp), e))?;
        file.write_all(&json)
            .and_then(|_| file.sync_all())
            .map_err(|e| DaqError::persistence(format!("Failed to write {:?}", tmp), e))?;
        fs::rename(&tmp, path).map_err(|e| {
            DaqError::persistence(format!("Failed to write checkpoint to {:?}", path), e)
        })?;

        Ok(())
    }

    /// Load checkpoint from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let json = fs::read(&path).map_err(|e| {
            DaqError::persistence(
                format!("Failed to read checkpoint from {:?}", path.as_ref()),
                e,
            )
        })?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::tempdir;

    #[test]
    fn test_state_transitions() {
        assert!(ExperimentState::Idle.can_begin());
        assert!(!ExperimentState::Running.can_begin());
        assert!(!ExperimentState::Error.can_begin());

        assert!(ExperimentState::Running.can_pause());
        assert!(!ExperimentState::Idle.can_pause());

        assert!(ExperimentState::Paused.can_resume());
        assert!(!ExperimentState::Running.can_resume());
    }

    #[test]
    fn full_lifecycle_is_legal() {
        let mut machine = StateMachine::new();
        for t in [
            Transition::Start,
            Transition::Pause,
            Transition::Resume,
            Transition::Fail,
            Transition::Acknowledge,
            Transition::Start,
            Transition::Complete,
        ] {
            machine.apply(t).unwrap();
        }
        assert_eq!(machine.state(), ExperimentState::Completed);
    }

    #[test]
    fn illegal_transitions_leave_state_unchanged() {
        let mut machine = StateMachine::new();
        let err = machine.apply(Transition::Pause).unwrap_err();
        assert!(matches!(
            err,
            DaqError::IllegalTransition {
                from: ExperimentState::Idle,
                to: ExperimentState::Paused
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert_eq!(machine.state(), ExperimentState::Idle);

        machine.apply(Transition::Start).unwrap();
        machine.apply(Transition::Complete).unwrap();
        let err = machine.apply(Transition::Start).unwrap_err();
        assert_eq!(err.to_string(), "Illegal transition Completed -> Running");
        assert_eq!(machine.state(), ExperimentState::Completed);
    }

    #[test]
    fn stop_requires_pause_first() {
        let mut machine = StateMachine::new();
        machine.apply(Transition::Start).unwrap();
        assert!(machine.apply(Transition::Stop).is_err());
        assert_eq!(machine.state(), ExperimentState::Running);
        machine.apply(Transition::Pause).unwrap();
        assert_eq!(machine.apply(Transition::Stop).unwrap(), ExperimentState::Idle);
    }

    #[test]
    fn test_checkpoint_save_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");

        let checkpoint = Checkpoint::new("run_001", ExperimentState::Paused, 6)
            .with_status(RunStatus::Paused)
            .with_last_completed(Some(2));
        checkpoint.save(&path).unwrap();

        let loaded = Checkpoint::load(&path).unwrap();
        assert_eq!(loaded, checkpoint);
        assert_eq!(loaded.next_index(), 3);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn final_status_stamps_finish_time() {
        let checkpoint = Checkpoint::new("run", ExperimentState::Completed, 1)
            .with_status(RunStatus::Completed);
        assert!(checkpoint.finished_at.is_some());
        assert!(!checkpoint.status.is_resumable());
        assert_eq!(checkpoint.next_index(), 0);
    }
}
