//! Experiment model and execution.
//!
//! - [`sweep`]: what to measure (axes, composition, captures, readbacks)
//! - [`resolver`]: the ordered points of a sweep
//! - [`state`]: run state machine and checkpoints
//! - [`record`]: data records and run metadata
//! - [`status`]: snapshots published to observers
//! - [`runner`]: the control loop that executes a run

pub mod record;
pub mod resolver;
pub mod runner;
pub mod state;
pub mod status;
pub mod sweep;

pub use record::{DataRecord, RunDescription, RunMetadata};
pub use resolver::{Coordinate, SweepResolver};
pub use runner::{RunRequest, RunnerHandle};
pub use state::{Checkpoint, ExperimentState, RunStatus, StateMachine, Transition};
pub use status::{ErrorReport, StatusSnapshot};
pub use sweep::{
    AxisTarget, CaptureTarget, Composition, ReadbackTarget, SweepAxis, SweepConfig,
};
