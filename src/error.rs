//! Custom error types for the experiment engine.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failure classes that can occur while a sweep is executing, from
//! invalid sweep definitions to unreachable instruments and failed storage writes.
//!
//! ## Error Hierarchy
//!
//! Every `DaqError` maps onto one [`ErrorKind`], which is what the Runner uses to
//! decide what happens to the run:
//!
//! - **`Configuration`**: The sweep definition or the application configuration is
//!   invalid (e.g., zipped axes of different length). Detected before the run enters
//!   RUNNING; the experiment stays IDLE.
//! - **`Connection`**: An instrument could not be reached. Recoverable: the dispatcher
//!   retries with bounded exponential backoff before escalating.
//! - **`Timeout`**: An operation exceeded its bound. Reported as its own kind but
//!   handled like an acquisition failure; capture operations are never retried.
//! - **`Acquisition`**: A set or capture operation failed. The run transitions to ERROR;
//!   everything persisted before the failure stays readable.
//! - **`Persistence`**: Writing to durable storage failed. Fatal for the run.
//! - **`Rejected`**: A command was not legal in the current state. Not fatal to anything.
//!
//! By using `#[from]`, `DaqError` can be created from underlying I/O and serialization
//! errors with the `?` operator; those land in the `Persistence` or `Configuration`
//! kinds depending on where they come from.

use std::time::Duration;
use thiserror::Error;

use crate::engine::OperationKind;
use crate::experiment::state::ExperimentState;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Failure class of a [`DaqError`].
///
/// Reported in every [`StatusSnapshot`](crate::experiment::status::StatusSnapshot)
/// that carries an error, so observers can react without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Invalid sweep or application configuration.
    Configuration,
    /// Instrument unreachable after bounded retries.
    Connection,
    /// Operation exceeded its configured bound.
    Timeout,
    /// Set or capture operation failed.
    Acquisition,
    /// Durable storage failed.
    Persistence,
    /// Command rejected in the current state.
    Rejected,
    /// Engine plumbing failure (unknown role, unsupported operation, runner gone).
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind, raised inside the control loop, halts the run
    /// and moves the experiment to ERROR.
    pub fn halts_run(&self) -> bool {
        !matches!(self, ErrorKind::Rejected)
    }

    /// Whether the dispatcher may retry an operation that failed with this kind.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Connection)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Acquisition => "acquisition",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Internal => "internal",
        };
        write!(f, "{}", label)
    }
}

/// Primary error type for the experiment engine.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Sweep or configuration validation failed.
    ///
    /// **Recovery Strategy**: Fix the sweep definition and issue `start` again. The
    /// experiment never left IDLE.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Instrument could not be reached.
    ///
    /// **Recovery Strategy**: Retried inside the dispatcher with exponential backoff;
    /// escalates to ERROR once the retry budget is exhausted.
    #[error("Connection error on '{role}': {message}")]
    Connection {
        /// Instrument role that failed to connect
        role: String,
        /// Driver-level reason
        message: String,
    },

    /// Operation exceeded its per-task bound.
    #[error("Timeout on '{role}' during {operation} after {timeout:?}")]
    Timeout {
        /// Instrument role the task was dispatched to
        role: String,
        /// Operation that timed out
        operation: OperationKind,
        /// The bound that was exceeded
        timeout: Duration,
    },

    /// A set or capture operation failed on the instrument.
    #[error("Acquisition error on '{role}': {message}")]
    Acquisition {
        /// Instrument role that failed
        role: String,
        /// Driver-level reason
        message: String,
    },

    /// Writing to durable storage failed.
    ///
    /// **Recovery Strategy**: None inside the run. The Runner aborts immediately and
    /// attempts a best-effort close of what is already durable.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// A state transition that the state machine does not allow.
    #[error("Illegal transition {from} -> {to}")]
    IllegalTransition {
        /// State the machine was in
        from: ExperimentState,
        /// State that was requested
        to: ExperimentState,
    },

    /// No engine registered for the requested role.
    #[error("No engine registered for role '{0}'")]
    UnknownRole(String),

    /// The engine registered for a role does not declare the operation.
    #[error("Engine for role '{role}' does not support {operation}")]
    UnsupportedOperation {
        /// Instrument role
        role: String,
        /// Requested operation
        operation: OperationKind,
    },

    /// The runner thread is gone (panicked or shut down).
    #[error("Runner is not available")]
    RunnerUnavailable,

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Failure class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DaqError::Configuration(_) | DaqError::Config(_) => ErrorKind::Configuration,
            DaqError::Connection { .. } => ErrorKind::Connection,
            DaqError::Timeout { .. } => ErrorKind::Timeout,
            DaqError::Acquisition { .. } => ErrorKind::Acquisition,
            DaqError::Persistence(_) | DaqError::Io(_) | DaqError::Serialization(_) => {
                ErrorKind::Persistence
            }
            DaqError::IllegalTransition { .. } => ErrorKind::Rejected,
            DaqError::UnknownRole(_)
            | DaqError::UnsupportedOperation { .. }
            | DaqError::RunnerUnavailable => ErrorKind::Internal,
        }
    }

    /// Wrap an I/O error as a persistence failure with context.
    pub fn persistence(context: impl std::fmt::Display, err: impl std::fmt::Display) -> Self {
        DaqError::Persistence(format!("{context}: {err}"))
    }

    /// Build a connection error for `role`.
    pub fn connection(role: impl Into<String>, message: impl std::fmt::Display) -> Self {
        DaqError::Connection {
            role: role.into(),
            message: message.to_string(),
        }
    }

    /// Build an acquisition error for `role`.
    pub fn acquisition(role: impl Into<String>, message: impl std::fmt::Display) -> Self {
        DaqError::Acquisition {
            role: role.into(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::acquisition("source", "laser interlock open");
        assert_eq!(
            err.to_string(),
            "Acquisition error on 'source': laser interlock open"
        );
    }

    #[test]
    fn timeout_is_its_own_kind_but_halts() {
        let err = DaqError::Timeout {
            role: "source".into(),
            operation: OperationKind::Capture,
            timeout: Duration::from_millis(250),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(err.kind().halts_run());
        assert!(!err.kind().is_retryable());
    }

    #[test]
    fn only_connection_errors_are_retryable() {
        assert!(DaqError::connection("field-control", "refused")
            .kind()
            .is_retryable());
        assert!(!DaqError::acquisition("source", "x").kind().is_retryable());
        assert!(!DaqError::Persistence("disk full".into())
            .kind()
            .is_retryable());
    }

    #[test]
    fn io_errors_classify_as_persistence() {
        let err: DaqError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert_eq!(err.kind(), ErrorKind::Persistence);
    }

    #[test]
    fn illegal_transition_is_rejected_not_fatal() {
        let err = DaqError::IllegalTransition {
            from: ExperimentState::Idle,
            to: ExperimentState::Paused,
        };
        assert_eq!(err.kind(), ErrorKind::Rejected);
        assert!(!err.kind().halts_run());
        assert_eq!(err.to_string(), "Illegal transition Idle -> Paused");
    }
}
