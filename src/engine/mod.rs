//! Engine layer: units of work and the engines that execute them.
//!
//! The Runner never talks to a driver directly. It builds an [`EngineTask`]
//! for every instrument operation and hands it to the
//! [`EngineDispatcher`](dispatcher::EngineDispatcher), which routes it by
//! instrument role to a registered [`Engine`] and enforces the timeout and
//! retry policy.
//!
//! ```text
//! Runner ──EngineTask──> EngineDispatcher ──role──> Engine ──capability──> driver
//!                              ▲
//! monitor ─Query only─> ReadOnlyDispatcher
//! ```

pub mod dispatcher;
pub mod instrument;

pub use dispatcher::{DispatchPolicy, EngineDispatcher, ReadOnlyDispatcher};
pub use instrument::InstrumentEngine;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::AppResult;
use crate::hardware::capabilities::{CaptureParams, Samples};

/// Category of an instrument operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Open a session
    Connect,
    /// Close a session
    Disconnect,
    /// Read a parameter
    Query,
    /// Drive a setpoint
    Set,
    /// Acquire a measurement
    Capture,
}

impl OperationKind {
    /// Whether the operation can change instrument or sample state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, OperationKind::Query)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            OperationKind::Connect => "connect",
            OperationKind::Disconnect => "disconnect",
            OperationKind::Query => "query",
            OperationKind::Set => "set",
            OperationKind::Capture => "capture",
        };
        write!(f, "{}", label)
    }
}

/// Operation with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Open a session
    Connect,
    /// Close a session
    Disconnect,
    /// Read `parameter`
    Query {
        /// Parameter name
        parameter: String,
    },
    /// Set `parameter` to `value`
    Set {
        /// Parameter name
        parameter: String,
        /// Target value
        value: f64,
        /// Wait for the instrument to settle
        wait_for_stable: bool,
    },
    /// Acquire one measurement
    Capture {
        /// Instrument-specific parameters
        params: CaptureParams,
    },
}

impl Operation {
    /// Category of this operation.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Connect => OperationKind::Connect,
            Operation::Disconnect => OperationKind::Disconnect,
            Operation::Query { .. } => OperationKind::Query,
            Operation::Set { .. } => OperationKind::Set,
            Operation::Capture { .. } => OperationKind::Capture,
        }
    }
}

/// A single unit of work for one instrument role.
///
/// Built fresh for every dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineTask {
    /// Target instrument role
    pub role: String,
    /// What to do
    pub operation: Operation,
    /// Overrides the dispatcher's timeout policy
    pub timeout: Option<Duration>,
}

impl EngineTask {
    fn new(role: impl Into<String>, operation: Operation) -> Self {
        Self {
            role: role.into(),
            operation,
            timeout: None,
        }
    }

    /// Open a session on `role`.
    pub fn connect(role: impl Into<String>) -> Self {
        Self::new(role, Operation::Connect)
    }

    /// Close the session on `role`.
    pub fn disconnect(role: impl Into<String>) -> Self {
        Self::new(role, Operation::Disconnect)
    }

    /// Read `parameter` on `role`.
    pub fn query(role: impl Into<String>, parameter: impl Into<String>) -> Self {
        Self::new(
            role,
            Operation::Query {
                parameter: parameter.into(),
            },
        )
    }

    /// Set `parameter` on `role`.
    pub fn set(
        role: impl Into<String>,
        parameter: impl Into<String>,
        value: f64,
        wait_for_stable: bool,
    ) -> Self {
        Self::new(
            role,
            Operation::Set {
                parameter: parameter.into(),
                value,
                wait_for_stable,
            },
        )
    }

    /// Capture on `role`.
    pub fn capture(role: impl Into<String>, params: CaptureParams) -> Self {
        Self::new(role, Operation::Capture { params })
    }

    /// Bound this task by `timeout` instead of the policy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Category of the task's operation.
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }
}

/// Raw result of an engine operation. The dispatcher does not interpret it.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    /// Session open
    Connected {
        /// Identity reported by the instrument
        identity: String,
    },
    /// Session closed
    Disconnected,
    /// Queried value
    Value(Value),
    /// Set acknowledged
    Ack,
    /// Captured sample vectors
    Samples(Samples),
}

impl EngineOutput {
    /// Numeric value of a query result.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            EngineOutput::Value(v) => v.as_f64(),
            _ => None,
        }
    }

    /// Sample vectors of a capture result.
    pub fn into_samples(self) -> Option<Samples> {
        match self {
            EngineOutput::Samples(s) => Some(s),
            _ => None,
        }
    }
}

/// Executes tasks for one instrument role.
///
/// Engines hold nothing but a connection handle and can be invoked repeatedly
/// without accumulating hidden state.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Operations this engine can execute.
    fn supported_operations(&self) -> BTreeSet<OperationKind>;

    /// Whether `operation` is supported.
    fn supports(&self, operation: OperationKind) -> bool {
        self.supported_operations().contains(&operation)
    }

    /// Driver description for provenance.
    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Execute `task` to completion.
    async fn execute(&self, task: &EngineTask) -> AppResult<EngineOutput>;
}
