//! Atomic Instrument Capabilities
//!
//! Instruments implement only the capabilities they actually have:
//!
//! - A THz source/detector implements: `Connectable + Queryable + Capturable`
//! - A temperature or magnet controller implements: `Connectable + Queryable + Settable`
//! - A read-only sensor implements: `Connectable + Queryable`
//!
//! The engine layer wraps a role's capabilities into a single
//! [`Engine`](crate::engine::Engine) and declares which operations it supports.
//! Drivers never see the sweep, the state machine or the storage layer.
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! Classification into connection, timeout or acquisition failures happens in the
//! engine layer, so drivers can report whatever context they have.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Thermometer { kelvin: f64 }
//!
//! #[async_trait]
//! impl Queryable for Thermometer {
//!     async fn query(&self, _handle: &ConnectionHandle, parameter: &str) -> Result<Value> {
//!         match parameter {
//!             "temperature" => Ok(json!(self.kelvin)),
//!             other => anyhow::bail!("Unknown parameter '{}'", other),
//!         }
//!     }
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Named sample vectors produced by one capture, e.g. `time` and `signal`.
pub type Samples = BTreeMap<String, Vec<f64>>;

/// Instrument-specific capture parameters (averages, window length, ...).
pub type CaptureParams = BTreeMap<String, Value>;

/// Opaque token for an open instrument session.
///
/// Issued by [`Connectable::connect`] and handed back on every later call. The
/// engine holding it keeps no other state about the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionHandle {
    /// Session number assigned by the driver
    pub session: u64,
    /// Human-readable instrument identity (model, serial, firmware)
    pub identity: String,
}

// =============================================================================
// Connectable - Session Management
// =============================================================================

/// Capability: Open and close instrument sessions
///
/// `connect` must be safe to call again after a failure; it must not accumulate
/// hidden state across attempts, because the dispatcher retries it.
#[async_trait]
pub trait Connectable: Send + Sync {
    /// Open a session and return its handle.
    async fn connect(&self) -> Result<ConnectionHandle>;

    /// Close the session. Closing an already-closed session is not an error.
    async fn disconnect(&self, handle: &ConnectionHandle) -> Result<()>;

    /// Static description of the driver (model, transport, address).
    ///
    /// Used for run provenance. Default: empty.
    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

// =============================================================================
// Queryable - Read-only parameter access
// =============================================================================

/// Capability: Read a named parameter without changing instrument state
///
/// This is the only capability reachable from the read-only monitoring path, so
/// implementations must not have side effects on the physical sample.
#[async_trait]
pub trait Queryable: Send + Sync {
    /// Read `parameter` from the instrument.
    async fn query(&self, handle: &ConnectionHandle, parameter: &str) -> Result<Value>;
}

// =============================================================================
// Settable - Drive a setpoint
// =============================================================================

/// Capability: Drive a numeric setpoint
#[async_trait]
pub trait Settable: Send + Sync {
    /// Set `parameter` to `value`.
    ///
    /// With `wait_for_stable`, returns only once the instrument reports the value
    /// has settled (e.g. temperature within tolerance).
    async fn set(
        &self,
        handle: &ConnectionHandle,
        parameter: &str,
        value: f64,
        wait_for_stable: bool,
    ) -> Result<()>;
}

// =============================================================================
// Capturable - Acquire a measurement
// =============================================================================

/// Capability: Acquire one measurement
///
/// Captures are not idempotent. They are never retried automatically.
#[async_trait]
pub trait Capturable: Send + Sync {
    /// Acquire one measurement and return its named sample vectors.
    async fn capture(&self, handle: &ConnectionHandle, params: &CaptureParams) -> Result<Samples>;
}
