//! # TeraDAQ Core Library
//!
//! Experiment execution engine for THz spectroscopy sweeps. A run steps
//! through a multi-dimensional sweep (temperature, magnetic field, repeat
//! count), drives the instruments at every point, and persists one record
//! per point as soon as it is acquired. Runs can be paused, resumed,
//! stopped, and continued after an error or a process restart without
//! losing or duplicating points.
//!
//! ## Crate Structure
//!
//! - **`experiment`**: sweep definition, point resolver, run state machine,
//!   status snapshots and the Runner control loop.
//! - **`engine`**: engine tasks, the capability-backed instrument engine and
//!   the dispatcher that routes tasks by role with timeouts and retry.
//! - **`hardware`**: capability traits for instrument drivers plus simulated
//!   instruments.
//! - **`data`**: incremental run persistence (JSON-lines, optional HDF5).
//! - **`config`**: layered configuration (defaults, TOML file, environment).
//! - **`error`**: the `DaqError` enum and its failure classes.
//! - **`error_recovery`**: retry with exponential backoff.
//! - **`tracing_setup`**: structured logging initialisation.

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
pub mod tracing_setup;

pub use error::{AppResult, DaqError, ErrorKind};
