//! Instrument drivers.
//!
//! Drivers implement the capability traits in [`capabilities`]; an
//! [`InstrumentEngine`](crate::engine::InstrumentEngine) turns them into an
//! engine for one role. [`mock`] holds simulated instruments with fault
//! injection for demo runs and tests, and [`registry`] builds engines from
//! the configured instrument list.

pub mod capabilities;
pub mod mock;
pub mod registry;

pub use capabilities::{Capturable, Connectable, ConnectionHandle, Queryable, Settable};
