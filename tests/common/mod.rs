//! Shared rig for Runner integration tests: simulated instruments, a
//! dispatcher over them and a temporary run store.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tera_daq::config::RunnerConfig;
use tera_daq::data::run_store::JsonLinesStore;
use tera_daq::data::RunStore;
use tera_daq::engine::{DispatchPolicy, EngineDispatcher, InstrumentEngine};
use tera_daq::error_recovery::RetryPolicy;
use tera_daq::experiment::{CaptureTarget, RunnerHandle, SweepAxis, SweepConfig};
use tera_daq::hardware::mock::{SimulatedController, SimulatedSource};

pub const SOURCE: &str = "source";
pub const TEMPERATURE: &str = "temperature-control";
pub const FIELD: &str = "field-control";

/// Simulated source plus temperature and field controllers.
pub struct Instruments {
    pub source: Arc<SimulatedSource>,
    pub temperature: Arc<SimulatedController>,
    pub field: Arc<SimulatedController>,
}

impl Instruments {
    pub fn new(source: SimulatedSource) -> Self {
        Self::with_controllers(
            source,
            SimulatedController::new("Simulated Mercury iTC").with_parameter("temperature", 300.0),
            SimulatedController::new("Simulated Mercury iPS").with_parameter("field", 0.0),
        )
    }

    pub fn with_controllers(
        source: SimulatedSource,
        temperature: SimulatedController,
        field: SimulatedController,
    ) -> Self {
        Self {
            source: Arc::new(source),
            temperature: Arc::new(temperature),
            field: Arc::new(field),
        }
    }

    pub fn dispatcher(&self, policy: DispatchPolicy) -> EngineDispatcher {
        let mut dispatcher = EngineDispatcher::new(policy);
        dispatcher
            .register(
                SOURCE,
                Arc::new(
                    InstrumentEngine::new(SOURCE, self.source.clone())
                        .with_query(self.source.clone())
                        .with_capture(self.source.clone()),
                ),
            )
            .unwrap();
        for (role, controller) in [(TEMPERATURE, &self.temperature), (FIELD, &self.field)] {
            dispatcher
                .register(
                    role,
                    Arc::new(
                        InstrumentEngine::new(role, controller.clone())
                            .with_query(controller.clone())
                            .with_set(controller.clone()),
                    ),
                )
                .unwrap();
        }
        dispatcher
    }
}

/// Default policy with millisecond connect backoff.
pub fn fast_policy() -> DispatchPolicy {
    DispatchPolicy {
        connect_retry: RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(4),
        },
        ..DispatchPolicy::default()
    }
}

pub fn store(root: &Path) -> Arc<dyn RunStore> {
    Arc::new(JsonLinesStore::new(root, false))
}

pub fn spawn_runner(instruments: &Instruments, root: &Path, policy: DispatchPolicy) -> RunnerHandle {
    RunnerHandle::spawn(
        instruments.dispatcher(policy),
        store(root),
        &RunnerConfig::default(),
    )
    .unwrap()
}

pub fn temp_root() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// The single run container under `root`.
pub fn run_dir(root: &Path) -> PathBuf {
    let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_dir())
        .collect();
    assert_eq!(dirs.len(), 1, "expected exactly one run under {:?}", root);
    dirs.remove(0)
}

/// Nested temperature × field sweep capturing one THz trace per point.
pub fn temperature_field_sweep(temperatures: Vec<f64>, fields: Vec<f64>) -> SweepConfig {
    SweepConfig::nested(vec![
        SweepAxis::new("temperature", "K", temperatures).targeting(TEMPERATURE, "temperature"),
        SweepAxis::new("field", "T", fields).targeting(FIELD, "field"),
    ])
    .unwrap()
    .with_capture(CaptureTarget::new("thz", SOURCE).with_param("points", serde_json::json!(16)))
}

/// `n` repeated captures with no axis targets.
pub fn repeat_sweep(n: usize) -> SweepConfig {
    SweepConfig::nested(vec![SweepAxis::count(n)])
        .unwrap()
        .with_capture(CaptureTarget::new("thz", SOURCE).with_param("points", serde_json::json!(16)))
}

/// Flatten the single-valued counter channel.
pub fn counters(channel: Vec<Vec<f64>>) -> Vec<u64> {
    channel.into_iter().map(|v| v[0] as u64).collect()
}
