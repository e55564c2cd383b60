//! Driver Registry
//!
//! Turns `[[instruments]]` entries from the configuration into engines
//! registered with an [`EngineDispatcher`] under their role.
//!
//! # Known Drivers
//!
//! | Type | Driver | Operations |
//! |------|--------|------------|
//! | `simulated_source` | [`SimulatedSource`] | connect, query, capture |
//! | `simulated_controller` | [`SimulatedController`] | connect, query, set |
//!
//! # Example Configuration
//!
//! ```toml
//! [[instruments]]
//! role = "temperature-control"
//! type = "simulated_controller"
//! settings = { parameter = "temperature", initial = 300.0, settle_ms = 50 }
//! ```

use std::sync::Arc;
use tokio::time::Duration;
use tracing::info;

use crate::config::{DaqConfig, InstrumentDefinition};
use crate::engine::{DispatchPolicy, Engine, EngineDispatcher, InstrumentEngine, OperationKind};
use crate::error::{AppResult, DaqError};
use crate::hardware::mock::{SimulatedController, SimulatedSource};

/// Driver configuration for instantiating an instrument
#[derive(Debug, Clone, PartialEq)]
pub enum DriverType {
    /// Simulated THz source/detector
    SimulatedSource {
        /// Samples per trace
        points: usize,
        /// Time each capture takes
        capture_delay: Duration,
    },

    /// Simulated setpoint controller
    SimulatedController {
        /// Identity string reported by the controller
        identity: String,
        /// Name of the settable parameter
        parameter: String,
        /// Initial parameter value
        initial: f64,
        /// Settle time for stabilising sets
        settle_time: Duration,
    },
}

impl DriverType {
    /// Parse the driver type and settings of a configured instrument.
    pub fn from_definition(definition: &InstrumentDefinition) -> AppResult<Self> {
        let millis = |key: &str| {
            Duration::from_millis(definition.setting_f64(key).unwrap_or(0.0).max(0.0) as u64)
        };
        match definition.r#type.as_str() {
            "simulated_source" => Ok(DriverType::SimulatedSource {
                points: definition.setting_f64("points").unwrap_or(128.0).max(2.0) as usize,
                capture_delay: millis("capture_delay_ms"),
            }),
            "simulated_controller" => Ok(DriverType::SimulatedController {
                identity: definition
                    .setting_str("identity")
                    .map_or_else(|| format!("Simulated {}", definition.role), str::to_string),
                parameter: definition
                    .setting_str("parameter")
                    .unwrap_or(definition.role.as_str())
                    .to_string(),
                initial: definition.setting_f64("initial").unwrap_or(0.0),
                settle_time: millis("settle_ms"),
            }),
            other => Err(DaqError::Configuration(format!(
                "Unknown instrument type '{}' for role '{}'",
                other, definition.role
            ))),
        }
    }

    /// Operations the driver provides
    pub fn operations(&self) -> Vec<OperationKind> {
        match self {
            DriverType::SimulatedSource { .. } => vec![
                OperationKind::Connect,
                OperationKind::Disconnect,
                OperationKind::Query,
                OperationKind::Capture,
            ],
            DriverType::SimulatedController { .. } => vec![
                OperationKind::Connect,
                OperationKind::Disconnect,
                OperationKind::Query,
                OperationKind::Set,
            ],
        }
    }

    /// Get driver type name
    pub fn driver_name(&self) -> &'static str {
        match self {
            DriverType::SimulatedSource { .. } => "simulated_source",
            DriverType::SimulatedController { .. } => "simulated_controller",
        }
    }

    /// Instantiate the driver and wrap it in an engine for `role`.
    pub fn build_engine(&self, role: &str) -> Arc<dyn Engine> {
        match self {
            DriverType::SimulatedSource {
                points,
                capture_delay,
            } => {
                let driver = Arc::new(
                    SimulatedSource::new()
                        .with_points(*points)
                        .with_capture_delay(*capture_delay),
                );
                Arc::new(
                    InstrumentEngine::new(role, driver.clone())
                        .with_query(driver.clone())
                        .with_capture(driver),
                )
            }
            DriverType::SimulatedController {
                identity,
                parameter,
                initial,
                settle_time,
            } => {
                let driver = Arc::new(
                    SimulatedController::new(identity)
                        .with_parameter(parameter, *initial)
                        .with_settle_time(*settle_time),
                );
                Arc::new(
                    InstrumentEngine::new(role, driver.clone())
                        .with_query(driver.clone())
                        .with_set(driver),
                )
            }
        }
    }
}

/// Instruments used when the configuration declares none: a THz source and
/// temperature and field controllers.
pub fn default_instruments() -> Vec<InstrumentDefinition> {
    let controller = |role: &str, parameter: &str, initial: f64| {
        let mut settings = toml::Table::new();
        settings.insert("parameter".into(), parameter.into());
        settings.insert("initial".into(), initial.into());
        InstrumentDefinition {
            role: role.to_string(),
            r#type: "simulated_controller".to_string(),
            address: None,
            enabled: true,
            settings,
        }
    };
    vec![
        InstrumentDefinition {
            role: "source".to_string(),
            r#type: "simulated_source".to_string(),
            address: None,
            enabled: true,
            settings: toml::Table::new(),
        },
        controller("temperature-control", "temperature", 300.0),
        controller("field-control", "field", 0.0),
    ]
}

/// Build a dispatcher with every enabled instrument registered.
///
/// # Errors
///
/// Configuration error for unknown driver types or duplicate roles.
pub fn build_dispatcher(config: &DaqConfig) -> AppResult<EngineDispatcher> {
    let mut dispatcher = EngineDispatcher::new(DispatchPolicy::from_config(&config.dispatcher));
    let defaults;
    let instruments: Vec<&InstrumentDefinition> = if config.instruments.is_empty() {
        defaults = default_instruments();
        defaults.iter().collect()
    } else {
        config.enabled_instruments()
    };

    for definition in instruments {
        let driver = DriverType::from_definition(definition)?;
        info!(
            role = %definition.role,
            driver = driver.driver_name(),
            "Registering instrument"
        );
        dispatcher.register(&definition.role, driver.build_engine(&definition.role))?;
    }
    Ok(dispatcher)
}
