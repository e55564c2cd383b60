//! Engine Dispatcher: role routing, timeouts and connection retry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{Engine, EngineOutput, EngineTask, OperationKind};
use crate::config::DispatcherConfig;
use crate::error::{AppResult, DaqError};
use crate::error_recovery::{retry_with_backoff, RetryPolicy};

/// Timeout and retry policy applied to every dispatched task.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchPolicy {
    /// Bound for operations without a more specific entry.
    pub default_timeout: Duration,
    /// Bound per operation kind.
    pub operation_timeouts: HashMap<OperationKind, Duration>,
    /// Capture bound per instrument role; takes precedence over the per-kind bound.
    pub role_timeouts: HashMap<String, Duration>,
    /// Retry policy for connect operations. Nothing else is retried.
    pub connect_retry: RetryPolicy,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(10),
            operation_timeouts: HashMap::from([
                (OperationKind::Connect, Duration::from_secs(5)),
                (OperationKind::Capture, Duration::from_secs(60)),
            ]),
            role_timeouts: HashMap::new(),
            connect_retry: RetryPolicy::default(),
        }
    }
}

impl DispatchPolicy {
    /// Runtime policy from the `[dispatcher]` configuration section.
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            operation_timeouts: HashMap::from([
                (
                    OperationKind::Connect,
                    Duration::from_millis(config.connect_timeout_ms),
                ),
                (
                    OperationKind::Capture,
                    Duration::from_millis(config.capture_timeout_ms),
                ),
            ]),
            role_timeouts: config
                .role_timeouts_ms
                .iter()
                .map(|(role, ms)| (role.clone(), Duration::from_millis(*ms)))
                .collect(),
            connect_retry: config.connect_retry.to_policy(),
        }
    }

    /// Bound for `task`: explicit task timeout, then per-role capture bound,
    /// then per-kind bound, then the default.
    pub fn timeout_for(&self, task: &EngineTask) -> Duration {
        if let Some(timeout) = task.timeout {
            return timeout;
        }
        let kind = task.kind();
        if kind == OperationKind::Capture {
            if let Some(timeout) = self.role_timeouts.get(&task.role) {
                return *timeout;
            }
        }
        self.operation_timeouts
            .get(&kind)
            .copied()
            .unwrap_or(self.default_timeout)
    }
}

type EngineMap = HashMap<String, Arc<dyn Engine>>;

fn lookup(engines: &EngineMap, task: &EngineTask) -> AppResult<Arc<dyn Engine>> {
    let engine = engines
        .get(&task.role)
        .cloned()
        .ok_or_else(|| DaqError::UnknownRole(task.role.clone()))?;
    if !engine.supports(task.kind()) {
        return Err(DaqError::UnsupportedOperation {
            role: task.role.clone(),
            operation: task.kind(),
        });
    }
    Ok(engine)
}

async fn run_bounded(
    engine: &dyn Engine,
    task: &EngineTask,
    timeout: Duration,
) -> AppResult<EngineOutput> {
    match tokio::time::timeout(timeout, engine.execute(task)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(
                role = %task.role,
                operation = %task.kind(),
                timeout_ms = timeout.as_millis() as u64,
                "Operation timed out"
            );
            Err(DaqError::Timeout {
                role: task.role.clone(),
                operation: task.kind(),
                timeout,
            })
        }
    }
}

/// Routes tasks to engines by instrument role.
///
/// Owned by the Runner for the lifetime of a session; observers get a
/// [`ReadOnlyDispatcher`] instead.
pub struct EngineDispatcher {
    engines: EngineMap,
    policy: DispatchPolicy,
}

impl EngineDispatcher {
    /// Empty dispatcher with `policy`.
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            engines: HashMap::new(),
            policy,
        }
    }

    /// Register `engine` for `role`.
    ///
    /// # Errors
    ///
    /// Configuration error if the role is already registered.
    pub fn register(&mut self, role: impl Into<String>, engine: Arc<dyn Engine>) -> AppResult<()> {
        let role = role.into();
        if self.engines.contains_key(&role) {
            return Err(DaqError::Configuration(format!(
                "Role '{}' is already registered",
                role
            )));
        }
        info!(role = %role, operations = ?engine.supported_operations(), "Registered engine");
        self.engines.insert(role, engine);
        Ok(())
    }

    /// Registered roles, sorted.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self.engines.keys().cloned().collect();
        roles.sort();
        roles
    }

    /// Whether `role` has an engine that supports `operation`.
    pub fn supports(&self, role: &str, operation: OperationKind) -> bool {
        self.engines
            .get(role)
            .is_some_and(|engine| engine.supports(operation))
    }

    /// Driver description of `role`.
    pub fn describe(&self, role: &str) -> AppResult<BTreeMap<String, String>> {
        self.engines
            .get(role)
            .map(|engine| engine.describe())
            .ok_or_else(|| DaqError::UnknownRole(role.to_string()))
    }

    /// Active policy.
    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    /// Execute `task` on its role's engine.
    ///
    /// Every task is bounded by the policy timeout, surfacing
    /// [`DaqError::Timeout`] when exceeded. Connect tasks are retried with
    /// bounded exponential backoff; a connect that times out counts as a
    /// connection failure. All other operations run exactly once.
    #[instrument(skip(self, task), fields(role = %task.role, operation = %task.kind()), err)]
    pub async fn dispatch(&self, task: EngineTask) -> AppResult<EngineOutput> {
        let engine = lookup(&self.engines, &task)?;
        let timeout = self.policy.timeout_for(&task);

        if task.kind() != OperationKind::Connect {
            return run_bounded(engine.as_ref(), &task, timeout).await;
        }

        let label = format!("connect {}", task.role);
        retry_with_backoff(&self.policy.connect_retry, &label, || {
            let engine = Arc::clone(&engine);
            let task = task.clone();
            async move {
                run_bounded(engine.as_ref(), &task, timeout)
                    .await
                    .map_err(|err| match err {
                        DaqError::Timeout { role, timeout, .. } => DaqError::connection(
                            role,
                            format!("connect timed out after {:?}", timeout),
                        ),
                        other => other,
                    })
            }
        })
        .await
    }

    /// Query-only view sharing the registered engines.
    ///
    /// Engines registered after this call are not visible through the view.
    pub fn read_only(&self) -> ReadOnlyDispatcher {
        ReadOnlyDispatcher {
            engines: Arc::new(self.engines.clone()),
            policy: Arc::new(self.policy.clone()),
        }
    }
}

/// Dispatcher view that can only query.
///
/// Safe to use concurrently with the Runner (trend displays, temperature
/// logging) because it never issues a mutating command. Queries only succeed
/// while the Runner holds the instrument's session.
#[derive(Clone)]
pub struct ReadOnlyDispatcher {
    engines: Arc<EngineMap>,
    policy: Arc<DispatchPolicy>,
}

impl ReadOnlyDispatcher {
    /// Execute a query task.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` for any non-query task.
    pub async fn dispatch(&self, task: EngineTask) -> AppResult<EngineOutput> {
        let operation = task.kind();
        if operation.is_mutating() {
            return Err(DaqError::UnsupportedOperation {
                role: task.role,
                operation,
            });
        }
        let engine = lookup(&self.engines, &task)?;
        run_bounded(engine.as_ref(), &task, self.policy.timeout_for(&task)).await
    }

    /// Read `parameter` on `role`.
    pub async fn query(&self, role: &str, parameter: &str) -> AppResult<serde_json::Value> {
        match self.dispatch(EngineTask::query(role, parameter)).await? {
            EngineOutput::Value(value) => Ok(value),
            other => Err(DaqError::acquisition(
                role,
                format!("unexpected query result {:?}", other),
            )),
        }
    }

    /// Driver description of `role`.
    pub fn describe(&self, role: &str) -> AppResult<BTreeMap<String, String>> {
        self.engines
            .get(role)
            .map(|engine| engine.describe())
            .ok_or_else(|| DaqError::UnknownRole(role.to_string()))
    }

    /// Roles that answer queries, sorted.
    pub fn roles(&self) -> Vec<String> {
        let mut roles: Vec<String> = self
            .engines
            .iter()
            .filter(|(_, engine)| engine.supports(OperationKind::Query))
            .map(|(role, _)| role.clone())
            .collect();
        roles.sort();
        roles
    }
}
