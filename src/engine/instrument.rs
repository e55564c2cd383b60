//! Capability-backed engine for one instrument role.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Engine, EngineOutput, EngineTask, Operation, OperationKind};
use crate::error::{AppResult, DaqError};
use crate::hardware::capabilities::{
    Capturable, Connectable, ConnectionHandle, Queryable, Settable,
};

/// Engine built from an instrument's capability implementations.
///
/// Registration is explicit: the supported operations are exactly the
/// capabilities handed to the builder.
///
/// # Example
///
/// ```rust,ignore
/// let source = Arc::new(SimulatedSource::new());
/// let engine = InstrumentEngine::new("source", source.clone())
///     .with_query(source.clone())
///     .with_capture(source);
/// ```
pub struct InstrumentEngine {
    role: String,
    connectable: Arc<dyn Connectable>,
    queryable: Option<Arc<dyn Queryable>>,
    settable: Option<Arc<dyn Settable>>,
    capturable: Option<Arc<dyn Capturable>>,
    handle: Mutex<Option<ConnectionHandle>>,
}

impl InstrumentEngine {
    /// Engine for `role` with session management only.
    pub fn new(role: impl Into<String>, connectable: Arc<dyn Connectable>) -> Self {
        Self {
            role: role.into(),
            connectable,
            queryable: None,
            settable: None,
            capturable: None,
            handle: Mutex::new(None),
        }
    }

    /// Enable query operations.
    pub fn with_query(mut self, queryable: Arc<dyn Queryable>) -> Self {
        self.queryable = Some(queryable);
        self
    }

    /// Enable set operations.
    pub fn with_set(mut self, settable: Arc<dyn Settable>) -> Self {
        self.settable = Some(settable);
        self
    }

    /// Enable capture operations.
    pub fn with_capture(mut self, capturable: Arc<dyn Capturable>) -> Self {
        self.capturable = Some(capturable);
        self
    }

    /// Role this engine serves.
    pub fn role(&self) -> &str {
        &self.role
    }

    /// Whether a session is open.
    pub async fn is_connected(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    async fn current_handle(&self) -> AppResult<ConnectionHandle> {
        self.handle
            .lock()
            .await
            .clone()
            .ok_or_else(|| DaqError::connection(&self.role, "not connected"))
    }

    fn unsupported(&self, operation: OperationKind) -> DaqError {
        DaqError::UnsupportedOperation {
            role: self.role.clone(),
            operation,
        }
    }
}

#[async_trait]
impl Engine for InstrumentEngine {
    fn supported_operations(&self) -> BTreeSet<OperationKind> {
        let mut ops = BTreeSet::from([OperationKind::Connect, OperationKind::Disconnect]);
        if self.queryable.is_some() {
            ops.insert(OperationKind::Query);
        }
        if self.settable.is_some() {
            ops.insert(OperationKind::Set);
        }
        if self.capturable.is_some() {
            ops.insert(OperationKind::Capture);
        }
        ops
    }

    fn describe(&self) -> BTreeMap<String, String> {
        self.connectable.describe()
    }

    async fn execute(&self, task: &EngineTask) -> AppResult<EngineOutput> {
        match &task.operation {
            Operation::Connect => {
                let mut slot = self.handle.lock().await;
                if let Some(handle) = slot.as_ref() {
                    return Ok(EngineOutput::Connected {
                        identity: handle.identity.clone(),
                    });
                }
                let handle = self
                    .connectable
                    .connect()
                    .await
                    .map_err(|e| DaqError::connection(&self.role, format!("{:#}", e)))?;
                debug!(role = %self.role, session = handle.session, "Connected");
                let identity = handle.identity.clone();
                *slot = Some(handle);
                Ok(EngineOutput::Connected { identity })
            }
            Operation::Disconnect => {
                let taken = self.handle.lock().await.take();
                if let Some(handle) = taken {
                    self.connectable
                        .disconnect(&handle)
                        .await
                        .map_err(|e| DaqError::connection(&self.role, format!("{:#}", e)))?;
                    debug!(role = %self.role, session = handle.session, "Disconnected");
                }
                Ok(EngineOutput::Disconnected)
            }
            Operation::Query { parameter } => {
                let queryable = self
                    .queryable
                    .as_ref()
                    .ok_or_else(|| self.unsupported(OperationKind::Query))?;
                let handle = self.current_handle().await?;
                let value = queryable
                    .query(&handle, parameter)
                    .await
                    .map_err(|e| DaqError::acquisition(&self.role, format!("{:#}", e)))?;
                Ok(EngineOutput::Value(value))
            }
            Operation::Set {
                parameter,
                value,
                wait_for_stable,
            } => {
                let settable = self
                    .settable
                    .as_ref()
                    .ok_or_else(|| self.unsupported(OperationKind::Set))?;
                let handle = self.current_handle().await?;
                settable
                    .set(&handle, parameter, *value, *wait_for_stable)
                    .await
                    .map_err(|e| DaqError::acquisition(&self.role, format!("{:#}", e)))?;
                Ok(EngineOutput::Ack)
            }
            Operation::Capture { params } => {
                let capturable = self
                    .capturable
                    .as_ref()
                    .ok_or_else(|| self.unsupported(OperationKind::Capture))?;
                let handle = self.current_handle().await?;
                let samples = capturable
                    .capture(&handle, params)
                    .await
                    .map_err(|e| DaqError::acquisition(&self.role, format!("{:#}", e)))?;
                Ok(EngineOutput::Samples(samples))
            }
        }
    }
}
