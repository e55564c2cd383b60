//! Runner: the control loop that owns an experiment.
//!
//! The Runner executes on a dedicated `experiment-runner` thread with its own
//! single-threaded tokio runtime, so slow instrument calls never stall the
//! thread serving observers. Callers interact with it only through a
//! [`RunnerHandle`]:
//!
//! - commands (`start`, `pause`, `resume`, `stop`, `acknowledge`, `continue_run`,
//!   `continue_from`) travel over an mpsc channel and are answered on a oneshot;
//! - [`StatusSnapshot`]s are published on a broadcast channel (slow subscribers
//!   lag, the Runner never waits) and the latest value on a watch channel;
//! - a [`ReadOnlyDispatcher`] allows concurrent queries for trend displays.
//!
//! Commands are applied only at the loop boundary between points, never while
//! an instrument operation is in flight. Per point the loop:
//!
//! 1. sets every targeted axis whose value changed since the last applied point
//! 2. waits the dwell time
//! 3. queries the readbacks, then runs the captures
//! 4. appends the [`DataRecord`] durably and replaces the checkpoint
//! 5. publishes a snapshot and advances
//!
//! Any failure moves the run to ERROR with everything written so far intact.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

use crate::config::RunnerConfig;
use crate::data::{RunStore, RunWriter};
use crate::engine::{EngineDispatcher, EngineOutput, EngineTask, OperationKind, ReadOnlyDispatcher};
use crate::error::{AppResult, DaqError};
use crate::experiment::record::{DataRecord, RunDescription, RunMetadata};
use crate::experiment::resolver::{Coordinate, SweepResolver};
use crate::experiment::state::{
    Checkpoint, ExperimentState, RunStatus, StateMachine, Transition,
};
use crate::experiment::status::{ErrorReport, StatusSnapshot};
use crate::experiment::sweep::SweepConfig;

/// Query issued on every role at run start to record its identity.
pub const IDENTIFY_PARAMETER: &str = "identify";

/// A sweep plus who runs it and why.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// What to measure
    pub sweep: SweepConfig,
    /// Operator and free-text provenance
    pub description: RunDescription,
}

impl RunRequest {
    /// Request with an empty description.
    pub fn new(sweep: SweepConfig) -> Self {
        Self {
            sweep,
            description: RunDescription::default(),
        }
    }

    /// Attach a description.
    pub fn with_description(mut self, description: RunDescription) -> Self {
        self.description = description;
        self
    }
}

type Reply<T> = oneshot::Sender<AppResult<T>>;

enum Command {
    Start { request: RunRequest, reply: Reply<String> },
    Pause(Reply<()>),
    Resume(Reply<()>),
    Stop(Reply<()>),
    Acknowledge(Reply<()>),
    Continue { from: Option<PathBuf>, reply: Reply<String> },
    Shutdown,
}

/// Publishes snapshots to both channels.
struct StatusPublisher {
    events: broadcast::Sender<StatusSnapshot>,
    latest: watch::Sender<StatusSnapshot>,
}

impl StatusPublisher {
    fn publish(&self, snapshot: StatusSnapshot) {
        // No subscribers is fine
        let _ = self.events.send(snapshot.clone());
        self.latest.send_replace(snapshot);
    }
}

/// The run owned by the Runner.
struct Experiment {
    metadata: RunMetadata,
    resolver: SweepResolver,
    machine: StateMachine,
    status: RunStatus,
    writer: Option<Box<dyn RunWriter>>,
    location: Option<PathBuf>,
    last_completed: Option<usize>,
    last_coordinate: Option<Coordinate>,
    /// Value last applied per axis since the most recent (re)start or resume
    applied: Vec<Option<f64>>,
    last_error: Option<ErrorReport>,
    started_at: DateTime<Utc>,
}

impl Experiment {
    fn new(metadata: RunMetadata, resolver: SweepResolver) -> Self {
        let axes = metadata.sweep.axes().len();
        Self {
            metadata,
            resolver,
            machine: StateMachine::new(),
            status: RunStatus::Running,
            writer: None,
            location: None,
            last_completed: None,
            last_coordinate: None,
            applied: vec![None; axes],
            last_error: None,
            started_at: Utc::now(),
        }
    }

    fn run_id(&self) -> &str {
        &self.metadata.run_id
    }

    fn state(&self) -> ExperimentState {
        self.machine.state()
    }

    fn next_index(&self) -> usize {
        self.last_completed.map_or(0, |i| i + 1)
    }

    fn set_last_completed(&mut self, index: Option<usize>) {
        self.last_completed = index;
        self.last_coordinate = index.and_then(|i| self.resolver.coordinate_at(i));
    }

    fn reset_applied(&mut self) {
        self.applied.iter_mut().for_each(|v| *v = None);
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            run_id: Some(self.metadata.run_id.clone()),
            state: self.state(),
            index: self.last_completed,
            coordinate: self.last_coordinate.clone(),
            completed_points: self.next_index(),
            total_points: self.resolver.len(),
            last_error: self.last_error.clone(),
            timestamp: Utc::now(),
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint::new(&self.metadata.run_id, self.state(), self.resolver.len())
            .with_status(self.status)
            .with_last_completed(self.last_completed)
            .with_error(self.last_error.clone())
    }

    fn save_checkpoint(&mut self) -> AppResult<()> {
        let checkpoint = self.checkpoint();
        match self.writer.as_mut() {
            Some(writer) => writer.write_checkpoint(&checkpoint),
            None => Ok(()),
        }
    }

    /// Write a final checkpoint and close the container, logging failures.
    fn close_writer(&mut self) {
        let checkpoint = self.checkpoint();
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.write_checkpoint(&checkpoint) {
                warn!(run_id = %self.metadata.run_id, error = %e, "Failed to write final checkpoint");
            }
            if let Err(e) = writer.close() {
                warn!(run_id = %self.metadata.run_id, error = %e, "Failed to close run container");
            }
        }
    }
}

/// Execute every operation for one point and build its record.
///
/// Operations are issued one at a time; nothing runs concurrently for a point.
async fn acquire_point(
    dispatcher: &EngineDispatcher,
    exp: &mut Experiment,
    index: usize,
    coordinate: &[f64],
) -> AppResult<DataRecord> {
    let sweep = &exp.metadata.sweep;

    for (k, (axis, value)) in sweep.axes().iter().zip(coordinate).enumerate() {
        if let Some(wait) = axis.wait_for(*value) {
            tokio::time::sleep(wait).await;
            continue;
        }
        if exp.applied[k] == Some(*value) {
            continue;
        }
        if let Some(target) = &axis.target {
            dispatcher
                .dispatch(EngineTask::set(
                    &target.role,
                    &target.parameter,
                    *value,
                    target.wait_for_stable,
                ))
                .await?;
        }
        exp.applied[k] = Some(*value);
    }

    let dwell = sweep.dwell();
    if !dwell.is_zero() {
        tokio::time::sleep(dwell).await;
    }

    let mut channels = BTreeMap::new();
    for readback in sweep.readbacks() {
        let value = dispatcher
            .dispatch(EngineTask::query(&readback.role, &readback.parameter))
            .await?
            .as_f64()
            .ok_or_else(|| {
                DaqError::acquisition(
                    &readback.role,
                    format!("readback '{}' is not numeric", readback.parameter),
                )
            })?;
        channels.insert(readback.channel.clone(), vec![value]);
    }

    for capture in sweep.captures() {
        let samples = dispatcher
            .dispatch(EngineTask::capture(&capture.role, capture.params.clone()))
            .await?
            .into_samples()
            .ok_or_else(|| DaqError::acquisition(&capture.role, "capture returned no samples"))?;
        for (name, values) in samples {
            channels.insert(format!("{}.{}", capture.name, name), values);
        }
    }

    Ok(DataRecord::new(index, coordinate.to_vec(), channels))
}

/// Append `record` durably, then advance and checkpoint.
fn persist(exp: &mut Experiment, record: DataRecord) -> AppResult<()> {
    let writer = exp
        .writer
        .as_mut()
        .ok_or_else(|| DaqError::Persistence("Run container is not open".into()))?;
    writer.append(&record)?;
    exp.last_completed = Some(record.index);
    exp.last_coordinate = Some(record.coordinate);
    exp.save_checkpoint()
}

struct Runner {
    dispatcher: EngineDispatcher,
    store: Arc<dyn RunStore>,
    commands: mpsc::UnboundedReceiver<Command>,
    publisher: StatusPublisher,
    experiment: Option<Experiment>,
    connected: BTreeSet<String>,
}

impl Runner {
    fn state(&self) -> ExperimentState {
        self.experiment
            .as_ref()
            .map_or(ExperimentState::Idle, Experiment::state)
    }

    fn publish(&self) {
        let snapshot = self
            .experiment
            .as_ref()
            .map_or_else(StatusSnapshot::idle, Experiment::snapshot);
        self.publisher.publish(snapshot);
    }

    /// Run the control loop until shutdown or until every handle is gone.
    async fn run(mut self) {
        info!("Runner starting");
        loop {
            let command = if self.state() == ExperimentState::Running {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => {
                        self.step().await;
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => None,
                }
            } else {
                self.commands.recv().await
            };

            match command {
                Some(command) => {
                    if !self.process_command(command).await {
                        break;
                    }
                }
                None => break,
            }
        }
        info!("Runner shutting down");
        self.shutdown().await;
    }

    /// Process a command. Returns false if shutdown requested.
    async fn process_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start { request, reply } => {
                let result = self.start(request).await;
                let _ = reply.send(result);
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Acknowledge(reply) => {
                let result = self.acknowledge().await;
                let _ = reply.send(result);
            }
            Command::Continue { from, reply } => {
                let result = self.continue_run(from).await;
                let _ = reply.send(result);
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn rejected(&self, to: ExperimentState) -> DaqError {
        DaqError::IllegalTransition {
            from: self.state(),
            to,
        }
    }

    fn experiment_mut(&mut self, to: ExperimentState) -> AppResult<&mut Experiment> {
        let from = self.state();
        self.experiment
            .as_mut()
            .ok_or(DaqError::IllegalTransition { from, to })
    }

    /// Every role the sweep touches must be registered with the needed operation.
    fn check_roles(&self, sweep: &SweepConfig) -> AppResult<()> {
        let require = |role: &str, operation: OperationKind| {
            if self.dispatcher.supports(role, operation) {
                Ok(())
            } else {
                Err(DaqError::Configuration(format!(
                    "Role '{}' has no engine supporting {}",
                    role, operation
                )))
            }
        };
        for axis in sweep.axes() {
            if let Some(target) = &axis.target {
                require(&target.role, OperationKind::Set)?;
            }
        }
        for capture in sweep.captures() {
            require(&capture.role, OperationKind::Capture)?;
        }
        for readback in sweep.readbacks() {
            require(&readback.role, OperationKind::Query)?;
        }
        Ok(())
    }

    async fn start(&mut self, request: RunRequest) -> AppResult<String> {
        let state = self.state();
        if !state.can_begin() {
            return Err(self.rejected(ExperimentState::Running));
        }
        let resolver = SweepResolver::new(&request.sweep)?;
        self.check_roles(&request.sweep)?;

        let metadata = RunMetadata::new(request.sweep, request.description, resolver.len());
        info!(
            run_id = %metadata.run_id,
            points = resolver.len(),
            axes = ?metadata.axes,
            "Sweep accepted"
        );
        self.experiment = Some(Experiment::new(metadata, resolver));
        self.begin().await
    }

    async fn continue_run(&mut self, from: Option<PathBuf>) -> AppResult<String> {
        match from {
            None => {
                let retained = self
                    .experiment
                    .as_ref()
                    .is_some_and(|exp| exp.state() == ExperimentState::Idle);
                if !retained {
                    return Err(self.rejected(ExperimentState::Running));
                }
            }
            Some(location) => {
                if !self.state().can_begin() {
                    return Err(self.rejected(ExperimentState::Running));
                }
                let writer = self.store.reopen(&location)?;
                if let Some(checkpoint) = writer.checkpoint() {
                    if !checkpoint.status.is_resumable() {
                        return Err(DaqError::Configuration(format!(
                            "Run {} is already {:?}",
                            checkpoint.run_id, checkpoint.status
                        )));
                    }
                }
                let metadata = writer.metadata().clone();
                let resolver = SweepResolver::new(&metadata.sweep)?;
                self.check_roles(&metadata.sweep)?;

                let mut exp = Experiment::new(metadata, resolver);
                exp.set_last_completed(writer.last_index());
                exp.location = Some(location);
                exp.writer = Some(writer);
                self.experiment = Some(exp);
            }
        }
        self.begin().await
    }

    /// IDLE → RUNNING, then take the instruments and open the container.
    async fn begin(&mut self) -> AppResult<String> {
        let exp = self.experiment_mut(ExperimentState::Running)?;
        exp.machine.apply(Transition::Start)?;
        exp.status = RunStatus::Running;
        exp.last_error = None;
        exp.reset_applied();
        let run_id = exp.run_id().to_string();
        info!(run_id = %run_id, next_index = exp.next_index(), "Run starting");
        self.publish();

        if let Err(err) = self.acquire_instruments().await {
            self.fail(&err, None);
            return Ok(run_id);
        }
        if let Err(err) = self.open_writer() {
            self.fail(&err, None);
            return Err(err);
        }
        self.publish();
        Ok(run_id)
    }

    /// Connect every involved role and record identities for a fresh run.
    async fn acquire_instruments(&mut self) -> AppResult<()> {
        let roles = match self.experiment.as_ref() {
            Some(exp) => exp.metadata.sweep.roles(),
            None => return Ok(()),
        };

        let mut identities = BTreeMap::new();
        for role in roles {
            let output = self.dispatcher.dispatch(EngineTask::connect(&role)).await?;
            self.connected.insert(role.clone());

            let mut identity = match output {
                EngineOutput::Connected { identity } => identity,
                _ => String::new(),
            };
            if self.dispatcher.supports(&role, OperationKind::Query) {
                match self
                    .dispatcher
                    .dispatch(EngineTask::query(&role, IDENTIFY_PARAMETER))
                    .await
                {
                    Ok(EngineOutput::Value(serde_json::Value::String(s))) => identity = s,
                    Ok(_) => {}
                    Err(e) => debug!(role = %role, error = %e, "Identify query failed"),
                }
            }
            identities.insert(role, identity);
        }

        if let Some(exp) = self.experiment.as_mut() {
            if exp.location.is_none() {
                for role in identities.keys() {
                    if let Ok(details) = self.dispatcher.describe(role) {
                        exp.metadata.instrument_details.insert(role.clone(), details);
                    }
                }
                exp.metadata.instruments = identities;
            } else {
                for (role, identity) in &identities {
                    if exp.metadata.instruments.get(role) != Some(identity) {
                        warn!(
                            run_id = %exp.metadata.run_id,
                            role = %role,
                            recorded = ?exp.metadata.instruments.get(role),
                            current = %identity,
                            "Instrument identity changed since run start"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    fn open_writer(&mut self) -> AppResult<()> {
        let store = Arc::clone(&self.store);
        let exp = self.experiment_mut(ExperimentState::Running)?;
        if exp.writer.is_none() {
            let writer = match &exp.location {
                Some(location) => store.reopen(location)?,
                None => store.create(&exp.metadata)?,
            };
            exp.location = Some(writer.location().to_path_buf());
            exp.writer = Some(writer);
        }
        // Durable data decides where to continue
        let last = exp.writer.as_ref().and_then(|w| w.last_index());
        exp.set_last_completed(last);
        exp.save_checkpoint()
    }

    async fn step(&mut self) {
        let Some(exp) = self.experiment.as_mut() else {
            return;
        };
        let index = exp.next_index();
        let Some(coordinate) = exp.resolver.coordinate_at(index) else {
            self.complete().await;
            return;
        };

        debug!(run_id = %exp.run_id(), index, coordinate = ?coordinate, "Acquiring point");
        let outcome = match acquire_point(&self.dispatcher, exp, index, &coordinate).await {
            Ok(record) => persist(exp, record),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                debug!(run_id = %exp.run_id(), index, "Point persisted");
                self.publish();
            }
            Err(err) if err.kind().halts_run() => self.fail(&err, Some(index)),
            Err(err) => self.hold(&err, index),
        }
    }

    /// RUNNING → PAUSED on a refused operation; resuming retries the point.
    fn hold(&mut self, err: &DaqError, index: usize) {
        let Some(exp) = self.experiment.as_mut() else {
            return;
        };
        warn!(
            run_id = %exp.run_id(),
            index,
            kind = %err.kind(),
            error = %err,
            "Point refused, pausing run"
        );
        if let Err(e) = exp.machine.apply(Transition::Pause) {
            warn!(run_id = %exp.run_id(), error = %e, "Refusal outside RUNNING");
            return;
        }
        exp.status = RunStatus::Paused;
        exp.last_error = Some(ErrorReport::new(err, Some(index)));
        if let Err(e) = exp.save_checkpoint() {
            warn!(run_id = %exp.run_id(), error = %e, "Failed to checkpoint pause");
        }
        self.publish();
    }

    /// RUNNING → ERROR. Everything already durable stays readable.
    fn fail(&mut self, err: &DaqError, index: Option<usize>) {
        let Some(exp) = self.experiment.as_mut() else {
            return;
        };
        error!(
            run_id = %exp.run_id(),
            index = ?index,
            kind = %err.kind(),
            error = %err,
            "Run failed"
        );
        if let Err(e) = exp.machine.apply(Transition::Fail) {
            warn!(run_id = %exp.run_id(), error = %e, "Failure outside RUNNING");
        }
        exp.status = RunStatus::Error;
        exp.last_error = Some(ErrorReport::new(err, index));
        exp.close_writer();
        self.publish();
    }

    async fn complete(&mut self) {
        let Some(exp) = self.experiment.as_mut() else {
            return;
        };

        let mut checkpoint = exp.checkpoint().with_status(RunStatus::Completed);
        checkpoint.state = ExperimentState::Completed;
        let closed = match exp.writer.as_mut() {
            Some(writer) => writer
                .write_checkpoint(&checkpoint)
                .and_then(|_| writer.close()),
            None => Ok(()),
        };
        if let Err(err) = closed {
            self.fail(&err, None);
            return;
        }

        exp.writer = None;
        exp.status = RunStatus::Completed;
        if let Err(e) = exp.machine.apply(Transition::Complete) {
            warn!(run_id = %exp.run_id(), error = %e, "Unexpected completion");
        }
        let elapsed_ms = (Utc::now() - exp.started_at).num_milliseconds();
        info!(
            run_id = %exp.run_id(),
            points = exp.resolver.len(),
            elapsed_ms,
            "Run completed"
        );
        self.release_instruments().await;
        self.publish();
    }

    fn pause(&mut self) -> AppResult<()> {
        if !self.state().can_pause() {
            return Err(self.rejected(ExperimentState::Paused));
        }
        let exp = self.experiment_mut(ExperimentState::Paused)?;
        exp.machine.apply(Transition::Pause)?;
        exp.status = RunStatus::Paused;
        if let Err(e) = exp.save_checkpoint() {
            warn!(run_id = %exp.run_id(), error = %e, "Failed to checkpoint pause");
        }
        info!(run_id = %exp.run_id(), next_index = exp.next_index(), "Run paused");
        self.publish();
        Ok(())
    }

    fn resume(&mut self) -> AppResult<()> {
        if !self.state().can_resume() {
            return Err(self.rejected(ExperimentState::Running));
        }
        let exp = self.experiment_mut(ExperimentState::Running)?;
        exp.machine.apply(Transition::Resume)?;
        exp.status = RunStatus::Running;
        exp.last_error = None;
        exp.reset_applied();
        if let Err(e) = exp.save_checkpoint() {
            warn!(run_id = %exp.run_id(), error = %e, "Failed to checkpoint resume");
        }
        info!(run_id = %exp.run_id(), next_index = exp.next_index(), "Run resumed");
        self.publish();
        Ok(())
    }

    /// PAUSED → IDLE; from RUNNING the legal path RUNNING → PAUSED → IDLE.
    async fn stop(&mut self) -> AppResult<()> {
        let exp = self.experiment_mut(ExperimentState::Idle)?;
        match exp.state() {
            ExperimentState::Running => {
                exp.machine.apply(Transition::Pause)?;
                exp.machine.apply(Transition::Stop)?;
            }
            _ => {
                exp.machine.apply(Transition::Stop)?;
            }
        }
        exp.status = RunStatus::Stopped;
        exp.close_writer();
        info!(run_id = %exp.run_id(), completed = exp.next_index(), "Run stopped");
        self.release_instruments().await;
        self.publish();
        Ok(())
    }

    /// ERROR → IDLE. The run is retained for `continue_run`.
    async fn acknowledge(&mut self) -> AppResult<()> {
        let exp = self.experiment_mut(ExperimentState::Idle)?;
        exp.machine.apply(Transition::Acknowledge)?;
        info!(run_id = %exp.run_id(), "Error acknowledged");
        self.release_instruments().await;
        self.publish();
        Ok(())
    }

    async fn release_instruments(&mut self) {
        for role in std::mem::take(&mut self.connected) {
            if let Err(e) = self.dispatcher.dispatch(EngineTask::disconnect(&role)).await {
                warn!(role = %role, error = %e, "Failed to release instrument");
            }
        }
    }

    /// Leave the run resumable and release everything.
    async fn shutdown(&mut self) {
        if let Some(exp) = self.experiment.as_mut() {
            if exp.state() == ExperimentState::Running {
                if let Err(e) = exp.machine.apply(Transition::Pause) {
                    warn!(error = %e, "Could not pause on shutdown");
                }
                exp.status = RunStatus::Paused;
            }
            exp.close_writer();
        }
        self.release_instruments().await;
        self.publish();
    }
}

/// Command and observer interface to a Runner thread.
///
/// Dropping the handle shuts the Runner down at the next loop boundary,
/// leaving any run paused and resumable with [`RunnerHandle::continue_from`].
pub struct RunnerHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<StatusSnapshot>,
    latest: watch::Receiver<StatusSnapshot>,
    monitor: ReadOnlyDispatcher,
    thread: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Spawn a Runner that exclusively owns `dispatcher`.
    pub fn spawn(
        dispatcher: EngineDispatcher,
        store: Arc<dyn RunStore>,
        config: &RunnerConfig,
    ) -> AppResult<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.status_channel_capacity.max(1));
        let (latest_tx, latest) = watch::channel(StatusSnapshot::idle());
        let monitor = dispatcher.read_only();

        let runner = Runner {
            dispatcher,
            store,
            commands: command_rx,
            publisher: StatusPublisher {
                events: events.clone(),
                latest: latest_tx,
            },
            experiment: None,
            connected: BTreeSet::new(),
        };

        let thread = std::thread::Builder::new()
            .name("experiment-runner".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "Failed to create runner runtime");
                        return;
                    }
                };
                rt.block_on(runner.run());
            })?;

        Ok(Self {
            commands,
            events,
            latest,
            monitor,
            thread: Some(thread),
        })
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> AppResult<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| DaqError::RunnerUnavailable)?;
        response.await.map_err(|_| DaqError::RunnerUnavailable)?
    }

    /// Start a new run of `sweep`. Resolves once the run is RUNNING.
    ///
    /// # Errors
    ///
    /// Configuration error (state unchanged), persistence error when the
    /// container cannot be created (state ERROR), or a rejected transition.
    pub async fn start(&self, sweep: SweepConfig) -> AppResult<String> {
        self.start_with(RunRequest::new(sweep)).await
    }

    /// Start a new run with provenance.
    pub async fn start_with(&self, request: RunRequest) -> AppResult<String> {
        self.request(|reply| Command::Start { request, reply }).await
    }

    /// Pause at the next loop boundary. Resolves once PAUSED.
    pub async fn pause(&self) -> AppResult<()> {
        self.request(Command::Pause).await
    }

    /// Resume a paused run at the next point.
    pub async fn resume(&self) -> AppResult<()> {
        self.request(Command::Resume).await
    }

    /// Stop the run, keeping everything written. Resolves once IDLE.
    pub async fn stop(&self) -> AppResult<()> {
        self.request(Command::Stop).await
    }

    /// Acknowledge an ERROR, releasing the instruments.
    pub async fn acknowledge(&self) -> AppResult<()> {
        self.request(Command::Acknowledge).await
    }

    /// Continue the retained run (after acknowledge or stop) at its next point.
    pub async fn continue_run(&self) -> AppResult<String> {
        self.request(|reply| Command::Continue { from: None, reply })
            .await
    }

    /// Continue a persisted run, e.g. after a process restart.
    pub async fn continue_from(&self, location: impl AsRef<Path>) -> AppResult<String> {
        let from = Some(location.as_ref().to_path_buf());
        self.request(|reply| Command::Continue { from, reply }).await
    }

    /// Subscribe to every snapshot published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.events.subscribe()
    }

    /// Snapshot stream; lagged snapshots are skipped.
    pub fn status_stream(&self) -> impl Stream<Item = StatusSnapshot> + Send + Unpin {
        BroadcastStream::new(self.events.subscribe()).filter_map(|item| item.ok())
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> StatusSnapshot {
        self.latest.borrow().clone()
    }

    /// Wait until the latest snapshot satisfies `predicate`.
    pub async fn wait_until(
        &self,
        predicate: impl FnMut(&StatusSnapshot) -> bool,
    ) -> AppResult<StatusSnapshot> {
        let mut latest = self.latest.clone();
        let snapshot = latest
            .wait_for(predicate)
            .await
            .map_err(|_| DaqError::RunnerUnavailable)?;
        Ok(snapshot.clone())
    }

    /// Wait until the run reaches `state`.
    pub async fn wait_for_state(&self, state: ExperimentState) -> AppResult<StatusSnapshot> {
        self.wait_until(|s| s.state == state).await
    }

    /// Query-only access to the instruments, usable while a run is active.
    pub fn monitor(&self) -> ReadOnlyDispatcher {
        self.monitor.clone()
    }

    /// Shut the Runner down and wait for its thread to exit.
    pub async fn shutdown(mut self) -> AppResult<()> {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|_| DaqError::RunnerUnavailable)?
                .map_err(|_| DaqError::RunnerUnavailable)?;
        }
        Ok(())
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.commands.send(Command::Shutdown);
        }
    }
}
