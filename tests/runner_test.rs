//! Integration tests for the Runner control loop: ordering, persistence,
//! failure handling and the command surface.

mod common;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use common::*;
use tera_daq::data::run_store::RunReader;
use tera_daq::config::RunnerConfig;
use tera_daq::engine::{
    Engine, EngineDispatcher, EngineOutput, EngineTask, InstrumentEngine, OperationKind,
};
use tera_daq::error::{AppResult, DaqError, ErrorKind};
use tera_daq::experiment::{
    CaptureTarget, ExperimentState, ReadbackTarget, RunStatus, RunnerHandle, SweepAxis,
    SweepConfig,
};
use tera_daq::hardware::mock::{SimulatedController, SimulatedSource};

#[tokio::test]
async fn test_nested_sweep_completes_in_order() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    let sweep = temperature_field_sweep(vec![10.0, 20.0], vec![0.0, 1.0, 2.0]).with_readback(
        ReadbackTarget::new(TEMPERATURE, "temperature", "temperature_readback"),
    );
    let run_id = runner.start(sweep).await.unwrap();

    let done = runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();
    assert_eq!(done.run_id.as_deref(), Some(run_id.as_str()));
    assert_eq!(done.completed_points, 6);
    assert_eq!(done.index, Some(5));
    assert_eq!(done.coordinate, Some(vec![20.0, 2.0]));

    let reader = RunReader::open(run_dir(root.path())).unwrap();
    assert_eq!(reader.indices().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(
        reader.axis("temperature").unwrap(),
        vec![10.0, 10.0, 10.0, 20.0, 20.0, 20.0]
    );
    assert_eq!(reader.axis("field").unwrap(), vec![0.0, 1.0, 2.0, 0.0, 1.0, 2.0]);
    assert_eq!(
        reader.channel("temperature_readback").unwrap(),
        vec![vec![10.0], vec![10.0], vec![10.0], vec![20.0], vec![20.0], vec![20.0]]
    );
    assert_eq!(reader.channel("thz.signal").unwrap()[0].len(), 16);

    let checkpoint = reader.checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Completed);
    assert_eq!(checkpoint.last_completed_index, Some(5));

    // Only changed axes are set
    let temperatures: Vec<f64> = instruments
        .temperature
        .set_history()
        .await
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(temperatures, vec![10.0, 20.0]);
    assert_eq!(instruments.field.set_history().await.len(), 6);

    // Instruments are released on completion
    assert!(!instruments.source.is_connected());
    assert!(!instruments.temperature.is_connected());

    let metadata = reader.metadata();
    assert_eq!(metadata.run_id, run_id);
    assert_eq!(metadata.total_points, 6);
    assert_eq!(metadata.instruments[SOURCE], "Simulated TeraFlash pro");
    assert_eq!(metadata.instruments[TEMPERATURE], "Simulated Mercury iTC");

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_then_continue_preserves_sequence() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new().fail_capture_call(4));
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    let sweep = temperature_field_sweep(vec![10.0, 20.0, 30.0], vec![0.0, 1.0]);
    runner.start(sweep).await.unwrap();

    let failed = runner.wait_for_state(ExperimentState::Error).await.unwrap();
    assert_eq!(failed.index, Some(2));
    let report = failed.last_error.unwrap();
    assert_eq!(report.kind, ErrorKind::Acquisition);
    assert_eq!(report.index, Some(3));

    let dir = run_dir(root.path());
    let reader = RunReader::open(&dir).unwrap();
    assert_eq!(reader.indices().unwrap(), vec![0, 1, 2]);
    let checkpoint = reader.checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Error);
    assert_eq!(checkpoint.next_index(), 3);

    // Instruments stay held until the error is acknowledged
    assert!(instruments.source.is_connected());
    runner.acknowledge().await.unwrap();
    assert_eq!(runner.latest().state, ExperimentState::Idle);
    assert!(!instruments.source.is_connected());

    runner.continue_run().await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();

    assert_eq!(reader.indices().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(counters(reader.channel("thz.counter").unwrap()), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(
        reader.axis("temperature").unwrap(),
        vec![10.0, 10.0, 20.0, 20.0, 30.0, 30.0]
    );

    // Axes are re-applied after continuing
    let temperatures: Vec<f64> = instruments
        .temperature
        .set_history()
        .await
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    assert_eq!(temperatures, vec![10.0, 20.0, 20.0, 30.0]);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_set_failure_halts_before_capture() {
    let root = temp_root();
    let instruments = Instruments::with_controllers(
        SimulatedSource::new(),
        SimulatedController::new("itc").with_parameter("temperature", 300.0),
        SimulatedController::new("ips")
            .with_parameter("field", 0.0)
            .fail_set_call(2),
    );
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    runner
        .start(temperature_field_sweep(vec![4.0], vec![0.0, 1.0, 2.0]))
        .await
        .unwrap();
    let failed = runner.wait_for_state(ExperimentState::Error).await.unwrap();

    assert_eq!(failed.completed_points, 1);
    assert_eq!(failed.last_error.unwrap().index, Some(1));
    assert_eq!(instruments.source.capture_count(), 1);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_zipped_length_mismatch_rejected() {
    let result = SweepConfig::zipped(vec![
        SweepAxis::new("temperature", "K", vec![10.0, 20.0, 30.0]).targeting(TEMPERATURE, "temperature"),
        SweepAxis::new("field", "T", vec![0.0, 1.0]).targeting(FIELD, "field"),
    ]);
    assert!(matches!(result, Err(DaqError::Configuration(_))));
}

#[tokio::test]
async fn test_zipped_sweep_steps_axes_together() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    let sweep = SweepConfig::zipped(vec![
        SweepAxis::new("temperature", "K", vec![10.0, 20.0, 30.0]).targeting(TEMPERATURE, "temperature"),
        SweepAxis::new("field", "T", vec![0.0, 0.5, 1.0]).targeting(FIELD, "field"),
    ])
    .unwrap()
    .with_capture(CaptureTarget::new("thz", SOURCE));
    runner.start(sweep).await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();

    let reader = RunReader::open(run_dir(root.path())).unwrap();
    assert_eq!(reader.axis("temperature").unwrap(), vec![10.0, 20.0, 30.0]);
    assert_eq!(reader.axis("field").unwrap(), vec![0.0, 0.5, 1.0]);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_role_rejected_and_state_unchanged() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    let sweep = SweepConfig::nested(vec![
        SweepAxis::new("angle", "deg", vec![0.0, 45.0]).targeting("rotator", "angle"),
    ])
    .unwrap()
    .with_capture(CaptureTarget::new("thz", SOURCE));

    let result = runner.start(sweep).await;
    assert!(matches!(result, Err(DaqError::Configuration(_))));
    assert_eq!(runner.latest().state, ExperimentState::Idle);
    assert!(runner.latest().run_id.is_none());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    assert_eq!(instruments.source.connect_attempts(), 0);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_illegal_commands_rejected() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    assert!(matches!(
        runner.pause().await,
        Err(DaqError::IllegalTransition {
            from: ExperimentState::Idle,
            to: ExperimentState::Paused
        })
    ));
    assert!(matches!(
        runner.resume().await,
        Err(DaqError::IllegalTransition { .. })
    ));
    assert!(matches!(
        runner.acknowledge().await,
        Err(DaqError::IllegalTransition { .. })
    ));
    assert!(matches!(
        runner.stop().await,
        Err(DaqError::IllegalTransition { .. })
    ));
    assert!(matches!(
        runner.continue_run().await,
        Err(DaqError::IllegalTransition { .. })
    ));
    assert_eq!(runner.latest().state, ExperimentState::Idle);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pause_and_resume_continue_at_next_point() {
    let root = temp_root();
    let instruments =
        Instruments::new(SimulatedSource::new().with_capture_delay(Duration::from_millis(15)));
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    runner.start(repeat_sweep(10)).await.unwrap();
    runner
        .wait_until(|s| s.completed_points >= 2)
        .await
        .unwrap();
    runner.pause().await.unwrap();

    let paused = runner.latest();
    assert_eq!(paused.state, ExperimentState::Paused);
    let next = paused.next_index();
    assert!(next < 10);

    // Nothing is acquired while paused
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(instruments.source.capture_count(), next as u64);
    assert!(instruments.source.is_connected());

    // A second run cannot start while paused
    assert!(matches!(
        runner.start(repeat_sweep(2)).await,
        Err(DaqError::IllegalTransition {
            from: ExperimentState::Paused,
            ..
        })
    ));

    runner.resume().await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();

    let reader = RunReader::open(run_dir(root.path())).unwrap();
    assert_eq!(reader.indices().unwrap(), (0..10usize).collect::<Vec<_>>());
    assert_eq!(
        counters(reader.channel("thz.counter").unwrap()),
        (1..=10u64).collect::<Vec<_>>()
    );

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_while_running_then_continue() {
    let root = temp_root();
    let instruments =
        Instruments::new(SimulatedSource::new().with_capture_delay(Duration::from_millis(10)));
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    runner.start(repeat_sweep(8)).await.unwrap();
    runner
        .wait_until(|s| s.completed_points >= 1)
        .await
        .unwrap();
    runner.stop().await.unwrap();

    let stopped = runner.latest();
    assert_eq!(stopped.state, ExperimentState::Idle);
    assert!(!instruments.source.is_connected());

    let reader = RunReader::open(run_dir(root.path())).unwrap();
    let checkpoint = reader.checkpoint().unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Stopped);
    assert!(checkpoint.finished_at.is_some());
    assert_eq!(checkpoint.next_index(), stopped.next_index());
    assert_eq!(reader.indices().unwrap().len(), stopped.completed_points);

    runner.continue_run().await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();
    assert_eq!(reader.indices().unwrap(), (0..8usize).collect::<Vec<_>>());

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_retry_exhaustion_halts_run() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new().refuse_connects(10));
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    runner.start(repeat_sweep(3)).await.unwrap();
    let failed = runner.wait_for_state(ExperimentState::Error).await.unwrap();

    let report = failed.last_error.unwrap();
    assert_eq!(report.kind, ErrorKind::Connection);
    assert_eq!(report.index, None);
    // Initial attempt plus two retries
    assert_eq!(instruments.source.connect_attempts(), 3);
    assert_eq!(failed.completed_points, 0);

    runner.acknowledge().await.unwrap();
    assert_eq!(runner.latest().state, ExperimentState::Idle);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connection_recovers_within_retry_budget() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new().refuse_connects(2));
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    runner.start(repeat_sweep(2)).await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();
    assert_eq!(instruments.source.connect_attempts(), 3);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_capture_timeout_halts_run() {
    let root = temp_root();
    let instruments =
        Instruments::new(SimulatedSource::new().with_capture_delay(Duration::from_millis(500)));
    let policy = tera_daq::engine::DispatchPolicy {
        role_timeouts: HashMap::from([(SOURCE.to_string(), Duration::from_millis(20))]),
        ..fast_policy()
    };
    let runner = spawn_runner(&instruments, root.path(), policy);

    runner.start(repeat_sweep(3)).await.unwrap();
    let failed = runner.wait_for_state(ExperimentState::Error).await.unwrap();

    let report = failed.last_error.unwrap();
    assert_eq!(report.kind, ErrorKind::Timeout);
    assert_eq!(report.index, Some(0));
    let reader = RunReader::open(run_dir(root.path())).unwrap();
    assert!(reader.indices().unwrap().is_empty());

    runner.shutdown().await.unwrap();
}

/// Source engine that refuses its first capture, as a busy instrument would.
struct BusySource {
    inner: InstrumentEngine,
    refused: AtomicBool,
}

#[async_trait]
impl Engine for BusySource {
    fn supported_operations(&self) -> BTreeSet<OperationKind> {
        self.inner.supported_operations()
    }

    async fn execute(&self, task: &EngineTask) -> AppResult<EngineOutput> {
        if task.kind() == OperationKind::Capture && !self.refused.swap(true, Ordering::SeqCst) {
            return Err(DaqError::IllegalTransition {
                from: ExperimentState::Running,
                to: ExperimentState::Running,
            });
        }
        self.inner.execute(task).await
    }
}

#[tokio::test]
async fn test_refused_point_pauses_instead_of_failing() {
    let root = temp_root();
    let source = Arc::new(SimulatedSource::new());
    let mut dispatcher = EngineDispatcher::new(fast_policy());
    dispatcher
        .register(
            SOURCE,
            Arc::new(BusySource {
                inner: InstrumentEngine::new(SOURCE, source.clone())
                    .with_query(source.clone())
                    .with_capture(source.clone()),
                refused: AtomicBool::new(false),
            }),
        )
        .unwrap();
    let runner =
        RunnerHandle::spawn(dispatcher, store(root.path()), &RunnerConfig::default()).unwrap();

    runner.start(repeat_sweep(3)).await.unwrap();
    let held = runner.wait_for_state(ExperimentState::Paused).await.unwrap();
    let report = held.last_error.unwrap();
    assert_eq!(report.kind, ErrorKind::Rejected);
    assert!(!report.kind.halts_run());
    assert_eq!(report.index, Some(0));
    assert_eq!(held.completed_points, 0);

    let reader = RunReader::open(run_dir(root.path())).unwrap();
    assert_eq!(reader.checkpoint().unwrap().unwrap().status, RunStatus::Paused);

    // Resuming retries the refused point
    runner.resume().await.unwrap();
    let done = runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();
    assert!(done.last_error.is_none());
    assert_eq!(reader.indices().unwrap(), vec![0, 1, 2]);
    assert_eq!(source.capture_count(), 3);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_time_axis_waits_at_every_point() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    let sweep = SweepConfig::nested(vec![SweepAxis::time(vec![0.05, 0.05, 0.05])])
        .unwrap()
        .with_capture(CaptureTarget::new("thz", SOURCE));
    let started = tokio::time::Instant::now();
    runner.start(sweep).await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));

    let reader = RunReader::open(run_dir(root.path())).unwrap();
    assert_eq!(reader.axis("time").unwrap(), vec![0.05, 0.05, 0.05]);
    assert_eq!(instruments.source.capture_count(), 3);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_monitor_queries_during_run() {
    let root = temp_root();
    let instruments =
        Instruments::new(SimulatedSource::new().with_capture_delay(Duration::from_millis(10)));
    let runner = spawn_runner(&instruments, root.path(), fast_policy());
    let monitor = runner.monitor();

    let sweep = SweepConfig::nested(vec![
        SweepAxis::new("temperature", "K", vec![5.0]).targeting(TEMPERATURE, "temperature"),
        SweepAxis::count(50),
    ])
    .unwrap()
    .with_capture(CaptureTarget::new("thz", SOURCE));
    runner.start(sweep).await.unwrap();
    runner
        .wait_until(|s| s.completed_points >= 1)
        .await
        .unwrap();

    let temperature = monitor.query(TEMPERATURE, "temperature").await.unwrap();
    assert_eq!(temperature.as_f64(), Some(5.0));

    let refused = monitor
        .dispatch(EngineTask::set(TEMPERATURE, "temperature", 300.0, false))
        .await;
    assert!(matches!(
        refused,
        Err(DaqError::UnsupportedOperation {
            operation: OperationKind::Set,
            ..
        })
    ));
    assert_eq!(instruments.temperature.value("temperature").await, Some(5.0));

    runner.stop().await.unwrap();
    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_stream_reports_every_point() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());
    let mut events = runner.subscribe();

    runner.start(repeat_sweep(5)).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let snapshot = events.recv().await.unwrap();
        if let Some(index) = snapshot.index {
            if seen.last() != Some(&index) {
                seen.push(index);
            }
        }
        if snapshot.state == ExperimentState::Completed {
            assert!((snapshot.progress() - 1.0).abs() < f64::EPSILON);
            break;
        }
    }
    assert_eq!(seen, vec![0, 1, 2, 3, 4]);

    runner.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_after_completion_creates_new_run() {
    let root = temp_root();
    let instruments = Instruments::new(SimulatedSource::new());
    let runner = spawn_runner(&instruments, root.path(), fast_policy());

    let first = runner.start(repeat_sweep(2)).await.unwrap();
    runner
        .wait_for_state(ExperimentState::Completed)
        .await
        .unwrap();
    let second = runner.start(repeat_sweep(2)).await.unwrap();
    assert_ne!(first, second);
    runner
        .wait_until(|s| {
            s.state == ExperimentState::Completed && s.run_id.as_deref() == Some(second.as_str())
        })
        .await
        .unwrap();

    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 2);
    runner.shutdown().await.unwrap();
}
