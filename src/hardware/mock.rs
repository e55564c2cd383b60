//! Simulated Instrument Implementations
//!
//! Provides simulated instruments for testing and demo runs without a lab.
//! All simulated instruments use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Simulations
//!
//! - `SimulatedSource` - THz time-domain source/detector with a capture counter
//! - `SimulatedController` - Setpoint controller (temperature, magnetic field)
//!
//! Both support fault injection so the Runner's failure paths can be exercised:
//! failing specific capture or set calls, and refusing the first N connection
//! attempts.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{
    Capturable, CaptureParams, Connectable, ConnectionHandle, Queryable, Samples, Settable,
};

/// Session bookkeeping shared by the simulated instruments.
#[derive(Default)]
struct Session {
    connected: AtomicBool,
    sessions: AtomicU64,
    attempts: AtomicU32,
    refuse_remaining: AtomicU32,
}

impl Session {
    fn open(&self, identity: &str) -> Result<ConnectionHandle> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            bail!("{}: connection refused (simulated)", identity);
        }
        self.connected.store(true, Ordering::SeqCst);
        let session = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ConnectionHandle {
            session,
            identity: identity.to_string(),
        })
    }

    fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn ensure_open(&self, identity: &str) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(anyhow!("{}: not connected", identity))
        }
    }
}

/// Returns true (once) when `call` is in the fault set.
fn take_fault(faults: &Mutex<BTreeSet<u64>>, call: u64) -> bool {
    match faults.lock() {
        Ok(mut set) => set.remove(&call),
        Err(poisoned) => poisoned.into_inner().remove(&call),
    }
}

fn insert_fault(faults: &Mutex<BTreeSet<u64>>, call: u64) {
    match faults.lock() {
        Ok(mut set) => set.insert(call),
        Err(poisoned) => poisoned.into_inner().insert(call),
    };
}

// =============================================================================
// SimulatedSource - THz time-domain source/detector
// =============================================================================

/// Simulated THz time-domain spectrometer
///
/// Each capture returns a `time` axis in ps, a damped-cosine `signal` and a
/// one-element `counter` holding the number of successful captures so far. A
/// failed capture does not advance the counter, so records written after a
/// resume keep a contiguous counter sequence.
///
/// # Example
///
/// ```rust,ignore
/// let source = SimulatedSource::new().with_points(64).fail_capture_call(4);
/// ```
pub struct SimulatedSource {
    identity: String,
    points: usize,
    capture_delay: Duration,
    session: Session,
    counter: AtomicU64,
    capture_calls: AtomicU64,
    capture_faults: Mutex<BTreeSet<u64>>,
}

impl SimulatedSource {
    /// Create a simulated source with 128 samples per trace and no capture delay.
    pub fn new() -> Self {
        Self {
            identity: "Simulated TeraFlash pro".to_string(),
            points: 128,
            capture_delay: Duration::ZERO,
            session: Session::default(),
            counter: AtomicU64::new(0),
            capture_calls: AtomicU64::new(0),
            capture_faults: Mutex::new(BTreeSet::new()),
        }
    }

    /// Samples per trace.
    pub fn with_points(mut self, points: usize) -> Self {
        self.points = points.max(2);
        self
    }

    /// Time each capture takes.
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Fail the `call`-th capture call (1-based) with an acquisition fault.
    pub fn fail_capture_call(self, call: u64) -> Self {
        insert_fault(&self.capture_faults, call);
        self
    }

    /// Refuse the first `attempts` connection attempts.
    pub fn refuse_connects(self, attempts: u32) -> Self {
        self.session.refuse_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    /// Number of successful captures.
    pub fn capture_count(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Number of connection attempts, including refused ones.
    pub fn connect_attempts(&self) -> u32 {
        self.session.attempts.load(Ordering::SeqCst)
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }

    fn trace(&self, n: u64, points: usize) -> Samples {
        let span = 20.0;
        let dt = span / (points - 1) as f64;
        let amplitude = 1.0 + 1e-3 * n as f64;
        let time: Vec<f64> = (0..points).map(|i| -10.0 + i as f64 * dt).collect();
        let signal = time
            .iter()
            .map(|t| amplitude * (-t * t / 2.0).exp() * (std::f64::consts::PI * t).cos())
            .collect();

        let mut samples = Samples::new();
        samples.insert("time".to_string(), time);
        samples.insert("signal".to_string(), signal);
        samples.insert("counter".to_string(), vec![n as f64]);
        samples
    }
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connectable for SimulatedSource {
    async fn connect(&self) -> Result<ConnectionHandle> {
        self.session.open(&self.identity)
    }

    async fn disconnect(&self, _handle: &ConnectionHandle) -> Result<()> {
        self.session.close();
        Ok(())
    }

    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("model".to_string(), self.identity.clone()),
            ("transport".to_string(), "simulated".to_string()),
            ("points".to_string(), self.points.to_string()),
        ])
    }
}

#[async_trait]
impl Queryable for SimulatedSource {
    async fn query(&self, _handle: &ConnectionHandle, parameter: &str) -> Result<Value> {
        self.session.ensure_open(&self.identity)?;
        match parameter {
            "identify" => Ok(json!(self.identity)),
            "counter" => Ok(json!(self.capture_count())),
            "status" => Ok(json!("ready")),
            other => bail!("Unknown parameter '{}'", other),
        }
    }
}

#[async_trait]
impl Capturable for SimulatedSource {
    async fn capture(&self, _handle: &ConnectionHandle, params: &CaptureParams) -> Result<Samples> {
        self.session.ensure_open(&self.identity)?;
        let call = self.capture_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if take_fault(&self.capture_faults, call) {
            bail!("Simulated acquisition fault on capture call {}", call);
        }

        sleep(self.capture_delay).await;

        let points = params
            .get("points")
            .and_then(Value::as_u64)
            .map(|p| (p as usize).max(2))
            .unwrap_or(self.points);
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(call, counter = n, points, "SimulatedSource: captured trace");
        Ok(self.trace(n, points))
    }
}

// =============================================================================
// SimulatedController - Setpoint controller
// =============================================================================

/// Simulated setpoint controller (temperature controller, magnet power supply)
///
/// Setpoints are stored per parameter and read back exactly. With
/// `wait_for_stable`, a set waits for the configured settle time first.
///
/// # Example
///
/// ```rust,ignore
/// let itc = SimulatedController::new("Simulated Mercury iTC")
///     .with_parameter("temperature", 300.0)
///     .with_settle_time(Duration::from_millis(5));
/// ```
pub struct SimulatedController {
    identity: String,
    settle_time: Duration,
    session: Session,
    parameters: RwLock<BTreeMap<String, f64>>,
    history: RwLock<Vec<(String, f64)>>,
    set_calls: AtomicU64,
    set_faults: Mutex<BTreeSet<u64>>,
}

impl SimulatedController {
    /// Create a controller reporting `identity`, with no parameters.
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            settle_time: Duration::ZERO,
            session: Session::default(),
            parameters: RwLock::new(BTreeMap::new()),
            history: RwLock::new(Vec::new()),
            set_calls: AtomicU64::new(0),
            set_faults: Mutex::new(BTreeSet::new()),
        }
    }

    /// Declare a settable parameter with its initial value.
    pub fn with_parameter(mut self, name: impl Into<String>, initial: f64) -> Self {
        self.parameters.get_mut().insert(name.into(), initial);
        self
    }

    /// Time a stabilising set waits before returning.
    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    /// Fail the `call`-th set call (1-based).
    pub fn fail_set_call(self, call: u64) -> Self {
        insert_fault(&self.set_faults, call);
        self
    }

    /// Refuse the first `attempts` connection attempts.
    pub fn refuse_connects(self, attempts: u32) -> Self {
        self.session.refuse_remaining.store(attempts, Ordering::SeqCst);
        self
    }

    /// Every successful set, in order.
    pub async fn set_history(&self) -> Vec<(String, f64)> {
        self.history.read().await.clone()
    }

    /// Current value of `parameter`.
    pub async fn value(&self, parameter: &str) -> Option<f64> {
        self.parameters.read().await.get(parameter).copied()
    }

    /// Number of connection attempts, including refused ones.
    pub fn connect_attempts(&self) -> u32 {
        self.session.attempts.load(Ordering::SeqCst)
    }

    /// Whether a session is currently open.
    pub fn is_connected(&self) -> bool {
        self.session.connected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connectable for SimulatedController {
    async fn connect(&self) -> Result<ConnectionHandle> {
        self.session.open(&self.identity)
    }

    async fn disconnect(&self, _handle: &ConnectionHandle) -> Result<()> {
        self.session.close();
        Ok(())
    }

    fn describe(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("model".to_string(), self.identity.clone()),
            ("transport".to_string(), "simulated".to_string()),
        ])
    }
}

#[async_trait]
impl Queryable for SimulatedController {
    async fn query(&self, _handle: &ConnectionHandle, parameter: &str) -> Result<Value> {
        self.session.ensure_open(&self.identity)?;
        if parameter == "identify" {
            return Ok(json!(self.identity));
        }
        match self.parameters.read().await.get(parameter) {
            Some(value) => Ok(json!(value)),
            None => bail!("Unknown parameter '{}'", parameter),
        }
    }
}

#[async_trait]
impl Settable for SimulatedController {
    async fn set(
        &self,
        _handle: &ConnectionHandle,
        parameter: &str,
        value: f64,
        wait_for_stable: bool,
    ) -> Result<()> {
        self.session.ensure_open(&self.identity)?;
        let call = self.set_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if take_fault(&self.set_faults, call) {
            bail!("Simulated setpoint fault on set call {}", call);
        }
        if !self.parameters.read().await.contains_key(parameter) {
            bail!("Unknown parameter '{}'", parameter);
        }

        if wait_for_stable {
            sleep(self.settle_time).await;
        }

        self.parameters
            .write()
            .await
            .insert(parameter.to_string(), value);
        self.history
            .write()
            .await
            .push((parameter.to_string(), value));
        debug!(identity = %self.identity, parameter, value, "SimulatedController: setpoint reached");
        Ok(())
    }
}
