//! Shared State Store
//!
//! Process-wide record of live device and plan status. Each sub-record is its
//! own [`Observable`] with exactly one owning writer:
//!
//! | Sub-record | Writer |
//! |---|---|
//! | `robot` | plan executor / machine |
//! | `motion` | motion poller |
//! | `live` | test-station poller |
//! | `measurement` | executor TEST phase / manual measure |
//! | `vision` | executor PICK/PLACE checks, or the simulated motion poller when no detector is wired |
//! | connections | the poller of that device |
//!
//! Writes always replace a whole sub-record, so readers never observe a
//! partially updated value. The operator log is a bounded ring guarded by its
//! own mutex.

use crate::hardware::{DeviceStatus, LiveReading, MeasurementResult, TestMode};
use crate::observable::Observable;
use crate::vision::{DetectionSummary, PlacementVerification};
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::watch;

/// Operator log capacity. Oldest entries are evicted first.
pub const LOG_CAPACITY: usize = 200;

/// Task text while nothing is running.
pub const NO_TASK: &str = "-";

/// Externally visible run state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Nothing running
    #[default]
    Idle,
    /// Plan executing
    Running,
    /// Paused by an operator stop, cursor retained
    Stopped,
    /// An action failed
    Error,
}

/// Current robot status shown to the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotStatus {
    /// Run state
    pub state: RunState,
    /// Human readable task, `-` when idle
    pub current_task: String,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl RobotStatus {
    /// New status stamped now.
    pub fn new(state: RunState, current_task: impl Into<String>) -> Self {
        Self {
            state,
            current_task: current_task.into(),
            updated_at: Utc::now(),
        }
    }
}

impl Default for RobotStatus {
    fn default() -> Self {
        Self::new(RunState::Idle, NO_TASK)
    }
}

/// A value with the time it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stamped<T> {
    /// Recorded value
    pub value: T,
    /// Record time
    pub updated_at: DateTime<Utc>,
}

impl<T> Stamped<T> {
    /// Stamp `value` with the current time.
    pub fn now(value: T) -> Self {
        Self {
            value,
            updated_at: Utc::now(),
        }
    }
}

/// Latest vision results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisionSummary {
    /// Last PICK detection
    pub detection: Option<DetectionSummary>,
    /// Last PLACE verification
    pub placement: Option<PlacementVerification>,
    /// Last change
    pub updated_at: Option<DateTime<Utc>>,
}

/// Connection flag of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Device reachable
    pub connected: bool,
    /// Port, only while connected
    pub port: Option<String>,
}

impl Connection {
    /// Connected on `port`.
    pub fn up(port: impl Into<String>) -> Self {
        Self {
            connected: true,
            port: Some(port.into()),
        }
    }

    /// Not connected.
    pub fn down() -> Self {
        Self::default()
    }
}

/// Devices with a connection flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Motion controller
    Motion,
    /// Test station
    TestStation,
    /// Camera
    Camera,
}

/// Bounded, timestamped operator log.
#[derive(Debug)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    /// Empty log holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append `message` with a local timestamp.
    pub fn push(&self, message: &str) {
        let line = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S"), message);
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// Copy of all entries, oldest first.
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// Connection flags in a snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionsSnapshot {
    /// Motion controller
    pub motion: Connection,
    /// Test station
    pub test_station: Connection,
    /// Camera
    pub camera: Connection,
}

/// Point-in-time copy of every sub-record, for the monitoring interface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Robot run state and task
    pub robot: RobotStatus,
    /// Motion controller record
    pub motion: DeviceStatus,
    /// Last triggered measurement
    pub measurement: Option<Stamped<MeasurementResult>>,
    /// Operator-selected test mode
    pub test_mode: TestMode,
    /// Live-view sample
    pub live: Option<Stamped<LiveReading>>,
    /// Vision results
    pub vision: VisionSummary,
    /// Connection flags
    pub connections: ConnectionsSnapshot,
    /// Operator log
    pub logs: Vec<String>,
}

#[derive(Debug)]
struct StoreInner {
    robot: Observable<RobotStatus>,
    motion: Observable<DeviceStatus>,
    measurement: Observable<Option<Stamped<MeasurementResult>>>,
    test_mode: Observable<TestMode>,
    live: Observable<Option<Stamped<LiveReading>>>,
    vision: Observable<VisionSummary>,
    motion_link: Observable<Connection>,
    test_station_link: Observable<Connection>,
    camera_link: Observable<Connection>,
    logs: LogBuffer,
}

/// Handle to the process-wide state. Clones share the same records.
#[derive(Debug, Clone)]
pub struct SharedStateStore {
    inner: Arc<StoreInner>,
}

impl Default for SharedStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStateStore {
    /// Fresh store: idle robot, unknown motion state, nothing connected.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                robot: Observable::new("robot", RobotStatus::default()),
                motion: Observable::new("motion", DeviceStatus::unknown()),
                measurement: Observable::new("measurement", None),
                test_mode: Observable::new("test_mode", TestMode::None),
                live: Observable::new("live", None),
                vision: Observable::new("vision", VisionSummary::default()),
                motion_link: Observable::new("motion_link", Connection::down()),
                test_station_link: Observable::new("test_station_link", Connection::down()),
                camera_link: Observable::new("camera_link", Connection::down()),
                logs: LogBuffer::new(LOG_CAPACITY),
            }),
        }
    }

    // -- robot ------------------------------------------------------------

    /// Robot status record.
    pub fn robot(&self) -> &Observable<RobotStatus> {
        &self.inner.robot
    }

    /// Replace the robot status.
    pub fn set_robot(&self, state: RunState, task: impl Into<String>) {
        self.inner.robot.set(RobotStatus::new(state, task));
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        self.inner.robot.with(|r| r.state)
    }

    /// Subscribe to robot status changes.
    pub fn subscribe_robot(&self) -> watch::Receiver<RobotStatus> {
        self.inner.robot.subscribe()
    }

    // -- devices ----------------------------------------------------------

    /// Motion controller record.
    pub fn motion(&self) -> &Observable<DeviceStatus> {
        &self.inner.motion
    }

    /// Replace the motion record.
    pub fn publish_motion(&self, status: DeviceStatus) {
        self.inner.motion.set(status);
    }

    /// Last triggered measurement.
    pub fn measurement(&self) -> &Observable<Option<Stamped<MeasurementResult>>> {
        &self.inner.measurement
    }

    /// Record a measurement result.
    pub fn record_measurement(&self, result: MeasurementResult) {
        self.inner.measurement.set(Some(Stamped::now(result)));
    }

    /// Operator-selected test mode.
    pub fn test_mode(&self) -> &Observable<TestMode> {
        &self.inner.test_mode
    }

    /// Store the operator-selected test mode.
    pub fn set_test_mode(&self, mode: TestMode) {
        self.inner.test_mode.set(mode);
    }

    /// Live-view sample.
    pub fn live(&self) -> &Observable<Option<Stamped<LiveReading>>> {
        &self.inner.live
    }

    /// Replace the live-view sample.
    pub fn publish_live(&self, reading: LiveReading) {
        self.inner.live.set(Some(Stamped::now(reading)));
    }

    /// Connection record of `device`.
    pub fn connection(&self, device: Device) -> &Observable<Connection> {
        match device {
            Device::Motion => &self.inner.motion_link,
            Device::TestStation => &self.inner.test_station_link,
            Device::Camera => &self.inner.camera_link,
        }
    }

    /// Replace the connection flag of `device`.
    pub fn set_connection(&self, device: Device, connection: Connection) {
        self.connection(device).set(connection);
    }

    // -- vision -----------------------------------------------------------

    /// Vision results.
    pub fn vision(&self) -> &Observable<VisionSummary> {
        &self.inner.vision
    }

    /// Replace the whole vision record.
    pub fn publish_vision(&self, summary: VisionSummary) {
        self.inner.vision.set(summary);
    }

    /// Publish a PICK detection, keeping the last placement.
    pub fn publish_detection(&self, detection: DetectionSummary) {
        self.inner.vision.replace_with(|current| VisionSummary {
            detection: Some(detection),
            placement: current.placement.clone(),
            updated_at: Some(Utc::now()),
        });
    }

    /// Publish a PLACE verification, keeping the last detection.
    pub fn publish_placement(&self, placement: PlacementVerification) {
        self.inner.vision.replace_with(|current| VisionSummary {
            detection: current.detection.clone(),
            placement: Some(placement),
            updated_at: Some(Utc::now()),
        });
    }

    // -- log --------------------------------------------------------------

    /// Append a timestamped operator log line.
    pub fn log(&self, message: impl AsRef<str>) {
        self.inner.logs.push(message.as_ref());
    }

    /// Operator log, oldest first.
    pub fn logs(&self) -> Vec<String> {
        self.inner.logs.entries()
    }

    /// Replace the whole log with a single `message`.
    pub fn reset_logs(&self, message: &str) {
        self.inner.logs.clear();
        self.inner.logs.push(message);
    }

    /// Copy of every sub-record.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            robot: self.inner.robot.get(),
            motion: self.inner.motion.get(),
            measurement: self.inner.measurement.get(),
            test_mode: self.inner.test_mode.get(),
            live: self.inner.live.get(),
            vision: self.inner.vision.get(),
            connections: ConnectionsSnapshot {
                motion: self.inner.motion_link.get(),
                test_station: self.inner.test_station_link.get(),
                camera: self.inner.camera_link.get(),
            },
            logs: self.logs(),
        }
    }
}
