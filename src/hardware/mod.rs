//! Hardware capability traits and backends
//!
//! The executor and the pollers only see the two capability traits defined
//! here. Each has a serial variant speaking the device's line protocol over a
//! [`DeviceChannel`](crate::adapters::DeviceChannel) and a simulated variant
//! that fabricates plausible responses.
//!
//! Failure policy: transport errors stop at this boundary. `send_command`
//! returns `false`, `query_status` returns an `Unknown`/`Disconnected`
//! record, and `measure` returns an `Error`/`NoConnection` result. Only
//! `connect` reports a typed error, since the caller decides whether to keep
//! running without the device.

pub mod grbl;
pub mod mock;
pub mod polling;
pub mod test_station;

pub use grbl::GrblController;
pub use mock::{SimulatedMotion, SimulatedTestStation};
pub use polling::PollerHandle;
pub use test_station::{
    classify_response, LiveReading, MeasurementOutcome, MeasurementResult, TestMode, TestStation,
};

use crate::error::TransportError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Motion controller state as reported in a status frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MotionState {
    /// Ready
    Idle,
    /// Executing motion
    Run,
    /// Feed hold
    Hold,
    /// Alarm lock, or the last command was answered with an error
    Alarm,
    /// Port not open
    Disconnected,
    /// No status frame, or an unrecognized state token
    #[default]
    Unknown,
}

impl MotionState {
    /// Map a status-frame token case-insensitively. `Hold:0` style sub-codes are ignored.
    pub fn from_token(token: &str) -> Self {
        let token = token.split(':').next().unwrap_or_default();
        match token.to_ascii_lowercase().as_str() {
            "idle" => Self::Idle,
            "run" => Self::Run,
            "hold" => Self::Hold,
            "alarm" => Self::Alarm,
            _ => Self::Unknown,
        }
    }
}

/// Machine position in mm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// X axis
    pub x: f64,
    /// Y axis
    pub y: f64,
    /// Z axis
    pub z: f64,
}

impl Position {
    /// Position from three axis values.
    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

/// Motion controller record published by the motion poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    /// Controller state
    pub state: MotionState,
    /// Machine position
    pub position: Position,
    /// Outcome of the most recent command, `None` before the first one
    pub last_ack_ok: Option<bool>,
    /// Most recent command sent
    pub last_command: Option<String>,
    /// When this record was produced
    pub updated_at: DateTime<Utc>,
}

impl DeviceStatus {
    /// Record with the given state and position and no command history.
    pub fn new(state: MotionState, position: Position) -> Self {
        Self {
            state,
            position,
            last_ack_ok: None,
            last_command: None,
            updated_at: Utc::now(),
        }
    }

    /// No frame was found: `Unknown` at the origin.
    pub fn unknown() -> Self {
        Self::new(MotionState::Unknown, Position::default())
    }

    /// Port not open.
    pub fn disconnected() -> Self {
        Self::new(MotionState::Disconnected, Position::default())
    }

    /// Attach the last command outcome.
    pub fn with_last_ack(mut self, ok: Option<bool>, command: Option<String>) -> Self {
        self.last_ack_ok = ok;
        self.last_command = command;
        self
    }
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Motion stage capability.
#[async_trait]
pub trait MotionBackend: Send + Sync {
    /// Port identifier for the connection flag.
    fn port(&self) -> &str;

    /// Whether `connect` succeeded.
    fn is_connected(&self) -> bool;

    /// Open the device and run its startup handshake.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the device. Idempotent.
    async fn disconnect(&self);

    /// Send one command and wait for its acknowledgement. `false` on error reply,
    /// timeout, or transport failure.
    async fn send_command(&self, command: &str) -> bool;

    /// Current controller state and position.
    async fn query_status(&self) -> DeviceStatus;
}

/// Component test station capability.
#[async_trait]
pub trait TestStationBackend: Send + Sync {
    /// Port identifier for the connection flag.
    fn port(&self) -> &str;

    /// Whether `connect` succeeded.
    fn is_connected(&self) -> bool;

    /// Open the device.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the device. Idempotent.
    async fn disconnect(&self);

    /// Trigger one measurement and classify the response.
    async fn measure(&self) -> MeasurementResult;

    /// Live-view reading for the monitoring interface, if this backend produces one.
    async fn live_sample(&self) -> Option<LiveReading>;
}
