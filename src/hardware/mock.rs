//! Simulated Hardware Implementations
//!
//! Backends that fabricate plausible responses without touching a port.
//! All delays use `tokio::time::sleep`, never `std::thread::sleep`.
//!
//! # Available Simulations
//!
//! - `SimulatedMotion` - acknowledges every command after a short delay and
//!   walks a triangular-wave trajectory while the robot status is `running`
//! - `SimulatedTestStation` - fixed resistor reading and an incrementing
//!   ADC counter for the live view

use super::{
    DeviceStatus, LiveReading, MeasurementOutcome, MeasurementResult, MotionBackend, MotionState,
    Position, TestMode, TestStationBackend,
};
use crate::config::MotionConfig;
use crate::error::TransportError;
use crate::observable::Observable;
use crate::state::{RobotStatus, RunState};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::time::{sleep, Duration};
use tracing::{debug, info};

// =============================================================================
// SimulatedMotion
// =============================================================================

const SIM_X_STEP: f64 = 2.0;
const SIM_Y_STEP: f64 = 1.0;

#[derive(Debug)]
struct Trajectory {
    position: Position,
    direction: f64,
    last_command: Option<String>,
}

/// Simulated motion stage.
///
/// Reads the robot status record to decide whether to move; it never writes it.
pub struct SimulatedMotion {
    port: String,
    command_delay: Duration,
    x_max: f64,
    y_wrap: f64,
    robot: Observable<RobotStatus>,
    connected: AtomicBool,
    trajectory: Mutex<Trajectory>,
}

impl SimulatedMotion {
    /// Simulation driven by the given robot status record.
    pub fn new(config: &MotionConfig, robot: Observable<RobotStatus>) -> Self {
        Self {
            port: config.port.clone(),
            command_delay: Duration::from_millis(config.simulated_command_delay_ms),
            x_max: config.sim_x_max,
            y_wrap: config.sim_y_wrap,
            robot,
            connected: AtomicBool::new(false),
            trajectory: Mutex::new(Trajectory {
                position: Position::default(),
                direction: 1.0,
                last_command: None,
            }),
        }
    }

    /// Current simulated position.
    pub fn position(&self) -> Position {
        self.trajectory.lock().position
    }

    fn advance(&self) -> Position {
        let mut t = self.trajectory.lock();
        t.position.x += t.direction * SIM_X_STEP;
        t.position.y += SIM_Y_STEP;

        if t.position.x >= self.x_max {
            t.direction = -1.0;
        } else if t.position.x <= 0.0 {
            t.direction = 1.0;
        }
        if t.position.y >= self.y_wrap {
            t.position.y = 0.0;
        }
        t.position
    }
}

#[async_trait]
impl MotionBackend for SimulatedMotion {
    fn port(&self) -> &str {
        &self.port
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        info!("Simulated motion controller ready on {}", self.port);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send_command(&self, command: &str) -> bool {
        debug!("[SIM] G-code: {}", command.trim());
        sleep(self.command_delay).await;
        self.trajectory.lock().last_command = Some(command.trim().to_string());
        true
    }

    async fn query_status(&self) -> DeviceStatus {
        let running = self.robot.with(|r| r.state == RunState::Running);
        let (state, position) = if running {
            (MotionState::Run, self.advance())
        } else {
            (MotionState::Idle, self.position())
        };

        let last_command = self.trajectory.lock().last_command.clone();
        let last_ok = last_command.as_ref().map(|_| true);
        DeviceStatus::new(state, position).with_last_ack(last_ok, last_command)
    }
}

// =============================================================================
// SimulatedTestStation
// =============================================================================

const LIVE_ADC_MIN: u32 = 100;
const LIVE_ADC_MAX: u32 = 800;
const LIVE_ADC_STEP: u32 = 5;

/// Simulated test station.
pub struct SimulatedTestStation {
    port: String,
    connected: AtomicBool,
    adc: Mutex<u32>,
}

impl SimulatedTestStation {
    /// New simulation reporting `port` in its connection flag.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            connected: AtomicBool::new(false),
            adc: Mutex::new(LIVE_ADC_MIN),
        }
    }

    /// The fixed reading returned by `measure`.
    pub fn fixed_reading() -> MeasurementResult {
        MeasurementResult {
            mode: TestMode::Resistor,
            value_text: "4.700 kOhm".to_string(),
            voltage: 0.0,
            result: MeasurementOutcome::Ok,
        }
    }
}

#[async_trait]
impl TestStationBackend for SimulatedTestStation {
    fn port(&self) -> &str {
        &self.port
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        self.connected.store(true, Ordering::SeqCst);
        info!("Simulated test station ready on {}", self.port);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn measure(&self) -> MeasurementResult {
        Self::fixed_reading()
    }

    async fn live_sample(&self) -> Option<LiveReading> {
        let mut adc = self.adc.lock();
        *adc += LIVE_ADC_STEP;
        if *adc > LIVE_ADC_MAX {
            *adc = LIVE_ADC_MIN;
        }
        Some(LiveReading::from_adc(*adc))
    }
}
