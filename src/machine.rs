//! Machine composition root
//!
//! Builds the leaf components from [`Settings`] (simulated or serial
//! backends), injects them into the [`PlanExecutor`], and owns the polling
//! tasks. This is the surface the monitoring interface talks to.

use crate::actions::ActionTranslator;
use crate::config::Settings;
use crate::error::{AppResult, PlanError};
use crate::experiment::{Collaborators, ExecutionCursor, PlanExecutor, StartOutcome};
use crate::hardware::polling::{spawn_motion_poller, spawn_test_station_poller};
use crate::hardware::{
    GrblController, MeasurementResult, MotionBackend, PollerHandle, SimulatedMotion,
    SimulatedTestStation, TestMode, TestStation, TestStationBackend,
};
use crate::plan::{Plan, PlanItem, PlanStore};
use crate::state::{Connection, Device, RunState, SharedStateStore, StatusSnapshot, NO_TASK};
use crate::vision::{Detector, FrameSource, VisionVerifier};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Builder for [`Machine`]. Backends default to what `settings` selects.
pub struct MachineBuilder {
    settings: Settings,
    store: SharedStateStore,
    motion: Option<Arc<dyn MotionBackend>>,
    test_station: Option<Arc<dyn TestStationBackend>>,
    detector: Option<Arc<dyn Detector>>,
    frames: Option<Arc<dyn FrameSource>>,
}

impl MachineBuilder {
    /// Use `motion` instead of the configured backend.
    pub fn motion_backend(mut self, motion: Arc<dyn MotionBackend>) -> Self {
        self.motion = Some(motion);
        self
    }

    /// Use `station` instead of the configured backend.
    pub fn test_station_backend(mut self, station: Arc<dyn TestStationBackend>) -> Self {
        self.test_station = Some(station);
        self
    }

    /// Wire an object detector for pick/place checks.
    pub fn detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Wire a camera.
    pub fn frames(mut self, frames: Arc<dyn FrameSource>) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Share an existing store instead of creating one.
    pub fn store(mut self, store: SharedStateStore) -> Self {
        self.store = store;
        self
    }

    /// Construct every component. Nothing is connected yet.
    pub fn build(self) -> Machine {
        let settings = self.settings;
        let store = self.store;
        let simulated = settings.application.simulated;

        let motion: Arc<dyn MotionBackend> = match self.motion {
            Some(motion) => motion,
            None if simulated => Arc::new(SimulatedMotion::new(
                &settings.motion,
                store.robot().clone(),
            )),
            None => Arc::new(GrblController::serial(&settings.motion)),
        };

        let test_station: Option<Arc<dyn TestStationBackend>> = match self.test_station {
            Some(station) => Some(station),
            None if !settings.test_station.enabled => None,
            None if simulated => Some(Arc::new(SimulatedTestStation::new(
                settings.test_station.port.clone(),
            ))),
            None => Some(Arc::new(TestStation::serial(&settings.test_station))),
        };

        let vision = self
            .detector
            .map(|detector| VisionVerifier::new(detector, &settings.vision));
        let plans = Arc::new(PlanStore::with_store(store.clone()));

        let executor = PlanExecutor::new(
            Collaborators {
                motion: motion.clone(),
                test_station: test_station.clone(),
                translator: ActionTranslator::from_settings(&settings),
                vision: vision.clone(),
                frames: self.frames.clone(),
                plans: plans.clone(),
                store: store.clone(),
            },
            &settings.executor,
        );

        Machine {
            settings,
            store,
            plans,
            motion,
            test_station,
            has_detector: vision.is_some(),
            has_camera: self.frames.is_some(),
            executor,
            pollers: Vec::new(),
        }
    }
}

/// The assembled pick-and-place machine.
pub struct Machine {
    settings: Settings,
    store: SharedStateStore,
    plans: Arc<PlanStore>,
    motion: Arc<dyn MotionBackend>,
    test_station: Option<Arc<dyn TestStationBackend>>,
    has_detector: bool,
    has_camera: bool,
    executor: PlanExecutor,
    pollers: Vec<PollerHandle>,
}

impl Machine {
    /// Builder over `settings`.
    pub fn builder(settings: Settings) -> MachineBuilder {
        MachineBuilder {
            settings,
            store: SharedStateStore::new(),
            motion: None,
            test_station: None,
            detector: None,
            frames: None,
        }
    }

    /// Machine with the backends `settings` selects.
    pub fn from_settings(settings: Settings) -> Self {
        Self::builder(settings).build()
    }

    /// Connect devices and start polling. A device that fails to connect is
    /// logged and left disconnected; the machine still starts.
    pub async fn startup(&mut self) {
        info!(
            "Starting {} ({} mode)",
            self.settings.application.name,
            if self.settings.application.simulated {
                "simulated"
            } else {
                "serial"
            }
        );

        if let Err(e) = self.motion.connect().await {
            warn!("Motion controller unavailable: {}", e);
            self.store
                .log(format!("Motion controller connection failed: {}", e));
        }

        if let Some(station) = &self.test_station {
            if let Err(e) = station.connect().await {
                warn!("Test station unavailable: {}", e);
                self.store
                    .log(format!("Test station connection failed: {}", e));
            }
        }

        if self.has_camera {
            self.store
                .set_connection(Device::Camera, Connection::up("camera"));
        }

        let synthesize_vision = self.settings.application.simulated && !self.has_detector;
        self.pollers.push(spawn_motion_poller(
            self.motion.clone(),
            self.store.clone(),
            self.settings.motion.poll_interval(),
            synthesize_vision,
        ));

        if let Some(station) = &self.test_station {
            self.pollers.push(spawn_test_station_poller(
                station.clone(),
                self.store.clone(),
                Duration::from_millis(self.settings.test_station.poll_interval_ms),
            ));
        }

        self.store.log("System started");
    }

    /// Stop the executor and pollers, then close the devices.
    pub async fn shutdown(&mut self) {
        if self.executor.is_running() {
            self.executor.stop();
        }
        self.executor.wait().await;

        for poller in self.pollers.drain(..) {
            poller.stop().await;
        }

        self.motion.disconnect().await;
        if let Some(station) = &self.test_station {
            station.disconnect().await;
        }
        self.store.set_connection(Device::Camera, Connection::down());
        info!("Machine shut down");
    }

    /// Validate and accept a plan.
    pub fn submit_plan(&self, items: Vec<PlanItem>) -> Result<Plan, PlanError> {
        self.plans.submit(items)
    }

    /// Read, validate and accept a JSON plan file.
    pub fn load_plan_file(&self, path: &Path) -> AppResult<Plan> {
        let json = std::fs::read_to_string(path)?;
        let plan = Plan::from_json(&json)?;
        self.plans.accept(plan.clone());
        Ok(plan)
    }

    /// Start or resume the current plan.
    pub fn start(&self) -> StartOutcome {
        self.executor.start()
    }

    /// Request a cooperative stop.
    pub fn stop(&self) {
        self.executor.stop();
    }

    /// Rewind the executor, drop the plan and clear the operator log.
    pub fn reset(&self) {
        self.executor.reset();
        self.plans.clear();
        self.store.set_robot(RunState::Idle, NO_TASK);
        self.store.reset_logs("System reset");
    }

    /// Trigger one measurement and record it.
    pub async fn measure(&self) -> MeasurementResult {
        self.executor.measure().await
    }

    /// Store the operator-selected test mode.
    pub fn set_test_mode(&self, mode: TestMode) {
        self.store.set_test_mode(mode);
        self.store.log(format!("Test mode set to {:?}", mode));
    }

    /// Copy of every state sub-record.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.store.snapshot()
    }

    /// Executor cursor.
    pub fn cursor(&self) -> ExecutionCursor {
        self.executor.cursor()
    }

    /// Shared state.
    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    /// Plan executor.
    pub fn executor(&self) -> &PlanExecutor {
        &self.executor
    }

    /// Active settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}
