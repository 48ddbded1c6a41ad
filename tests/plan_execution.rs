//! Plan executor behaviour against scripted backends.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pnp_core::{
    actions::ActionTranslator,
    config::{ActionsConfig, Coordinate, CoordinateTable, ExecutorConfig, Heights, VisionConfig},
    error::TransportError,
    experiment::{Collaborators, ExecutionCursor, Phase, PlanExecutor, StartOutcome, DONE_TASK},
    hardware::{
        DeviceStatus, MeasurementOutcome, MeasurementResult, MotionBackend, SimulatedTestStation,
        TestStationBackend,
    },
    plan::{PlanItem, PlanStore},
    state::{RunState, SharedStateStore, NO_TASK},
    vision::{
        BoundingBox, Detection, Detector, FrameSource, PlacementStatus, VisionVerifier,
    },
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const PICK_COMMANDS: usize = 5;
const TEST_COMMANDS: usize = 2;
const PLACE_COMMANDS: usize = 5;
const ITEM_COMMANDS: usize = PICK_COMMANDS + TEST_COMMANDS + PLACE_COMMANDS;

/// Motion backend that records every command.
///
/// When `hold_at` is set, the command with that 1-based number signals
/// `reached` and blocks until `release` is notified. Commands starting with
/// `refuse_prefix` are not acknowledged.
#[derive(Default)]
struct ScriptedMotion {
    sent: Mutex<Vec<String>>,
    hold_at: Option<usize>,
    refuse_prefix: Option<&'static str>,
    reached: Notify,
    release: Notify,
}

impl ScriptedMotion {
    fn holding_at(command_number: usize) -> Self {
        Self {
            hold_at: Some(command_number),
            ..Self::default()
        }
    }

    fn refusing(prefix: &'static str) -> Self {
        Self {
            refuse_prefix: Some(prefix),
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl MotionBackend for ScriptedMotion {
    fn port(&self) -> &str {
        "scripted"
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn send_command(&self, command: &str) -> bool {
        let number = {
            let mut sent = self.sent.lock();
            sent.push(command.to_string());
            sent.len()
        };

        if self.hold_at == Some(number) {
            self.reached.notify_one();
            self.release.notified().await;
        }

        !self
            .refuse_prefix
            .is_some_and(|prefix| command.starts_with(prefix))
    }

    async fn query_status(&self) -> DeviceStatus {
        DeviceStatus::unknown()
    }
}

/// Test station that always reports the same result.
struct FixedStation(MeasurementResult);

#[async_trait]
impl TestStationBackend for FixedStation {
    fn port(&self) -> &str {
        "fixed"
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) {}

    async fn measure(&self) -> MeasurementResult {
        self.0.clone()
    }

    async fn live_sample(&self) -> Option<pnp_core::hardware::LiveReading> {
        None
    }
}

struct OneBoxDetector;

impl Detector for OneBoxDetector {
    fn is_ready(&self) -> bool {
        true
    }

    fn detect(&self, _frame: &[u8]) -> Vec<Detection> {
        vec![
            Detection {
                bbox: BoundingBox::new(100, 100, 120, 120),
                score: 0.91,
                class_id: 0,
            },
            Detection {
                bbox: BoundingBox::new(0, 0, 10, 10),
                score: 0.3,
                class_id: 1,
            },
        ]
    }
}

struct StillCamera;

#[async_trait]
impl FrameSource for StillCamera {
    async fn latest_jpeg(&self) -> Option<Bytes> {
        Some(Bytes::from_static(b"\xff\xd8frame\xff\xd9"))
    }
}

fn coordinates() -> CoordinateTable {
    CoordinateTable {
        feeders: HashMap::from([
            ("R1".to_string(), Coordinate::xy(50.0, 50.0)),
            ("D1".to_string(), Coordinate::xy(60.0, 50.0)),
        ]),
        pads: HashMap::from([
            ("A".to_string(), Coordinate::xy(100.0, 50.0)),
            ("B".to_string(), Coordinate::xy(120.0, 50.0)),
        ]),
        test_station: Coordinate::xy(0.0, 0.0),
    }
}

struct Rig {
    executor: PlanExecutor,
    plans: Arc<PlanStore>,
    store: SharedStateStore,
}

fn rig(
    motion: Arc<dyn MotionBackend>,
    station: Option<Arc<dyn TestStationBackend>>,
    vision: Option<VisionVerifier>,
    frames: Option<Arc<dyn FrameSource>>,
) -> Rig {
    rig_with(motion, station, vision, frames, &ExecutorConfig::default())
}

fn rig_with(
    motion: Arc<dyn MotionBackend>,
    station: Option<Arc<dyn TestStationBackend>>,
    vision: Option<VisionVerifier>,
    frames: Option<Arc<dyn FrameSource>>,
    config: &ExecutorConfig,
) -> Rig {
    let store = SharedStateStore::new();
    let plans = Arc::new(PlanStore::with_store(store.clone()));
    let executor = PlanExecutor::new(
        Collaborators {
            motion,
            test_station: station,
            translator: ActionTranslator::new(
                coordinates(),
                Heights::default(),
                &ActionsConfig::default(),
            ),
            vision,
            frames,
            plans: plans.clone(),
            store: store.clone(),
        },
        config,
    );
    Rig {
        executor,
        plans,
        store,
    }
}

fn two_item_plan() -> Vec<PlanItem> {
    vec![PlanItem::new("R1", "A"), PlanItem::new("D1", "B")]
}

fn simulated_station() -> Option<Arc<dyn TestStationBackend>> {
    Some(Arc::new(SimulatedTestStation::new("sim")))
}

#[tokio::test(start_paused = true)]
async fn test_plan_runs_to_completion() {
    let motion = Arc::new(ScriptedMotion::default());
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), 2 * ITEM_COMMANDS);
    assert_eq!(rig.executor.cursor(), ExecutionCursor::default());
    assert!(!rig.executor.is_running());

    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Idle);
    assert_eq!(robot.current_task, DONE_TASK);

    let measurement = rig.store.measurement().get().unwrap();
    assert_eq!(measurement.value, SimulatedTestStation::fixed_reading());

    let logs = rig.store.logs().join("\n");
    assert!(logs.contains("Plan received: 2 steps"));
    assert!(logs.contains("Plan started. Steps: 2"));
    assert!(logs.contains("Step 1: PICK R1"));
    assert!(logs.contains("Step 2: PLACE D1 -> B"));
    assert!(logs.contains("Measurement: 4.700 kOhm (Ok)"));
    assert!(logs.contains("Plan finished."));
}

#[tokio::test(start_paused = true)]
async fn test_start_without_plan() {
    let rig = rig(Arc::new(ScriptedMotion::default()), None, None, None);

    assert_eq!(rig.executor.start(), StartOutcome::NoPlan);
    assert!(!rig.executor.is_running());

    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Idle);
    assert_eq!(robot.current_task, NO_TASK);
    assert!(rig.store.logs().iter().any(|l| l.ends_with("No plan to run.")));
}

#[tokio::test(start_paused = true)]
async fn test_second_start_while_running_is_ignored() {
    let motion = Arc::new(ScriptedMotion::holding_at(1));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    motion.reached.notified().await;

    assert_eq!(rig.executor.start(), StartOutcome::AlreadyRunning);
    assert!(rig.executor.is_running());

    motion.release.notify_one();
    rig.executor.wait().await;
    assert_eq!(motion.sent().len(), 2 * ITEM_COMMANDS);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_phase_resumes_at_next_phase() {
    // Hold on the first test-station move of item 1.
    let motion = Arc::new(ScriptedMotion::holding_at(PICK_COMMANDS + 1));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    motion.reached.notified().await;
    rig.executor.stop();
    motion.release.notify_one();
    rig.executor.wait().await;

    // The in-flight TEST phase finished; PLACE was not started.
    assert_eq!(motion.sent().len(), PICK_COMMANDS + TEST_COMMANDS);
    assert_eq!(
        rig.executor.cursor(),
        ExecutionCursor {
            current_index: 0,
            paused: true,
            phase: Phase::Place,
        }
    );
    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Stopped);
    assert_eq!(robot.current_task, "Paused at step 1/2: PLACE");
    assert!(rig.store.logs().iter().any(|l| l.ends_with("Plan stopped by user.")));

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), 2 * ITEM_COMMANDS);
    assert_eq!(rig.store.robot().get().current_task, DONE_TASK);
    assert!(rig
        .store
        .logs()
        .iter()
        .any(|l| l.ends_with("Plan resumed at step 1/2: PLACE")));
}

#[tokio::test(start_paused = true)]
async fn test_stop_in_second_item_resumes_there() {
    let motion = Arc::new(ScriptedMotion::holding_at(ITEM_COMMANDS + 1));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    motion.reached.notified().await;
    rig.executor.stop();
    motion.release.notify_one();
    rig.executor.wait().await;

    let cursor = rig.executor.cursor();
    assert_eq!(cursor.current_index, 1);
    assert_eq!(cursor.phase, Phase::Test);
    assert!(cursor.paused);

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 1 });
    rig.executor.wait().await;

    // Item 1 was never repeated.
    assert_eq!(motion.sent().len(), 2 * ITEM_COMMANDS);
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_place_moves_to_next_item() {
    // Hold on the last command of item 1's PLACE.
    let motion = Arc::new(ScriptedMotion::holding_at(ITEM_COMMANDS));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    motion.reached.notified().await;
    rig.executor.stop();
    motion.release.notify_one();
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), ITEM_COMMANDS);
    assert_eq!(
        rig.executor.cursor(),
        ExecutionCursor {
            current_index: 1,
            paused: true,
            phase: Phase::Pick,
        }
    );
    assert_eq!(rig.store.robot().get().current_task, "Paused at step 2/2: PICK");

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 1 });
    rig.executor.wait().await;
    assert_eq!(motion.sent().len(), 2 * ITEM_COMMANDS);
    assert_eq!(rig.store.robot().get().current_task, DONE_TASK);
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_final_place_completes() {
    let motion = Arc::new(ScriptedMotion::holding_at(2 * ITEM_COMMANDS));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    motion.reached.notified().await;
    rig.executor.stop();
    motion.release.notify_one();
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), 2 * ITEM_COMMANDS);
    assert_eq!(rig.executor.cursor(), ExecutionCursor::default());
    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Idle);
    assert_eq!(robot.current_task, DONE_TASK);
    assert!(!rig.store.logs().iter().any(|l| l.ends_with("Plan stopped by user.")));
}

#[tokio::test(start_paused = true)]
async fn test_stop_before_worker_runs_pauses_at_first_phase() {
    let motion = Arc::new(ScriptedMotion::default());
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    rig.executor.stop();
    rig.executor.wait().await;

    assert!(motion.sent().is_empty());
    assert_eq!(
        rig.executor.cursor(),
        ExecutionCursor {
            current_index: 0,
            paused: true,
            phase: Phase::Pick,
        }
    );
    assert_eq!(rig.store.run_state(), RunState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_phase_delay_then_reset() {
    let motion = Arc::new(ScriptedMotion::default());
    let rig = rig_with(
        motion.clone(),
        simulated_station(),
        None,
        None,
        &ExecutorConfig {
            phase_delay_ms: 1000,
        },
    );
    rig.plans.submit(two_item_plan()).unwrap();

    // PICK finishes at once; the worker is then halfway through the delay.
    rig.executor.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    rig.executor.stop();
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), PICK_COMMANDS);
    assert_eq!(
        rig.executor.cursor(),
        ExecutionCursor {
            current_index: 0,
            paused: true,
            phase: Phase::Test,
        }
    );
    assert_eq!(rig.store.run_state(), RunState::Stopped);

    rig.executor.reset();
    assert_eq!(
        rig.executor.cursor(),
        ExecutionCursor {
            current_index: 0,
            paused: false,
            phase: Phase::Pick,
        }
    );

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    rig.executor.wait().await;
    assert_eq!(motion.sent().len(), PICK_COMMANDS + 2 * ITEM_COMMANDS);
    assert_eq!(rig.store.robot().get().current_task, DONE_TASK);
}

#[tokio::test(start_paused = true)]
async fn test_reset_during_run_rewinds() {
    let motion = Arc::new(ScriptedMotion::holding_at(ITEM_COMMANDS + 1));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    motion.reached.notified().await;
    rig.executor.reset();
    motion.release.notify_one();
    rig.executor.wait().await;

    assert_eq!(rig.executor.cursor(), ExecutionCursor::default());
    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Idle);
    assert_eq!(robot.current_task, NO_TASK);
    assert!(rig.store.logs().iter().any(|l| l.ends_with("Plan reset.")));

    // The plan is still accepted, so a new start begins from the top.
    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    rig.executor.wait().await;
    assert_eq!(motion.sent().len(), ITEM_COMMANDS + PICK_COMMANDS + 2 * ITEM_COMMANDS);
}

#[tokio::test(start_paused = true)]
async fn test_reset_wins_over_a_failing_phase() {
    // Hold on the XY move of item 2's PLACE, then refuse it.
    let motion = Arc::new(ScriptedMotion {
        hold_at: Some(ITEM_COMMANDS + PICK_COMMANDS + TEST_COMMANDS + 2),
        refuse_prefix: Some("G0 X120.000"),
        ..ScriptedMotion::default()
    });
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    motion.reached.notified().await;
    rig.executor.reset();
    motion.release.notify_one();
    rig.executor.wait().await;

    assert_eq!(rig.executor.cursor(), ExecutionCursor::default());
    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Idle);
    assert_eq!(robot.current_task, NO_TASK);

    let logs = rig.store.logs();
    assert!(logs.iter().any(|l| l.ends_with("Plan reset.")));
    assert!(!logs.iter().any(|l| l.contains("failed")));

    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    rig.executor.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_refused_command_fails_the_run() {
    // M9 releases the vacuum during PLACE.
    let motion = Arc::new(ScriptedMotion::refusing("M9"));
    let rig = rig(motion.clone(), simulated_station(), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), PICK_COMMANDS + TEST_COMMANDS + 4);
    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Error);
    assert_eq!(robot.current_task, "Step 1/2: PLACE R1 -> A");
    assert!(rig
        .store
        .logs()
        .iter()
        .any(|l| l.ends_with("Step 1: PLACE failed: Motion command not acknowledged: M9")));

    let cursor = rig.executor.cursor();
    assert_eq!(cursor.current_index, 0);
    assert_eq!(cursor.phase, Phase::Place);
    assert!(!cursor.paused);

    // A failed run is not resumable; the next start begins at item 0.
    assert_eq!(rig.executor.start(), StartOutcome::Started { from_index: 0 });
    rig.executor.wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_measurement_error_fails_test_phase() {
    let motion = Arc::new(ScriptedMotion::default());
    let station: Arc<dyn TestStationBackend> = Arc::new(FixedStation(MeasurementResult::error()));
    let rig = rig(motion.clone(), Some(station), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    rig.executor.wait().await;

    assert_eq!(motion.sent().len(), PICK_COMMANDS + TEST_COMMANDS);
    let robot = rig.store.robot().get();
    assert_eq!(robot.state, RunState::Error);
    assert_eq!(robot.current_task, "Step 1/2: TEST R1");
    assert_eq!(
        rig.store.measurement().get().unwrap().value.result,
        MeasurementOutcome::Error
    );
}

#[tokio::test(start_paused = true)]
async fn test_unusable_measurement_does_not_stop_the_plan() {
    let motion = Arc::new(ScriptedMotion::default());
    let station: Arc<dyn TestStationBackend> =
        Arc::new(FixedStation(MeasurementResult::no_connection()));
    let rig = rig(motion.clone(), Some(station), None, None);
    rig.plans.submit(two_item_plan()).unwrap();

    rig.executor.start();
    rig.executor.wait().await;

    assert_eq!(rig.store.robot().get().current_task, DONE_TASK);
    assert_eq!(
        rig.store.measurement().get().unwrap().value.result,
        MeasurementOutcome::NoConnection
    );
}

#[tokio::test(start_paused = true)]
async fn test_missing_station_reports_no_service() {
    let rig = rig(Arc::new(ScriptedMotion::default()), None, None, None);

    let result = rig.executor.measure().await;
    assert_eq!(result.result, MeasurementOutcome::NoService);
    assert_eq!(rig.store.measurement().get().unwrap().value, result);

    // Without a station the plan still completes.
    rig.plans.submit(two_item_plan()).unwrap();
    rig.executor.start();
    rig.executor.wait().await;
    assert_eq!(rig.store.robot().get().current_task, DONE_TASK);
}

#[tokio::test(start_paused = true)]
async fn test_vision_results_are_published() {
    let vision_config = VisionConfig {
        pad_pixels: HashMap::from([("A".to_string(), [100, 100])]),
        ..VisionConfig::default()
    };
    let vision = VisionVerifier::new(Arc::new(OneBoxDetector), &vision_config);
    let rig = rig(
        Arc::new(ScriptedMotion::default()),
        simulated_station(),
        Some(vision),
        Some(Arc::new(StillCamera)),
    );
    rig.plans.submit(vec![PlanItem::new("R1", "A")]).unwrap();

    rig.executor.start();
    rig.executor.wait().await;

    let summary = rig.store.vision().get();
    let detection = summary.detection.unwrap();
    assert_eq!(detection.part, "R1");
    assert_eq!(detection.class_name.as_deref(), Some("resistor"));
    assert_eq!(detection.confidence, Some(0.91));

    let placement = summary.placement.unwrap();
    assert_eq!(placement.pad, "A");
    assert_eq!(placement.status, PlacementStatus::Ok);
    assert_eq!(placement.distance_px, Some(14.14));
    assert_eq!(placement.accuracy_percent, 76.43);
    assert!(summary.updated_at.is_some());
}
