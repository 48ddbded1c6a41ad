//! Plan Executor
//!
//! Drives one PICK -> TEST -> PLACE cycle per plan item on a spawned worker
//! and publishes progress into the [`SharedStateStore`].
//!
//! # State machine
//!
//! ```text
//!        start()                 all items done
//! Idle ----------> Running ---------------------> Idle ("done")
//!                   |   |
//!          stop()   |   | action failed
//!                   v   v
//!             Stopped   Error
//! ```
//!
//! Cancellation is cooperative. The stop signal is checked before and after
//! every phase and while waiting between phases; an in-flight device call is
//! never aborted. A stop seen before a phase resumes at that phase, a stop
//! seen after a phase resumes at the next one.

use crate::actions::ActionTranslator;
use crate::config::ExecutorConfig;
use crate::error::ActionError;
use crate::hardware::{MeasurementResult, MotionBackend, TestStationBackend};
use crate::plan::{Plan, PlanItem, PlanSource};
use crate::state::{RunState, SharedStateStore, NO_TASK};
use crate::vision::{Detection, FrameSource, VisionVerifier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Task text after a plan completes.
pub const DONE_TASK: &str = "done";

/// Phase of one plan item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Phase {
    /// Pick the part from its feeder
    #[default]
    Pick,
    /// Measure it at the test station
    Test,
    /// Place it on its pad
    Place,
}

impl Phase {
    /// Phase following this one within the same item.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::Pick => Some(Phase::Test),
            Phase::Test => Some(Phase::Place),
            Phase::Place => None,
        }
    }

    fn describe(self, item: &PlanItem) -> String {
        match self {
            Phase::Pick => format!("PICK {}", item.part),
            Phase::Test => format!("TEST {}", item.part),
            Phase::Place => format!("PLACE {} -> {}", item.part, item.target_pad),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Pick => "PICK",
            Phase::Test => "TEST",
            Phase::Place => "PLACE",
        })
    }
}

/// Where to resume after a pause. Owned by the executor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCursor {
    /// Item index to resume at
    pub current_index: usize,
    /// Set by `stop()`, cleared by a fresh start, completion or `reset()`
    pub paused: bool,
    /// Phase to resume at within `current_index`
    pub phase: Phase,
}

/// What `start()` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A worker was spawned
    Started {
        /// First item index it will execute
        from_index: usize,
    },
    /// A worker is already active; nothing changed
    AlreadyRunning,
    /// No plan has been accepted
    NoPlan,
}

/// Everything the executor depends on, constructed by the caller.
pub struct Collaborators {
    /// Motion backend
    pub motion: Arc<dyn MotionBackend>,
    /// Test station, `None` when not attached
    pub test_station: Option<Arc<dyn TestStationBackend>>,
    /// Action translator
    pub translator: ActionTranslator,
    /// Vision verifier, `None` when no detector is wired
    pub vision: Option<VisionVerifier>,
    /// Camera
    pub frames: Option<Arc<dyn FrameSource>>,
    /// Plan intake
    pub plans: Arc<dyn PlanSource>,
    /// Shared state
    pub store: SharedStateStore,
}

struct Inner {
    motion: Arc<dyn MotionBackend>,
    test_station: Option<Arc<dyn TestStationBackend>>,
    translator: ActionTranslator,
    vision: Option<VisionVerifier>,
    frames: Option<Arc<dyn FrameSource>>,
    plans: Arc<dyn PlanSource>,
    store: SharedStateStore,
    phase_delay: Duration,
    cursor: Mutex<ExecutionCursor>,
    stop_tx: watch::Sender<bool>,
    running_tx: watch::Sender<bool>,
    /// Bumped by `reset()` so a worker that is still winding down leaves the cursor alone
    epoch: AtomicU64,
    /// Serializes start decisions
    start_lock: Mutex<()>,
}

/// Clears the running flag when the worker exits, including by panic.
struct RunningGuard(Arc<Inner>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.running_tx.send_replace(false);
    }
}

/// Plan executor handle. Clones share the same executor.
#[derive(Clone)]
pub struct PlanExecutor {
    inner: Arc<Inner>,
}

impl fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("running", &self.is_running())
            .field("cursor", &self.cursor())
            .finish()
    }
}

enum Exit {
    Completed,
    Paused,
    Failed,
}

impl PlanExecutor {
    /// Executor over `deps`.
    pub fn new(deps: Collaborators, config: &ExecutorConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let (running_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                motion: deps.motion,
                test_station: deps.test_station,
                translator: deps.translator,
                vision: deps.vision,
                frames: deps.frames,
                plans: deps.plans,
                store: deps.store,
                phase_delay: Duration::from_millis(config.phase_delay_ms),
                cursor: Mutex::new(ExecutionCursor::default()),
                stop_tx,
                running_tx,
                epoch: AtomicU64::new(0),
                start_lock: Mutex::new(()),
            }),
        }
    }

    /// Launch the execution loop. Must be called from within a Tokio runtime.
    ///
    /// Resumes at the cursor if the last run was stopped, else starts at item 0.
    pub fn start(&self) -> StartOutcome {
        let inner = &self.inner;
        let _start = inner.start_lock.lock();

        if *inner.running_tx.borrow() {
            info!("Plan already running, start ignored");
            return StartOutcome::AlreadyRunning;
        }

        let plan = match inner.plans.current_plan() {
            Some(plan) if !plan.is_empty() => plan,
            _ => {
                inner.store.log("No plan to run.");
                inner.store.set_robot(RunState::Idle, NO_TASK);
                return StartOutcome::NoPlan;
            }
        };

        let (from_index, from_phase, epoch) = {
            let mut cursor = inner.cursor.lock();
            let from = if cursor.paused && cursor.current_index < plan.len() {
                (cursor.current_index, cursor.phase)
            } else {
                (0, Phase::Pick)
            };
            *cursor = ExecutionCursor {
                current_index: from.0,
                paused: false,
                phase: from.1,
            };
            (from.0, from.1, inner.epoch.load(Ordering::SeqCst))
        };

        inner.stop_tx.send_replace(false);
        inner.running_tx.send_replace(true);

        let run_id = Uuid::new_v4();
        let span = info_span!("plan_run", %run_id);
        let guard = RunningGuard(inner.clone());

        tokio::spawn(
            async move {
                guard.0.run(plan, from_index, from_phase, epoch).await;
                drop(guard);
            }
            .instrument(span),
        );

        StartOutcome::Started { from_index }
    }

    /// Request a cooperative stop. Returns immediately.
    pub fn stop(&self) {
        self.inner.cursor.lock().paused = true;
        self.inner.stop_tx.send_replace(true);
        info!("Stop requested");
    }

    /// Signal stop and rewind the cursor to the first item.
    ///
    /// A worker still winding down afterwards never writes the cursor again.
    pub fn reset(&self) {
        {
            let mut cursor = self.inner.cursor.lock();
            self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            *cursor = ExecutionCursor::default();
        }
        self.inner.stop_tx.send_replace(true);
        info!("Executor reset");
    }

    /// Trigger one measurement outside a plan and record it.
    pub async fn measure(&self) -> MeasurementResult {
        self.inner.measure().await
    }

    /// Whether a worker is active.
    pub fn is_running(&self) -> bool {
        *self.inner.running_tx.borrow()
    }

    /// Copy of the cursor.
    pub fn cursor(&self) -> ExecutionCursor {
        *self.inner.cursor.lock()
    }

    /// Wait until no worker is active. Cancel-safe.
    pub async fn wait(&self) {
        let mut running = self.inner.running_tx.subscribe();
        while *running.borrow_and_update() {
            if running.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Inner {
    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    async fn run(&self, plan: Plan, from_index: usize, from_phase: Phase, epoch: u64) {
        let total = plan.len();
        if from_index == 0 && from_phase == Phase::Pick {
            self.store.log(format!("Plan started. Steps: {}", total));
        } else {
            self.store.log(format!(
                "Plan resumed at step {}/{}: {}",
                from_index + 1,
                total,
                from_phase
            ));
        }
        self.store.set_robot(RunState::Running, NO_TASK);
        info!("Executing {} items from index {}", total, from_index);

        match self.run_items(&plan, from_index, from_phase, epoch).await {
            Exit::Completed => {
                {
                    let mut cursor = self.cursor.lock();
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        drop(cursor);
                        self.finish_reset();
                        return;
                    }
                    *cursor = ExecutionCursor::default();
                }
                self.store.set_robot(RunState::Idle, DONE_TASK);
                self.store.log("Plan finished.");
                info!("Plan finished");
            }
            Exit::Paused | Exit::Failed => {}
        }
    }

    /// Run phases from `(from_index, from_phase)` on.
    ///
    /// A stop seen before a phase pauses at that phase. A stop seen after a
    /// phase pauses at the following one, which is item `i + 1` once PLACE of
    /// item `i` is done. A stop seen after the last PLACE of the plan is
    /// ignored and the plan completes.
    async fn run_items(&self, plan: &Plan, from_index: usize, from_phase: Phase, epoch: u64) -> Exit {
        let total = plan.len();

        for (index, item) in plan.items().iter().enumerate().skip(from_index) {
            let mut phase = Some(if index == from_index {
                from_phase
            } else {
                Phase::Pick
            });

            while let Some(current) = phase {
                if self.stop_requested() {
                    self.pause_at(index, current, total, epoch);
                    return Exit::Paused;
                }

                if !self.advance_cursor(epoch, index, current) {
                    self.pause_at(index, current, total, epoch);
                    return Exit::Paused;
                }

                let task = format!("Step {}/{}: {}", index + 1, total, current.describe(item));
                self.store.set_robot(RunState::Running, task.as_str());
                self.store
                    .log(format!("Step {}: {}", index + 1, current.describe(item)));
                info!("{}", task);

                if let Err(e) = self.run_phase(current, item).await {
                    if self.epoch.load(Ordering::SeqCst) != epoch {
                        warn!("{} failed after reset: {}", task, e);
                        self.finish_reset();
                        return Exit::Paused;
                    }
                    error!("{} failed: {}", task, e);
                    self.store.set_robot(RunState::Error, task.as_str());
                    self.store
                        .log(format!("Step {}: {} failed: {}", index + 1, current, e));
                    return Exit::Failed;
                }

                phase = current.next();
                let (resume_index, resume_phase) = match phase {
                    Some(next) => (index, next),
                    None => (index + 1, Phase::Pick),
                };
                let last_phase_of_plan = resume_index >= total;

                if !last_phase_of_plan && self.stop_requested() {
                    self.pause_at(resume_index, resume_phase, total, epoch);
                    return Exit::Paused;
                }

                if !last_phase_of_plan && !self.phase_delay.is_zero() && self.wait_phase_delay().await {
                    self.pause_at(resume_index, resume_phase, total, epoch);
                    return Exit::Paused;
                }
            }
        }

        Exit::Completed
    }

    /// Sleep for the phase delay. `true` if a stop arrived meanwhile.
    async fn wait_phase_delay(&self) -> bool {
        let mut stop_rx = self.stop_tx.subscribe();
        let delay = tokio::time::sleep(self.phase_delay);
        tokio::pin!(delay);

        loop {
            if *stop_rx.borrow_and_update() {
                return true;
            }
            tokio::select! {
                _ = &mut delay => return self.stop_requested(),
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Point the cursor at `(index, phase)` unless a reset happened since `epoch`.
    fn advance_cursor(&self, epoch: u64, index: usize, phase: Phase) -> bool {
        let mut cursor = self.cursor.lock();
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return false;
        }
        cursor.current_index = index;
        cursor.phase = phase;
        true
    }

    fn finish_reset(&self) {
        self.store.set_robot(RunState::Idle, NO_TASK);
        self.store.log("Plan reset.");
        info!("Plan reset while running");
    }

    fn pause_at(&self, index: usize, phase: Phase, total: usize, epoch: u64) {
        {
            let mut cursor = self.cursor.lock();
            if self.epoch.load(Ordering::SeqCst) != epoch {
                drop(cursor);
                self.finish_reset();
                return;
            }
            *cursor = ExecutionCursor {
                current_index: index,
                paused: true,
                phase,
            };
        }
        self.store.set_robot(
            RunState::Stopped,
            format!("Paused at step {}/{}: {}", index + 1, total, phase),
        );
        self.store.log("Plan stopped by user.");
        info!("Plan paused at item {} phase {}", index, phase);
    }

    async fn run_phase(&self, phase: Phase, item: &PlanItem) -> Result<(), ActionError> {
        let motion = self.motion.as_ref();
        match phase {
            Phase::Pick => {
                self.translator.pick_part(motion, &item.part).await?;
                if let (Some(vision), Some(top)) = (&self.vision, self.detect_on_latest_frame().await) {
                    self.store
                        .publish_detection(vision.summarize(&item.part, top.as_ref()));
                }
                Ok(())
            }
            Phase::Test => {
                self.translator.goto_test_station(motion).await?;
                let result = self.measure().await;
                if result.is_failure() {
                    return Err(ActionError::MeasurementFailed(format!(
                        "{:?} for {}",
                        result.result, item.part
                    )));
                }
                Ok(())
            }
            Phase::Place => {
                self.translator.place_part(motion, &item.target_pad).await?;
                if let (Some(vision), Some(top)) = (&self.vision, self.detect_on_latest_frame().await) {
                    let verification =
                        vision.verify_placement(&item.target_pad, top.map(|d| d.bbox));
                    info!(
                        "Placement on {}: {:?} ({}%)",
                        verification.pad, verification.status, verification.accuracy_percent
                    );
                    self.store.publish_placement(verification);
                }
                Ok(())
            }
        }
    }

    /// `None` when no ready detector or no frame; otherwise the top detection, if any.
    async fn detect_on_latest_frame(&self) -> Option<Option<Detection>> {
        let vision = self.vision.as_ref()?;
        if !vision.is_ready() {
            return None;
        }
        let frame = self.frames.as_ref()?.latest_jpeg().await?;
        Some(vision.detect_top(frame).await)
    }

    async fn measure(&self) -> MeasurementResult {
        let result = match &self.test_station {
            Some(station) => station.measure().await,
            None => {
                warn!("No test station configured");
                MeasurementResult::no_service()
            }
        };
        self.store.record_measurement(result.clone());
        self.store.log(format!(
            "Measurement: {} ({:?})",
            result.value_text, result.result
        ));
        result
    }
}
