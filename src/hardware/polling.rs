//! Background polling loops.
//!
//! One task per device. Each publishes into its own sub-records of the
//! [`SharedStateStore`] and exits on its oneshot shutdown signal, clearing the
//! device's connection flag on the way out.

use super::{MotionBackend, TestStationBackend};
use crate::state::{Connection, Device, RunState, SharedStateStore, VisionSummary};
use crate::vision::{DetectionSummary, PlacementStatus, PlacementVerification};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// How long `stop` waits for the task to finish.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Running poller.
#[derive(Debug)]
pub struct PollerHandle {
    name: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Poller name, for logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Signal the task and wait up to [`STOP_TIMEOUT`] for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            match tokio::time::timeout(STOP_TIMEOUT, task).await {
                Ok(Ok(())) => info!("{} poller stopped", self.name),
                Ok(Err(e)) => warn!("{} poller task failed: {}", self.name, e),
                Err(_) => warn!("{} poller did not stop within {:?}", self.name, STOP_TIMEOUT),
            }
        }
    }
}

fn link(connected: bool, port: &str) -> Connection {
    if connected {
        Connection::up(port)
    } else {
        Connection::down()
    }
}

/// Vision record shown in simulated mode when no detector is wired.
pub fn simulated_vision(running: bool) -> VisionSummary {
    if running {
        VisionSummary {
            detection: Some(DetectionSummary {
                part: "R1".to_string(),
                class_name: Some("resistor".to_string()),
                confidence: Some(0.92),
            }),
            placement: Some(PlacementVerification {
                pad: "B".to_string(),
                status: PlacementStatus::Ok,
                accuracy_percent: 87.5,
                distance_px: None,
            }),
            updated_at: Some(Utc::now()),
        }
    } else {
        VisionSummary {
            updated_at: Some(Utc::now()),
            ..VisionSummary::default()
        }
    }
}

/// Poll the motion backend every `period` and publish its status.
///
/// With `synthesize_vision` the loop also publishes [`simulated_vision`] each tick.
pub fn spawn_motion_poller(
    motion: Arc<dyn MotionBackend>,
    store: SharedStateStore,
    period: Duration,
    synthesize_vision: bool,
) -> PollerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        store.set_connection(Device::Motion, link(motion.is_connected(), motion.port()));
        info!("Motion polling started every {:?}", period);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = interval.tick() => {
                    let status = motion.query_status().await;
                    store.publish_motion(status);
                    store.set_connection(
                        Device::Motion,
                        link(motion.is_connected(), motion.port()),
                    );

                    if synthesize_vision {
                        let running = store.run_state() == RunState::Running;
                        store.publish_vision(simulated_vision(running));
                    }
                }
            }
        }

        store.set_connection(Device::Motion, Connection::down());
    });

    PollerHandle {
        name: "motion",
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}

/// Refresh the test-station live view every `period`.
pub fn spawn_test_station_poller(
    station: Arc<dyn TestStationBackend>,
    store: SharedStateStore,
    period: Duration,
) -> PollerHandle {
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        store.set_connection(
            Device::TestStation,
            link(station.is_connected(), station.port()),
        );
        info!("Test station polling started every {:?}", period);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                _ = interval.tick() => {
                    if let Some(reading) = station.live_sample().await {
                        store.publish_live(reading);
                    }
                    store.set_connection(
                        Device::TestStation,
                        link(station.is_connected(), station.port()),
                    );
                }
            }
        }

        store.set_connection(Device::TestStation, Connection::down());
    });

    PollerHandle {
        name: "test_station",
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    }
}
