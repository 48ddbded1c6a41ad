//! Action Translator
//!
//! Turns logical actions into ordered G-code instructions using the
//! configured coordinate tables:
//!
//! ```text
//! pick R1  ->  G0 Z5.000 / G0 X50.000 Y50.000 / G0 Z-1.000 / M8 / G0 Z5.000
//! place A  ->  G0 Z5.000 / G0 X100.000 Y50.000 / G0 Z-1.000 / M9 / G0 Z5.000
//! ```
//!
//! Every instruction must be acknowledged before the next one is sent; the
//! first refusal aborts the action.

use crate::config::{ActionsConfig, Coordinate, CoordinateTable, Heights, Settings, UnmappedPolicy};
use crate::error::ActionError;
use crate::hardware::MotionBackend;
use std::fmt;
use tracing::{debug, warn};

/// Rapid move with any subset of axes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveCommand {
    /// Target X
    pub x: Option<f64>,
    /// Target Y
    pub y: Option<f64>,
    /// Target Z
    pub z: Option<f64>,
    /// Feed rate
    pub feed: Option<u32>,
}

impl MoveCommand {
    /// Z-only move.
    pub fn z(z: f64) -> Self {
        Self {
            z: Some(z),
            ..Self::default()
        }
    }

    /// XY move.
    pub fn xy(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }

    /// Attach a feed rate.
    pub fn with_feed(mut self, feed: Option<u32>) -> Self {
        self.feed = feed;
        self
    }
}

impl fmt::Display for MoveCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "G0")?;
        if let Some(x) = self.x {
            write!(f, " X{:.3}", x)?;
        }
        if let Some(y) = self.y {
            write!(f, " Y{:.3}", y)?;
        }
        if let Some(z) = self.z {
            write!(f, " Z{:.3}", z)?;
        }
        if let Some(feed) = self.feed {
            write!(f, " F{}", feed)?;
        }
        Ok(())
    }
}

/// One low-level motion instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionInstruction {
    /// `G0 ...`
    Rapid(MoveCommand),
    /// Vacuum on (`M8`)
    VacuumOn,
    /// Vacuum off (`M9`)
    VacuumOff,
}

impl fmt::Display for MotionInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rapid(m) => fmt::Display::fmt(m, f),
            Self::VacuumOn => f.write_str("M8"),
            Self::VacuumOff => f.write_str("M9"),
        }
    }
}

/// Maps pick/place/test-station actions onto motion instructions.
#[derive(Debug, Clone)]
pub struct ActionTranslator {
    table: CoordinateTable,
    heights: Heights,
    feed_rate: Option<u32>,
    policy: UnmappedPolicy,
}

impl ActionTranslator {
    /// Translator over `table`.
    pub fn new(table: CoordinateTable, heights: Heights, actions: &ActionsConfig) -> Self {
        Self {
            table,
            heights,
            feed_rate: actions.feed_rate,
            policy: actions.unmapped_policy,
        }
    }

    /// Translator configured from `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings.coordinates.clone(),
            settings.heights,
            &settings.actions,
        )
    }

    /// Unmapped part/pad policy in effect.
    pub fn policy(&self) -> UnmappedPolicy {
        self.policy
    }

    fn rapid(&self, m: MoveCommand) -> MotionInstruction {
        MotionInstruction::Rapid(m.with_feed(self.feed_rate))
    }

    fn visit(&self, at: Coordinate, depth: f64, tool: MotionInstruction) -> Vec<MotionInstruction> {
        vec![
            self.rapid(MoveCommand::z(self.heights.safe_z)),
            self.rapid(MoveCommand::xy(at.x, at.y)),
            self.rapid(MoveCommand::z(at.z.unwrap_or(depth))),
            tool,
            self.rapid(MoveCommand::z(self.heights.safe_z)),
        ]
    }

    /// Instructions for picking `part`. `Ok(None)` when unmapped under `skip`.
    pub fn pick_sequence(&self, part: &str) -> Result<Option<Vec<MotionInstruction>>, ActionError> {
        match self.table.feeder(part) {
            Some(at) => Ok(Some(self.visit(
                at,
                self.heights.pick_z,
                MotionInstruction::VacuumOn,
            ))),
            None => match self.policy {
                UnmappedPolicy::Skip => Ok(None),
                UnmappedPolicy::Reject => Err(ActionError::UnmappedPart(part.to_string())),
            },
        }
    }

    /// Instructions for placing onto `pad`. `Ok(None)` when unmapped under `skip`.
    pub fn place_sequence(&self, pad: &str) -> Result<Option<Vec<MotionInstruction>>, ActionError> {
        match self.table.pad(pad) {
            Some(at) => Ok(Some(self.visit(
                at,
                self.heights.place_z,
                MotionInstruction::VacuumOff,
            ))),
            None => match self.policy {
                UnmappedPolicy::Skip => Ok(None),
                UnmappedPolicy::Reject => Err(ActionError::UnmappedPad(pad.to_string())),
            },
        }
    }

    /// Instructions for travelling to the test station at safe height.
    pub fn test_station_sequence(&self) -> Vec<MotionInstruction> {
        let at = self.table.test_station;
        vec![
            self.rapid(MoveCommand::z(self.heights.safe_z)),
            self.rapid(MoveCommand::xy(at.x, at.y)),
        ]
    }

    /// Pick `part` with `motion`.
    pub async fn pick_part(&self, motion: &dyn MotionBackend, part: &str) -> Result<(), ActionError> {
        match self.pick_sequence(part)? {
            Some(seq) => run_sequence(motion, &seq).await,
            None => {
                warn!("No feeder coordinate for '{}', skipping pick", part);
                Ok(())
            }
        }
    }

    /// Place the held part onto `pad` with `motion`.
    pub async fn place_part(&self, motion: &dyn MotionBackend, pad: &str) -> Result<(), ActionError> {
        match self.place_sequence(pad)? {
            Some(seq) => run_sequence(motion, &seq).await,
            None => {
                warn!("No coordinate for pad '{}', skipping place", pad);
                Ok(())
            }
        }
    }

    /// Move to the test station with `motion`.
    pub async fn goto_test_station(&self, motion: &dyn MotionBackend) -> Result<(), ActionError> {
        run_sequence(motion, &self.test_station_sequence()).await
    }
}

/// Send `seq` in order, stopping at the first unacknowledged instruction.
pub async fn run_sequence(
    motion: &dyn MotionBackend,
    seq: &[MotionInstruction],
) -> Result<(), ActionError> {
    for instruction in seq {
        let command = instruction.to_string();
        if !motion.send_command(&command).await {
            return Err(ActionError::CommandFailed(command));
        }
        debug!("Acknowledged: {}", command);
    }
    Ok(())
}
