//! Placement scoring against calibrated pad pixel centers.
//!
//! Score is 100 at zero distance and falls linearly to 0 at twice the
//! tolerance. A placement passes when the distance is within tolerance.

use super::BoundingBox;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Verification outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlacementStatus {
    /// Within tolerance
    Ok,
    /// Outside tolerance
    Fail,
    /// Pad has no pixel calibration
    UnknownPad,
    /// Nothing was detected
    NoDetection,
}

/// Result of one placement check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementVerification {
    /// Pad label (upper case)
    pub pad: String,
    /// Outcome
    pub status: PlacementStatus,
    /// Score in [0, 100]
    pub accuracy_percent: f64,
    /// Center-to-target distance, when a target exists
    pub distance_px: Option<f64>,
}

impl PlacementVerification {
    /// Result for a frame without any usable detection.
    pub fn no_detection(pad: &str) -> Self {
        Self {
            pad: pad.trim().to_uppercase(),
            status: PlacementStatus::NoDetection,
            accuracy_percent: 0.0,
            distance_px: None,
        }
    }
}

/// Integer center of a bounding box, truncated toward zero.
///
/// Summed in `i64` so boxes near the `i32` limits cannot overflow.
pub fn bbox_center(bbox: BoundingBox) -> (i64, i64) {
    (
        (i64::from(bbox.x1) + i64::from(bbox.x2)) / 2,
        (i64::from(bbox.y1) + i64::from(bbox.y2)) / 2,
    )
}

/// Pad label -> expected pixel center. Labels are stored upper case.
#[derive(Debug, Clone, Default)]
pub struct PadPixelTable {
    centers: HashMap<String, (i32, i32)>,
}

impl PadPixelTable {
    /// Build from the configured `pad_pixels` map.
    pub fn from_config(pads: &HashMap<String, [i32; 2]>) -> Self {
        Self {
            centers: pads
                .iter()
                .map(|(label, [x, y])| (label.trim().to_uppercase(), (*x, *y)))
                .collect(),
        }
    }

    /// Number of calibrated pads.
    pub fn len(&self) -> usize {
        self.centers.len()
    }

    /// Whether no pad is calibrated.
    pub fn is_empty(&self) -> bool {
        self.centers.is_empty()
    }

    /// Compare the center of `bbox` with the target of `pad`.
    pub fn verify(&self, pad: &str, bbox: BoundingBox, tolerance_px: f64) -> PlacementVerification {
        let pad = pad.trim().to_uppercase();
        let Some(&(tx, ty)) = self.centers.get(&pad) else {
            return PlacementVerification {
                pad,
                status: PlacementStatus::UnknownPad,
                accuracy_percent: 0.0,
                distance_px: None,
            };
        };

        let (cx, cy) = bbox_center(bbox);
        let dx = (cx - i64::from(tx)) as f64;
        let dy = (cy - i64::from(ty)) as f64;
        let distance = dx.hypot(dy);
        let accuracy = (100.0 * (1.0 - distance / (2.0 * tolerance_px))).clamp(0.0, 100.0);

        PlacementVerification {
            pad,
            status: if distance <= tolerance_px {
                PlacementStatus::Ok
            } else {
                PlacementStatus::Fail
            },
            accuracy_percent: round2(accuracy),
            distance_px: Some(round2(distance)),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
