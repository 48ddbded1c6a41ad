//! Vision verification
//!
//! The detector itself is an opaque collaborator: anything implementing
//! [`Detector`] turns an encoded camera frame into scored bounding boxes.
//! [`VisionVerifier`] wraps it, keeps the confidence threshold and class
//! names, and scores placements against the calibrated pad pixel table.

pub mod placement;

pub use placement::{bbox_center, PadPixelTable, PlacementStatus, PlacementVerification};

use crate::config::VisionConfig;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Axis-aligned bounding box in pixels, `(x1, y1)` top-left to `(x2, y2)` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Left
    pub x1: i32,
    /// Top
    pub y1: i32,
    /// Right
    pub x2: i32,
    /// Bottom
    pub y2: i32,
}

impl BoundingBox {
    /// Construct from corner coordinates.
    pub const fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

/// One detector output. Produced per frame and dropped after verification.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Bounding box
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    /// Confidence in [0, 1]
    pub score: f32,
    /// Model class id
    pub class_id: u32,
}

/// What the PICK phase publishes about the component it just picked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionSummary {
    /// Plan part identifier
    pub part: String,
    /// Class name of the top detection, `None` if nothing was detected
    pub class_name: Option<String>,
    /// Score of the top detection
    pub confidence: Option<f32>,
}

/// Camera collaborator.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Latest JPEG-encoded frame, if the camera has one.
    async fn latest_jpeg(&self) -> Option<Bytes>;
}

/// Object-detection collaborator. Inference is CPU-bound and runs on a blocking thread.
pub trait Detector: Send + Sync {
    /// Whether the model is loaded.
    fn is_ready(&self) -> bool;

    /// Run inference on one encoded frame.
    fn detect(&self, frame: &[u8]) -> Vec<Detection>;
}

/// Detector wrapper that applies the confidence threshold and scores placements.
#[derive(Clone)]
pub struct VisionVerifier {
    detector: Arc<dyn Detector>,
    confidence_threshold: f32,
    tolerance_px: f64,
    class_names: Vec<String>,
    pads: PadPixelTable,
}

impl std::fmt::Debug for VisionVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionVerifier")
            .field("confidence_threshold", &self.confidence_threshold)
            .field("tolerance_px", &self.tolerance_px)
            .field("pads", &self.pads.len())
            .finish()
    }
}

impl VisionVerifier {
    /// Wrap `detector` with the thresholds and calibration from `config`.
    pub fn new(detector: Arc<dyn Detector>, config: &VisionConfig) -> Self {
        Self {
            detector,
            confidence_threshold: config.confidence_threshold,
            tolerance_px: config.tolerance_px,
            class_names: config.class_names.clone(),
            pads: PadPixelTable::from_config(&config.pad_pixels),
        }
    }

    /// Whether the wrapped detector can run.
    pub fn is_ready(&self) -> bool {
        self.detector.is_ready()
    }

    /// Configured placement tolerance.
    pub fn tolerance_px(&self) -> f64 {
        self.tolerance_px
    }

    /// Display name for a class id.
    pub fn class_name(&self, class_id: u32) -> String {
        self.class_names
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| format!("id{}", class_id))
    }

    /// Highest-scoring detection at or above the confidence threshold.
    pub async fn detect_top(&self, frame: Bytes) -> Option<Detection> {
        if !self.detector.is_ready() {
            return None;
        }

        let detector = self.detector.clone();
        let detections = match tokio::task::spawn_blocking(move || detector.detect(&frame)).await
        {
            Ok(detections) => detections,
            Err(e) => {
                warn!("Detector task failed: {}", e);
                return None;
            }
        };

        let top = pick_top(&detections, self.confidence_threshold);
        debug!(
            "Detector returned {} boxes, top: {:?}",
            detections.len(),
            top
        );
        top
    }

    /// Score a detected box against the expected pixel center of `pad`.
    pub fn verify_placement(
        &self,
        pad: &str,
        detected: Option<BoundingBox>,
    ) -> PlacementVerification {
        match detected {
            Some(bbox) => self.pads.verify(pad, bbox, self.tolerance_px),
            None => PlacementVerification::no_detection(pad),
        }
    }

    /// Summary of the top detection for the PICK phase.
    pub fn summarize(&self, part: &str, top: Option<&Detection>) -> DetectionSummary {
        DetectionSummary {
            part: part.to_string(),
            class_name: top.map(|d| self.class_name(d.class_id)),
            confidence: top.map(|d| d.score),
        }
    }
}

fn pick_top(detections: &[Detection], threshold: f32) -> Option<Detection> {
    detections
        .iter()
        .filter(|d| d.score >= threshold)
        .max_by(|a, b| a.score.total_cmp(&b.score))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedDetector(Vec<Detection>);

    impl Detector for FixedDetector {
        fn is_ready(&self) -> bool {
            true
        }

        fn detect(&self, _frame: &[u8]) -> Vec<Detection> {
            self.0.clone()
        }
    }

    fn det(score: f32, class_id: u32) -> Detection {
        Detection {
            bbox: BoundingBox::new(0, 0, 10, 10),
            score,
            class_id,
        }
    }

    #[tokio::test]
    async fn test_detect_top_picks_highest_above_threshold() {
        let detector = FixedDetector(vec![det(0.65, 0), det(0.91, 1), det(0.4, 0)]);
        let verifier = VisionVerifier::new(Arc::new(detector), &VisionConfig::default());

        let top = verifier.detect_top(Bytes::from_static(b"jpeg")).await.unwrap();
        assert_eq!(top.class_id, 1);
        assert_eq!(verifier.class_name(top.class_id), "diode");
        assert_eq!(verifier.class_name(7), "id7");
    }

    #[tokio::test]
    async fn test_detect_top_none_below_threshold() {
        let detector = FixedDetector(vec![det(0.3, 0)]);
        let verifier = VisionVerifier::new(Arc::new(detector), &VisionConfig::default());
        assert!(verifier.detect_top(Bytes::new()).await.is_none());
    }

    #[test]
    fn test_verify_without_detection() {
        let config = VisionConfig {
            pad_pixels: HashMap::from([("A".to_string(), [100, 100])]),
            ..VisionConfig::default()
        };
        let verifier = VisionVerifier::new(Arc::new(FixedDetector(vec![])), &config);

        let result = verifier.verify_placement("a", None);
        assert_eq!(result.status, PlacementStatus::NoDetection);
        assert_eq!(result.accuracy_percent, 0.0);
        assert_eq!(result.pad, "A");

        let result = verifier.verify_placement("A", Some(BoundingBox::new(90, 90, 110, 110)));
        assert_eq!(result.status, PlacementStatus::Ok);
    }
}
