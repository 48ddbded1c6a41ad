//! Configuration System using Figment
//!
//! Configuration is layered from:
//! 1. Compiled defaults
//! 2. An optional TOML file (`pnp.toml` by default)
//! 3. Environment variables prefixed with `PNP_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! PNP_APPLICATION__SIMULATED=false
//! PNP_MOTION__PORT=/dev/ttyACM1
//! PNP_HEIGHTS__SAFE_Z=6.5
//! PNP_VISION__CONFIDENCE_THRESHOLD=0.5
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! simulated = false
//!
//! [motion]
//! port = "/dev/ttyACM0"
//! baud_rate = 115200
//!
//! [coordinates.feeders]
//! R1 = { x = 50.0, y = 50.0 }
//!
//! [coordinates.pads]
//! A = { x = 100.0, y = 50.0, z = -1.0 }
//!
//! [vision.pad_pixels]
//! A = [320, 240]
//! ```

use crate::error::{AppResult, PnpError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "pnp.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Motion controller (GRBL) settings
    pub motion: MotionConfig,
    /// Component test station settings
    pub test_station: TestStationConfig,
    /// Z heights used by the action translator
    pub heights: Heights,
    /// Action translator behaviour
    pub actions: ActionsConfig,
    /// Machine coordinate tables
    pub coordinates: CoordinateTable,
    /// Detector and placement verification settings
    pub vision: VisionConfig,
    /// Plan executor settings
    pub executor: ExecutorConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Use simulated backends instead of serial hardware
    pub simulated: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "SMD Pick&Place".to_string(),
            log_level: "info".to_string(),
            simulated: true,
        }
    }
}

/// GRBL motion controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Serial port path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Status polling period
    pub poll_interval_ms: u64,
    /// Deadline for an `ok`/`error` reply to a command
    pub ack_timeout_ms: u64,
    /// Lines scanned for a `<...>` status frame
    pub status_scan_lines: usize,
    /// Per-line read timeout while scanning for a status frame
    pub status_line_timeout_ms: u64,
    /// Wait after opening the port before reading the greeting
    pub startup_delay_ms: u64,
    /// Wait after the soft-reset byte
    pub reset_delay_ms: u64,
    /// Artificial command latency of the simulated backend
    pub simulated_command_delay_ms: u64,
    /// Upper X bound of the simulated trajectory
    pub sim_x_max: f64,
    /// Y value at which the simulated trajectory wraps to zero
    pub sim_y_wrap: f64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 115_200,
            poll_interval_ms: 200,
            ack_timeout_ms: 1500,
            status_scan_lines: 8,
            status_line_timeout_ms: 100,
            startup_delay_ms: 2000,
            reset_delay_ms: 1000,
            simulated_command_delay_ms: 50,
            sim_x_max: 50.0,
            sim_y_wrap: 200.0,
        }
    }
}

impl MotionConfig {
    /// Status polling period as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Acknowledgement deadline as a `Duration`
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Test station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestStationConfig {
    /// Whether a test station is attached at all
    pub enabled: bool,
    /// Serial port path
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Deadline for a full measurement response
    pub measure_timeout_ms: u64,
    /// Live-view polling period
    pub poll_interval_ms: u64,
    /// Wait after opening the port (the board resets on connect)
    pub startup_delay_ms: u64,
}

impl Default for TestStationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            measure_timeout_ms: 10_000,
            poll_interval_ms: 1000,
            startup_delay_ms: 2000,
        }
    }
}

/// Z heights (mm)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct Heights {
    /// Travel height
    pub safe_z: f64,
    /// Default pick depth
    pub pick_z: f64,
    /// Default place depth
    pub place_z: f64,
}

impl Default for Heights {
    fn default() -> Self {
        Self {
            safe_z: 5.0,
            pick_z: -1.0,
            place_z: -1.0,
        }
    }
}

/// What the action translator does with a part or pad missing from the tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnmappedPolicy {
    /// Log a warning and report success without moving.
    #[default]
    Skip,
    /// Fail the action.
    Reject,
}

/// Action translator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    /// Feed rate appended to every move when set
    pub feed_rate: Option<u32>,
    /// Handling of unmapped parts and pads
    pub unmapped_policy: UnmappedPolicy,
}

/// A machine coordinate (mm). `z` overrides the configured depth when present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// X position
    pub x: f64,
    /// Y position
    pub y: f64,
    /// Optional depth override
    #[serde(default)]
    pub z: Option<f64>,
}

impl Coordinate {
    /// Coordinate without a depth override.
    pub fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }
}

/// Feeder, pad and test-station coordinates. Keys are matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinateTable {
    /// part -> feeder position
    pub feeders: HashMap<String, Coordinate>,
    /// pad label -> place position
    pub pads: HashMap<String, Coordinate>,
    /// Test station position
    pub test_station: Coordinate,
}

/// Feeders and pads start empty. Every entry comes from configuration.
impl Default for CoordinateTable {
    fn default() -> Self {
        Self {
            feeders: HashMap::new(),
            pads: HashMap::new(),
            test_station: Coordinate::xy(0.0, 0.0),
        }
    }
}

impl CoordinateTable {
    /// Feeder coordinate for `part`, case-insensitive.
    pub fn feeder(&self, part: &str) -> Option<Coordinate> {
        lookup(&self.feeders, part)
    }

    /// Place coordinate for `pad`, case-insensitive.
    pub fn pad(&self, pad: &str) -> Option<Coordinate> {
        lookup(&self.pads, pad)
    }
}

fn lookup<V: Copy>(table: &HashMap<String, V>, key: &str) -> Option<V> {
    let key = key.trim();
    table.get(key).copied().or_else(|| {
        table
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| *v)
    })
}

/// Detector and placement verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    /// Model location handed to the detector collaborator
    pub model_path: String,
    /// Detections below this score are ignored
    pub confidence_threshold: f32,
    /// Placement tolerance in pixels
    pub tolerance_px: f64,
    /// Display names indexed by class id
    pub class_names: Vec<String>,
    /// pad label -> expected pixel center. No default calibration.
    pub pad_pixels: HashMap<String, [i32; 2]>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            model_path: "models/best.onnx".to_string(),
            confidence_threshold: 0.6,
            tolerance_px: 30.0,
            class_names: vec!["resistor".to_string(), "diode".to_string()],
            pad_pixels: HashMap::new(),
        }
    }
}

/// Plan executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Pause between phases; the stop signal is checked while waiting
    pub phase_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self { phase_delay_ms: 0 }
    }
}

impl Settings {
    /// Load configuration from `path` (or `pnp.toml` if present) and `PNP_` env vars.
    pub fn load(path: Option<&Path>) -> AppResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));

        match path {
            Some(path) => figment = figment.merge(Toml::file_exact(path)),
            None => {
                if Path::new(DEFAULT_CONFIG_FILE).exists() {
                    figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE));
                }
            }
        }

        let settings: Settings = figment
            .merge(Env::prefixed("PNP_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from a TOML string layered over defaults. Environment is not consulted.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::string(toml))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject semantically invalid values.
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: &str| Err(PnpError::Configuration(msg.to_string()));

        if self.motion.baud_rate == 0 || self.test_station.baud_rate == 0 {
            return invalid("baud_rate must be positive");
        }
        if self.motion.poll_interval_ms == 0 || self.test_station.poll_interval_ms == 0 {
            return invalid("poll_interval_ms must be positive");
        }
        if self.motion.ack_timeout_ms == 0 || self.test_station.measure_timeout_ms == 0 {
            return invalid("device timeouts must be positive");
        }
        if self.motion.status_scan_lines == 0 {
            return invalid("status_scan_lines must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.vision.confidence_threshold) {
            return invalid("confidence_threshold must be within [0, 1]");
        }
        if !(self.vision.tolerance_px > 0.0) {
            return invalid("tolerance_px must be positive");
        }
        if !(self.motion.sim_x_max > 0.0 && self.motion.sim_y_wrap > 0.0) {
            return invalid("simulated trajectory bounds must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert!(settings.application.simulated);
        assert_eq!(settings.motion.baud_rate, 115_200);
        assert_eq!(settings.motion.ack_timeout(), Duration::from_millis(1500));
        assert_eq!(settings.heights.safe_z, 5.0);
        assert!(settings.vision.pad_pixels.is_empty());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [application]
            simulated = false

            [heights]
            safe_z = 7.5

            [actions]
            unmapped_policy = "reject"
            feed_rate = 1200

            [coordinates.feeders]
            d1 = { x = 12.0, y = 30.0, z = -2.0 }

            [vision.pad_pixels]
            A = [320, 240]
            "#,
        )
        .unwrap();

        assert!(!settings.application.simulated);
        assert_eq!(settings.heights.safe_z, 7.5);
        assert_eq!(settings.heights.pick_z, -1.0);
        assert_eq!(settings.actions.unmapped_policy, UnmappedPolicy::Reject);
        assert_eq!(settings.actions.feed_rate, Some(1200));
        assert_eq!(
            settings.coordinates.feeder("D1"),
            Some(Coordinate {
                x: 12.0,
                y: 30.0,
                z: Some(-2.0)
            })
        );
        assert_eq!(settings.vision.pad_pixels.get("A"), Some(&[320, 240]));
    }

    #[test]
    fn test_example_config_parses() {
        let settings = Settings::from_toml_str(include_str!("../config/pnp.example.toml")).unwrap();
        assert_eq!(settings.coordinates.pad("b"), Some(Coordinate::xy(120.0, 50.0)));
        assert_eq!(settings.coordinates.feeder("D1").and_then(|c| c.z), Some(-1.5));
        assert_eq!(settings.actions.unmapped_policy, UnmappedPolicy::Skip);
    }

    #[test]
    fn test_invalid_tolerance_rejected() {
        let err = Settings::from_toml_str("[vision]\ntolerance_px = 0.0\n").unwrap_err();
        assert!(matches!(err, PnpError::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[motion]\nport = \"/dev/ttyACM7\"\npoll_interval_ms = 250").unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.motion.port, "/dev/ttyACM7");
        assert_eq!(settings.motion.poll_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = Settings::load(Some(Path::new("/nonexistent/pnp.toml"))).unwrap_err();
        assert!(matches!(err, PnpError::Config(_)));
    }
}
