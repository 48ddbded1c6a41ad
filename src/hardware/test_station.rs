//! Component test station over a device channel.
//!
//! The station firmware measures when it receives the trigger byte `b` and
//! prints a few lines of free text. Those lines are collected until a terminal
//! marker or the deadline and then classified:
//!
//! ```text
//! ADC=123.4  Vout=0.1234 V  R2=456.7 Ohm   Diyot yonu DUZ
//! Olcum bitti
//! ```

use super::TestStationBackend;
use crate::adapters::{DeviceChannel, SerialChannel};
use crate::config::TestStationConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Measurement trigger
pub const TRIGGER: &[u8] = b"b";

/// Printed when the measurement completed
pub const MARKER_FINISHED: &str = "Olcum bitti";
/// Diode in reverse orientation, printed as the last line
pub const MARKER_REVERSED: &str = "Diyot yonu TERS";
/// Diode in forward orientation
pub const MARKER_FORWARD: &str = "Diyot yonu DUZ";
/// No valid reading
pub const MARKER_INVALID: &str = "Gecerli olcum alinamadi";

static VOUT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Vout=([0-9]+(?:\.[0-9]+)?)").expect("valid Vout regex"));
static R2_KOHM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)R2=([0-9]+(?:\.[0-9]+)?)\s*kOhm").expect("valid R2 kOhm regex")
});
static R2_OHM_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)R2=([0-9]+(?:\.[0-9]+)?)\s*Ohm").expect("valid R2 Ohm regex")
});

/// Kind of component under test.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestMode {
    /// Nothing measured
    #[default]
    None,
    /// Resistor
    Resistor,
    /// Diode
    Diode,
}

impl std::str::FromStr for TestMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "resistor" => Ok(Self::Resistor),
            "diode" => Ok(Self::Diode),
            other => Err(format!("unknown test mode '{}'", other)),
        }
    }
}

/// Classification of one measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeasurementOutcome {
    /// Resistor measured
    Ok,
    /// Diode reversed (open circuit)
    DiodeReversed,
    /// Diode forward
    DiodeForward,
    /// Station could not take a valid reading
    Invalid,
    /// Station not connected
    NoConnection,
    /// Transport failure during the measurement
    Error,
    /// Response matched no known pattern
    Unknown,
    /// No test station is configured
    NoService,
}

/// Result of one triggered measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    /// Component kind
    pub mode: TestMode,
    /// Human readable value (`4.700 kOhm`, `OPEN`, `-`)
    pub value_text: String,
    /// Output voltage, 0 when not reported
    pub voltage: f64,
    /// Classification
    pub result: MeasurementOutcome,
}

impl MeasurementResult {
    fn placeholder(result: MeasurementOutcome) -> Self {
        Self {
            mode: TestMode::None,
            value_text: "-".to_string(),
            voltage: 0.0,
            result,
        }
    }

    /// Station not connected.
    pub fn no_connection() -> Self {
        Self::placeholder(MeasurementOutcome::NoConnection)
    }

    /// Transport failure.
    pub fn error() -> Self {
        Self::placeholder(MeasurementOutcome::Error)
    }

    /// No test station configured.
    pub fn no_service() -> Self {
        Self::placeholder(MeasurementOutcome::NoService)
    }

    /// Whether the executor must abort on this result.
    pub fn is_failure(&self) -> bool {
        self.result == MeasurementOutcome::Error
    }
}

/// Live-view sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    /// Raw 10-bit ADC count
    pub adc: u32,
    /// `adc * 5 / 1023`, two decimals
    pub voltage: f64,
}

impl LiveReading {
    /// Sample from a raw ADC count.
    pub fn from_adc(adc: u32) -> Self {
        let voltage = (f64::from(adc) * 5.0 / 1023.0 * 100.0).round() / 100.0;
        Self { adc, voltage }
    }
}

/// Whether `line` ends the response.
pub fn is_terminal_line(line: &str) -> bool {
    line.contains(MARKER_FINISHED) || line.contains(MARKER_REVERSED)
}

/// Classify a complete response.
///
/// Priority: reversed diode, invalid reading, forward diode, resistance.
/// Markers win over any numeric fields in the same text.
pub fn classify_response(text: &str) -> MeasurementResult {
    if text.contains(MARKER_REVERSED) {
        return MeasurementResult {
            mode: TestMode::Diode,
            value_text: "OPEN".to_string(),
            voltage: 0.0,
            result: MeasurementOutcome::DiodeReversed,
        };
    }

    if text.contains(MARKER_INVALID) {
        return MeasurementResult::placeholder(MeasurementOutcome::Invalid);
    }

    let voltage = VOUT_RE
        .captures(text)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(0.0);

    if text.contains(MARKER_FORWARD) {
        return MeasurementResult {
            mode: TestMode::Diode,
            value_text: "NOT OPEN".to_string(),
            voltage,
            result: MeasurementOutcome::DiodeForward,
        };
    }

    let resistance = if let Some(c) = R2_KOHM_RE.captures(text) {
        c[1].parse::<f64>().ok().map(|v| format!("{:.3} kOhm", v))
    } else if let Some(c) = R2_OHM_RE.captures(text) {
        c[1].parse::<f64>().ok().map(|v| format!("{:.1} Ohm", v))
    } else {
        None
    };

    match resistance {
        Some(value_text) => MeasurementResult {
            mode: TestMode::Resistor,
            value_text,
            voltage,
            result: MeasurementOutcome::Ok,
        },
        None => MeasurementResult {
            voltage,
            ..MeasurementResult::placeholder(MeasurementOutcome::Unknown)
        },
    }
}

/// Serial test-station backend.
pub struct TestStation {
    channel: AsyncMutex<Box<dyn DeviceChannel>>,
    port: String,
    measure_timeout: Duration,
    startup_delay: Duration,
    connected: AtomicBool,
}

impl TestStation {
    /// Station over an arbitrary channel, with timings from `config`.
    pub fn new(channel: Box<dyn DeviceChannel>, config: &TestStationConfig) -> Self {
        Self {
            port: channel.port_name().to_string(),
            channel: AsyncMutex::new(channel),
            measure_timeout: Duration::from_millis(config.measure_timeout_ms),
            startup_delay: Duration::from_millis(config.startup_delay_ms),
            connected: AtomicBool::new(false),
        }
    }

    /// Station on the configured serial port.
    pub fn serial(config: &TestStationConfig) -> Self {
        Self::new(
            Box::new(SerialChannel::new(&config.port, config.baud_rate)),
            config,
        )
    }
}

#[async_trait]
impl TestStationBackend for TestStation {
    fn port(&self) -> &str {
        &self.port
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut channel = self.channel.lock().await;
        if let Err(e) = channel.open().await {
            self.connected.store(false, Ordering::SeqCst);
            warn!("Test station connection to {} failed: {}", self.port, e);
            return Err(e);
        }
        // the board resets when the port opens
        sleep(self.startup_delay).await;
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to test station on {}", self.port);
        Ok(())
    }

    async fn disconnect(&self) {
        self.channel.lock().await.close().await;
        self.connected.store(false, Ordering::SeqCst);
        info!("Test station on {} disconnected", self.port);
    }

    async fn measure(&self) -> MeasurementResult {
        let mut channel = self.channel.lock().await;
        if !channel.is_open() {
            return MeasurementResult::no_connection();
        }

        if let Err(e) = channel.clear_input().await {
            debug!("Could not clear test station input: {}", e);
        }

        if let Err(e) = channel.write_bytes(TRIGGER).await {
            warn!("Measurement trigger failed: {}", e);
            return MeasurementResult::error();
        }

        let deadline = Instant::now() + self.measure_timeout;
        let mut lines: Vec<String> = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(
                    "Measurement deadline reached after {} lines",
                    lines.len()
                );
                break;
            }

            match channel.read_line(remaining).await {
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => {
                    let done = is_terminal_line(&line);
                    lines.push(line);
                    if done {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Measurement read failed: {}", e);
                    return MeasurementResult::error();
                }
            }
        }

        let result = classify_response(&lines.join("\n"));
        info!(
            "Measurement: {:?} {} ({} V)",
            result.result, result.value_text, result.voltage
        );
        result
    }

    async fn live_sample(&self) -> Option<LiveReading> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockChannel;

    fn config() -> TestStationConfig {
        TestStationConfig {
            startup_delay_ms: 0,
            ..TestStationConfig::default()
        }
    }

    #[test]
    fn test_reversed_diode_wins_over_numbers() {
        let result = classify_response("Vout=1.2000 V  R2=456.7 Ohm\nDiyot yonu TERS");
        assert_eq!(result.result, MeasurementOutcome::DiodeReversed);
        assert_eq!(result.value_text, "OPEN");
        assert_eq!(result.mode, TestMode::Diode);
        assert_eq!(result.voltage, 0.0);
    }

    #[test]
    fn test_invalid_reading() {
        let result = classify_response("Gecerli olcum alinamadi\nOlcum bitti");
        assert_eq!(result.result, MeasurementOutcome::Invalid);
        assert_eq!(result.value_text, "-");
    }

    #[test]
    fn test_forward_diode_keeps_voltage() {
        let result =
            classify_response("ADC=123.4  Vout=0.6120 V  R2=456.7 Ohm   Diyot yonu DUZ\nOlcum bitti");
        assert_eq!(result.result, MeasurementOutcome::DiodeForward);
        assert_eq!(result.value_text, "NOT OPEN");
        assert_eq!(result.voltage, 0.612);
    }

    #[test]
    fn test_resistor_formatting() {
        let result = classify_response("ADC=500  Vout=2.5 V  R2=4.7 kOhm\nOlcum bitti");
        assert_eq!(result.result, MeasurementOutcome::Ok);
        assert_eq!(result.mode, TestMode::Resistor);
        assert_eq!(result.value_text, "4.700 kOhm");
        assert_eq!(result.voltage, 2.5);

        let result = classify_response("R2=220 ohm");
        assert_eq!(result.value_text, "220.0 Ohm");
    }

    #[test]
    fn test_unrecognized_response() {
        let result = classify_response("hello");
        assert_eq!(result.result, MeasurementOutcome::Unknown);
        assert_eq!(result.value_text, "-");
    }

    #[test]
    fn test_live_reading_voltage() {
        assert_eq!(LiveReading::from_adc(1023).voltage, 5.0);
        assert_eq!(LiveReading::from_adc(105).voltage, 0.51);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_over_channel() {
        let channel = MockChannel::new("/dev/ttyUSB0").with_responder(|cmd| {
            assert_eq!(cmd, "b");
            vec![
                "Olcum basliyor".into(),
                "ADC=500  Vout=2.5 V  R2=4.7 kOhm".into(),
                "Olcum bitti".into(),
                "late line".into(),
            ]
        });
        let handle = channel.handle();
        handle.push_line("stale output");

        let station = TestStation::new(Box::new(channel), &config());
        station.connect().await.unwrap();

        let result = station.measure().await;
        assert_eq!(result.result, MeasurementOutcome::Ok);
        assert_eq!(result.value_text, "4.700 kOhm");
        assert_eq!(handle.writes(), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_deadline_without_terminal_marker() {
        let station = TestStation::new(Box::new(MockChannel::new("ts")), &config());
        station.connect().await.unwrap();

        let start = Instant::now();
        let result = station.measure().await;
        assert_eq!(result.result, MeasurementOutcome::Unknown);
        assert!(start.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_measure_without_connection() {
        let station = TestStation::new(Box::new(MockChannel::new("ts")), &config());
        assert_eq!(
            station.measure().await.result,
            MeasurementOutcome::NoConnection
        );
    }
}
