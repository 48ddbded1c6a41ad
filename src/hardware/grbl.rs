//! GRBL motion controller over a device channel.
//!
//! Protocol summary:
//! - commands are newline-terminated G-code; the controller answers `ok`,
//!   `error:<n>`, or an `ALARM:<n>` line
//! - `?` requests a realtime status frame `<STATE|MPos:x,y,z|...>`
//! - `0x18` (Ctrl-X) is a soft reset
//!
//! An error or alarm reply latches [`MotionState::Alarm`] until the next
//! status frame is parsed.

use super::{DeviceStatus, MotionBackend, MotionState, Position};
use crate::adapters::{DeviceChannel, SerialChannel};
use crate::config::MotionConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Soft reset byte
pub const SOFT_RESET: u8 = 0x18;

/// Realtime status request
pub const STATUS_REQUEST: &[u8] = b"?";

const GREETING_LINES: usize = 5;
const GREETING_LINE_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_AFTER_RESET: usize = 20;

static STATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^<(\w+)").expect("valid status state regex"));
static MPOS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"MPos:([-\d.]+),([-\d.]+),([-\d.]+)").expect("valid MPos regex")
});

/// Classification of one line read while waiting for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// `ok`
    Ack,
    /// `error:...` or anything mentioning an alarm
    Fault,
}

/// Classify an acknowledgement candidate. `None` for unrelated lines.
pub fn classify_reply(line: &str) -> Option<Reply> {
    let lower = line.trim().to_ascii_lowercase();
    if lower.starts_with("ok") {
        Some(Reply::Ack)
    } else if lower.starts_with("error") || lower.contains("alarm") {
        Some(Reply::Fault)
    } else {
        None
    }
}

/// Parse a `<STATE|MPos:x,y,z|...>` frame. `None` if `line` is not a frame.
///
/// Missing or malformed fields fall back to `Unknown` and the origin.
pub fn parse_status_frame(line: &str) -> Option<(MotionState, Position)> {
    let line = line.trim();
    if !line.starts_with('<') {
        return None;
    }

    let state = STATE_RE
        .captures(line)
        .map(|c| MotionState::from_token(&c[1]))
        .unwrap_or_default();

    let position = MPOS_RE
        .captures(line)
        .and_then(|c| {
            Some(Position::new(
                c[1].parse().ok()?,
                c[2].parse().ok()?,
                c[3].parse().ok()?,
            ))
        })
        .unwrap_or_default();

    Some((state, position))
}

#[derive(Debug, Default)]
struct AckState {
    last_ok: Option<bool>,
    last_command: Option<String>,
    alarm: bool,
}

/// GRBL motion backend.
pub struct GrblController {
    channel: AsyncMutex<Box<dyn DeviceChannel>>,
    port: String,
    baud_rate: u32,
    ack_timeout: Duration,
    status_scan_lines: usize,
    status_line_timeout: Duration,
    startup_delay: Duration,
    reset_delay: Duration,
    connected: AtomicBool,
    ack: Mutex<AckState>,
}

impl GrblController {
    /// Controller over an arbitrary channel, with timings from `config`.
    pub fn new(channel: Box<dyn DeviceChannel>, config: &MotionConfig) -> Self {
        Self {
            port: channel.port_name().to_string(),
            channel: AsyncMutex::new(channel),
            baud_rate: config.baud_rate,
            ack_timeout: config.ack_timeout(),
            status_scan_lines: config.status_scan_lines,
            status_line_timeout: Duration::from_millis(config.status_line_timeout_ms),
            startup_delay: Duration::from_millis(config.startup_delay_ms),
            reset_delay: Duration::from_millis(config.reset_delay_ms),
            connected: AtomicBool::new(false),
            ack: Mutex::new(AckState::default()),
        }
    }

    /// Controller on the configured serial port.
    pub fn serial(config: &MotionConfig) -> Self {
        Self::new(
            Box::new(SerialChannel::new(&config.port, config.baud_rate)),
            config,
        )
    }

    fn record_ack(&self, command: &str, ok: bool) {
        let mut ack = self.ack.lock();
        ack.last_ok = Some(ok);
        ack.last_command = Some(command.to_string());
    }

    fn latch_alarm(&self) {
        self.ack.lock().alarm = true;
    }

    fn status_with_ack(&self, status: DeviceStatus) -> DeviceStatus {
        let ack = self.ack.lock();
        status.with_last_ack(ack.last_ok, ack.last_command.clone())
    }
}

#[async_trait]
impl MotionBackend for GrblController {
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
            warn!("GRBL connection to {} failed: {}", self.port, e);
            return Err(e);
        }

        sleep(self.startup_delay).await;

        let mut greeting = Vec::new();
        for _ in 0..GREETING_LINES {
            match channel.read_line(GREETING_LINE_TIMEOUT).await {
                Ok(Some(line)) if !line.is_empty() => greeting.push(line),
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    channel.close().await;
                    return Err(e);
                }
            }
        }
        if !greeting.is_empty() {
            info!("GRBL startup: {}", greeting.join(" | "));
        }

        if let Err(e) = channel.write_bytes(&[SOFT_RESET]).await {
            channel.close().await;
            return Err(e);
        }
        sleep(self.reset_delay).await;
        let dropped = channel.drain(DRAIN_AFTER_RESET).await;
        debug!("Drained {} lines after soft reset", dropped);

        *self.ack.lock() = AckState::default();
        self.connected.store(true, Ordering::SeqCst);
        info!("Connected to GRBL on {} @ {}", self.port, self.baud_rate);
        Ok(())
    }

    async fn disconnect(&self) {
        self.channel.lock().await.close().await;
        self.connected.store(false, Ordering::SeqCst);
        info!("Disconnected from GRBL on {}", self.port);
    }

    async fn send_command(&self, command: &str) -> bool {
        let command = command.trim();
        let mut channel = self.channel.lock().await;

        if !channel.is_open() {
            warn!("GRBL not connected, dropping '{}'", command);
            self.record_ack(command, false);
            return false;
        }

        if let Err(e) = channel.write_line(command).await {
            warn!("GRBL send error for '{}': {}", command, e);
            self.record_ack(command, false);
            return false;
        }

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!("Timeout waiting for ok: {}", command);
                self.record_ack(command, false);
                return false;
            }

            match channel.read_line(remaining).await {
                Ok(Some(line)) => match classify_reply(&line) {
                    Some(Reply::Ack) => {
                        debug!("G-code ok: {}", command);
                        self.record_ack(command, true);
                        return true;
                    }
                    Some(Reply::Fault) => {
                        warn!("G-code error for '{}': {}", command, line);
                        self.latch_alarm();
                        self.record_ack(command, false);
                        return false;
                    }
                    None => debug!("Ignoring '{}' while waiting for ok", line),
                },
                Ok(None) => {}
                Err(e) => {
                    warn!("GRBL read error for '{}': {}", command, e);
                    self.record_ack(command, false);
                    return false;
                }
            }
        }
    }

    async fn query_status(&self) -> DeviceStatus {
        let mut channel = self.channel.lock().await;
        if !channel.is_open() {
            return self.status_with_ack(DeviceStatus::disconnected());
        }

        if let Err(e) = channel.write_bytes(STATUS_REQUEST).await {
            warn!("GRBL status request failed: {}", e);
            return self.status_with_ack(DeviceStatus::unknown());
        }

        for _ in 0..self.status_scan_lines {
            match channel.read_line(self.status_line_timeout).await {
                Ok(Some(line)) => {
                    if let Some((state, position)) = parse_status_frame(&line) {
                        self.ack.lock().alarm = state == MotionState::Alarm;
                        return self.status_with_ack(DeviceStatus::new(state, position));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("GRBL status read failed: {}", e);
                    break;
                }
            }
        }

        let state = if self.ack.lock().alarm {
            MotionState::Alarm
        } else {
            MotionState::Unknown
        };
        self.status_with_ack(DeviceStatus::new(state, Position::default()))
    }
}
