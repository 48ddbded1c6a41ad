//! Device channel implementations
//!
//! A device channel is a line-oriented transport shared by the motion and
//! test-station protocols. It owns connect/disconnect and read/write with
//! timeouts; protocol parsing lives in the backends under `hardware`.

pub mod mock;
pub mod serial_adapter;

pub use mock::MockChannel;
pub use serial_adapter::SerialChannel;

use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;

/// Per-line timeout used by [`DeviceChannel::drain`].
pub const DRAIN_LINE_TIMEOUT: Duration = Duration::from_millis(50);

/// Line-oriented device transport.
#[async_trait]
pub trait DeviceChannel: Send {
    /// Port path or other identifier, for logs and connection flags.
    fn port_name(&self) -> &str;

    /// Whether `open` succeeded and `close` has not been called since.
    fn is_open(&self) -> bool;

    /// Open the underlying port.
    async fn open(&mut self) -> Result<(), TransportError>;

    /// Close the port. Idempotent.
    async fn close(&mut self);

    /// Write raw bytes without a terminator.
    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Write `text` followed by a newline.
    async fn write_line(&mut self, text: &str) -> Result<(), TransportError> {
        let mut line = Vec::with_capacity(text.len() + 1);
        line.extend_from_slice(text.as_bytes());
        line.push(b'\n');
        self.write_bytes(&line).await
    }

    /// Read one trimmed line. `Ok(None)` when nothing complete arrived in time.
    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError>;

    /// Discard buffered input that has not been read yet.
    async fn clear_input(&mut self) -> Result<(), TransportError>;

    /// Read and discard up to `max_lines` pending lines. Returns how many were dropped.
    async fn drain(&mut self, max_lines: usize) -> usize {
        let mut dropped = 0;
        for _ in 0..max_lines {
            match self.read_line(DRAIN_LINE_TIMEOUT).await {
                Ok(Some(_)) => dropped += 1,
                _ => break,
            }
        }
        dropped
    }
}
