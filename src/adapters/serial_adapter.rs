//! Serial device channel over `tokio-serial`.
//!
//! Reads are buffered manually so that a read cancelled by its timeout never
//! loses bytes: partial lines stay in `pending` until the terminator arrives.

use super::DeviceChannel;
use crate::error::TransportError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(feature = "serial")]
use tokio::io::{AsyncReadExt, AsyncWriteExt};
#[cfg(feature = "serial")]
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Longest partial line kept while waiting for a terminator.
pub const MAX_LINE_LEN: usize = 4096;

/// RS-232/USB serial channel
pub struct SerialChannel {
    /// Port name (e.g., "/dev/ttyACM0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Bytes received but not yet returned as a line
    pending: Vec<u8>,

    #[cfg(feature = "serial")]
    stream: Option<SerialStream>,
}

impl SerialChannel {
    /// Create a closed channel for `port_name` at `baud_rate`.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            pending: Vec::new(),
            #[cfg(feature = "serial")]
            stream: None,
        }
    }

    /// Configured baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Split the first complete line off `pending`.
    fn take_line(&mut self) -> Option<String> {
        let idx = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=idx).collect();
        Some(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Append received bytes and return the first complete line, if any.
    /// Pending input past [`MAX_LINE_LEN`] without a terminator is discarded.
    #[cfg_attr(not(feature = "serial"), allow(dead_code))]
    fn accept(&mut self, bytes: &[u8]) -> Result<Option<String>, TransportError> {
        self.pending.extend_from_slice(bytes);
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        if self.pending.len() > MAX_LINE_LEN {
            warn!(
                "Dropping {} bytes from '{}' without a line terminator",
                self.pending.len(),
                self.port_name
            );
            self.pending.clear();
            return Err(TransportError::LineTooLong {
                port: self.port_name.clone(),
                limit: MAX_LINE_LEN,
            });
        }
        Ok(None)
    }
}

#[async_trait]
impl DeviceChannel for SerialChannel {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "serial")]
        {
            self.stream.is_some()
        }
        #[cfg(not(feature = "serial"))]
        {
            false
        }
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        #[cfg(feature = "serial")]
        {
            let stream = tokio_serial::new(&self.port_name, self.baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| TransportError::Open {
                    port: self.port_name.clone(),
                    baud_rate: self.baud_rate,
                    reason: e.to_string(),
                })?;

            self.pending.clear();
            self.stream = Some(stream);
            debug!(
                "Serial port '{}' opened at {} baud",
                self.port_name, self.baud_rate
            );
            Ok(())
        }

        #[cfg(not(feature = "serial"))]
        {
            Err(TransportError::SerialFeatureDisabled)
        }
    }

    async fn close(&mut self) {
        #[cfg(feature = "serial")]
        {
            if self.stream.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        self.pending.clear();
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        #[cfg(feature = "serial")]
        {
            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| TransportError::NotConnected(self.port_name.clone()))?;
            stream.write_all(bytes).await?;
            stream.flush().await?;
            debug!(
                "Sent serial bytes to '{}': {:?}",
                self.port_name,
                String::from_utf8_lossy(bytes).trim()
            );
            Ok(())
        }

        #[cfg(not(feature = "serial"))]
        {
            let _ = bytes;
            Err(TransportError::SerialFeatureDisabled)
        }
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }

        #[cfg(feature = "serial")]
        {
            let deadline = tokio::time::Instant::now() + timeout;
            let mut buf = [0u8; 256];

            loop {
                let stream = self
                    .stream
                    .as_mut()
                    .ok_or_else(|| TransportError::NotConnected(self.port_name.clone()))?;

                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    return Ok(None);
                }

                match tokio::time::timeout(remaining, stream.read(&mut buf)).await {
                    Ok(Ok(0)) => return Err(TransportError::UnexpectedEof(self.port_name.clone())),
                    Ok(Ok(n)) => {
                        if let Some(line) = self.accept(&buf[..n])? {
                            debug!("Received from '{}': {}", self.port_name, line);
                            return Ok(Some(line));
                        }
                    }
                    Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => return Ok(None),
                }
            }
        }

        #[cfg(not(feature = "serial"))]
        {
            let _ = timeout;
            Err(TransportError::SerialFeatureDisabled)
        }
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.pending.clear();

        #[cfg(feature = "serial")]
        {
            use tokio_serial::{ClearBuffer, SerialPort};

            let stream = self
                .stream
                .as_mut()
                .ok_or_else(|| TransportError::NotConnected(self.port_name.clone()))?;
            stream
                .clear(ClearBuffer::Input)
                .map_err(|e| TransportError::Io(e.into()))?;
            Ok(())
        }

        #[cfg(not(feature = "serial"))]
        {
            Err(TransportError::SerialFeatureDisabled)
        }
    }
}
