//! Scripted device channel for tests.
//!
//! A responder closure sees every write and returns the lines the device
//! would answer with. Those lines are queued and handed out by `read_line`.
//! When the queue is empty `read_line` waits out its timeout, the same as a
//! silent device, so tests can drive deadlines with a paused clock.

use super::DeviceChannel;
use crate::error::TransportError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

type Responder = Box<dyn FnMut(&str) -> Vec<String> + Send>;

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    writes: Vec<String>,
    incoming: VecDeque<String>,
    responder: Option<Responder>,
}

/// In-memory channel with a scripted peer.
pub struct MockChannel {
    port_name: String,
    state: Arc<Mutex<MockState>>,
}

/// Test-side view of a [`MockChannel`] after it was moved into a backend.
#[derive(Clone)]
pub struct MockChannelHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockChannel {
    /// New closed channel that answers nothing.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Answer each write with the lines returned by `responder`.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: FnMut(&str) -> Vec<String> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(responder));
        self
    }

    /// Make `open` fail.
    pub fn failing_open(self) -> Self {
        self.state.lock().fail_open = true;
        self
    }

    /// Handle for inspecting writes and injecting input.
    pub fn handle(&self) -> MockChannelHandle {
        MockChannelHandle {
            state: self.state.clone(),
        }
    }
}

impl MockChannelHandle {
    /// Every write so far, decoded and trimmed.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Queue an unsolicited line from the device.
    pub fn push_line(&self, line: impl Into<String>) {
        self.state.lock().incoming.push_back(line.into());
    }

    /// Whether the channel is currently open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }
}

#[async_trait]
impl DeviceChannel for MockChannel {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.fail_open {
            return Err(TransportError::Open {
                port: self.port_name.clone(),
                baud_rate: 0,
                reason: "mock open failure".to_string(),
            });
        }
        state.open = true;
        Ok(())
    }

    async fn close(&mut self) {
        let mut state = self.state.lock();
        state.open = false;
        state.incoming.clear();
    }

    async fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(TransportError::NotConnected(self.port_name.clone()));
        }

        let text = String::from_utf8_lossy(bytes).trim().to_string();
        let replies = match state.responder.as_mut() {
            Some(responder) => responder(&text),
            None => Vec::new(),
        };
        state.writes.push(text);
        state.incoming.extend(replies);
        Ok(())
    }

    async fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, TransportError> {
        let next = {
            let mut state = self.state.lock();
            if !state.open {
                return Err(TransportError::NotConnected(self.port_name.clone()));
            }
            state.incoming.pop_front()
        };

        match next {
            Some(line) => Ok(Some(line.trim().to_string())),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.state.lock().incoming.clear();
        Ok(())
    }
}
