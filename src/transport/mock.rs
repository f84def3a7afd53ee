//! In-memory transport for tests and dry runs.
//!
//! A [`MockTransport`] records every frame written to it and answers reads from
//! a queue. Responses can be queued up front with
//! [`MockTransportHandle::push_response`] or produced on the fly by a
//! responder closure that sees each written frame, which is how the simulated
//! instruments in the test suite are built.
//!
//! The transport is moved into a device, so inspection goes through a
//! [`MockTransportHandle`] that shares its state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::Transport;

/// Produces the response (if any) for a written frame.
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Something that happened on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// Session opened
    Open,
    /// Session closed
    Close,
    /// Frame written
    Write(String),
    /// Frame read
    Read(String),
}

#[derive(Default)]
struct MockState {
    open: bool,
    log: Vec<WireEvent>,
    responses: VecDeque<String>,
    responder: Option<Responder>,
    fail_writes: usize,
    fail_reads: usize,
    fail_open: bool,
    fail_close: bool,
    open_count: usize,
    close_count: usize,
    in_flight: usize,
    overlaps: usize,
}

/// Scriptable transport that never touches real hardware.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    latency: Option<Duration>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Create a closed mock session with no scripted responses.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            latency: None,
        }
    }

    /// Answer every written frame through `responder`.
    pub fn with_responder(self, responder: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.state.lock().responder = Some(Arc::new(responder));
        self
    }

    /// Delay every write and read by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Shared inspection handle.
    pub fn handle(&self) -> MockTransportHandle {
        MockTransportHandle {
            state: self.state.clone(),
        }
    }

    fn enter(&self) {
        let mut state = self.state.lock();
        state.in_flight += 1;
        if state.in_flight > 1 {
            state.overlaps += 1;
        }
    }

    fn leave(&self) {
        self.state.lock().in_flight -= 1;
    }

    async fn delay(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_open {
            bail!("mock session refused to open");
        }
        if state.open {
            bail!("session already open");
        }
        state.open = true;
        state.open_count += 1;
        state.log.push(WireEvent::Open);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_close {
            state.open = false;
            bail!("mock session failed to close cleanly");
        }
        if state.open {
            state.open = false;
            state.close_count += 1;
            state.log.push(WireEvent::Close);
        }
        Ok(())
    }

    async fn write(&mut self, frame: &str) -> Result<()> {
        self.enter();
        self.delay().await;
        let result = {
            let mut state = self.state.lock();
            if !state.open {
                Err(anyhow!("session not open"))
            } else if state.fail_writes > 0 {
                state.fail_writes -= 1;
                Err(anyhow!("write failed: link down"))
            } else {
                trace!(frame, "mock write");
                state.log.push(WireEvent::Write(frame.to_string()));
                let reply = state.responder.clone().and_then(|respond| respond(frame));
                if let Some(reply) = reply {
                    state.responses.push_back(reply);
                }
                Ok(())
            }
        };
        self.leave();
        result
    }

    async fn read(&mut self) -> Result<String> {
        self.enter();
        self.delay().await;
        let result = {
            let mut state = self.state.lock();
            if !state.open {
                Err(anyhow!("session not open"))
            } else if state.fail_reads > 0 {
                state.fail_reads -= 1;
                Err(anyhow!("read failed: link down"))
            } else {
                match state.responses.pop_front() {
                    Some(reply) => {
                        trace!(reply = %reply, "mock read");
                        state.log.push(WireEvent::Read(reply.clone()));
                        Ok(reply)
                    }
                    None => Err(anyhow!("timed out waiting for response")),
                }
            }
        };
        self.leave();
        result
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    fn info(&self) -> String {
        "mock".to_string()
    }
}

/// Inspection and scripting handle for a [`MockTransport`].
#[derive(Clone)]
pub struct MockTransportHandle {
    state: Arc<Mutex<MockState>>,
}

impl MockTransportHandle {
    /// Queue a response for a later read.
    pub fn push_response(&self, response: impl Into<String>) {
        self.state.lock().responses.push_back(response.into());
    }

    /// Fail the next `count` writes.
    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().fail_writes = count;
    }

    /// Fail the next `count` reads.
    pub fn fail_next_reads(&self, count: usize) {
        self.state.lock().fail_reads = count;
    }

    /// Make `open` fail until reset.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Make `close` fail until reset. The session still ends up closed.
    pub fn fail_close(&self, fail: bool) {
        self.state.lock().fail_close = fail;
    }

    /// Frames written so far, in order.
    pub fn written(&self) -> Vec<String> {
        self.state
            .lock()
            .log
            .iter()
            .filter_map(|event| match event {
                WireEvent::Write(frame) => Some(frame.clone()),
                _ => None,
            })
            .collect()
    }

    /// Full wire history.
    pub fn events(&self) -> Vec<WireEvent> {
        self.state.lock().log.clone()
    }

    /// Forget the wire history.
    pub fn clear_log(&self) {
        self.state.lock().log.clear();
    }

    /// Whether the session is open.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// How many times the session was opened.
    pub fn open_count(&self) -> usize {
        self.state.lock().open_count
    }

    /// How many times an open session was closed.
    pub fn close_count(&self) -> usize {
        self.state.lock().close_count
    }

    /// Number of writes/reads that started while another one was in progress.
    pub fn overlaps(&self) -> usize {
        self.state.lock().overlaps
    }
}
