//! The device channel lock.
//!
//! Every device owns exactly one [`Channel`]. The channel is the single path to
//! the device's transport, and a transport exchange is only reachable through
//! a [`ChannelGuard`], so holding the guard is the same as holding the device
//! lock. A full message exchange (command, reply and error drain) runs under
//! one guard and can never interleave with another one on the same device.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{Mutex, MutexGuard};
use tracing::trace;

use crate::transport::Transport;

/// Serialized access to one device session.
#[derive(Clone)]
pub struct Channel {
    device: Arc<str>,
    session: Arc<Mutex<Box<dyn Transport>>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wrap a transport for the named device.
    pub fn new(device: impl Into<Arc<str>>, transport: Box<dyn Transport>) -> Self {
        Self {
            device: device.into(),
            session: Arc::new(Mutex::new(transport)),
        }
    }

    /// Name of the owning device.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// Acquire the device lock. Waiters are served in FIFO order.
    pub async fn lock(&self) -> ChannelGuard<'_> {
        let session = self.session.lock().await;
        trace!(device = %self.device, "channel acquired");
        ChannelGuard {
            device: &self.device,
            session,
        }
    }
}

/// Exclusive access to a device session for the guard's lifetime.
pub struct ChannelGuard<'a> {
    device: &'a str,
    session: MutexGuard<'a, Box<dyn Transport>>,
}

impl ChannelGuard<'_> {
    /// Name of the owning device.
    pub fn device(&self) -> &str {
        self.device
    }

    /// Open the session.
    pub async fn open(&mut self) -> Result<()> {
        self.session.open().await
    }

    /// Close the session.
    pub async fn close(&mut self) -> Result<()> {
        self.session.close().await
    }

    /// Whether the session is open.
    pub fn is_open(&self) -> bool {
        self.session.is_open()
    }

    /// Transport description.
    pub fn info(&self) -> String {
        self.session.info()
    }

    /// Write one frame.
    pub async fn write(&mut self, frame: &str) -> Result<()> {
        trace!(device = %self.device, frame, "write");
        self.session.write(frame).await
    }

    /// Read one frame.
    pub async fn read(&mut self) -> Result<String> {
        let reply = self.session.read().await?;
        trace!(device = %self.device, reply = %reply, "read");
        Ok(reply)
    }

    /// Write one frame and read its reply.
    pub async fn send_raw(&mut self, frame: &str) -> Result<String> {
        self.write(frame).await?;
        self.read().await
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        trace!(device = %self.device, "channel released");
    }
}
