//! Session collaborators: the byte pipe underneath a device's message channel.
//!
//! A [`Transport`] owns one session to an instrument. It only knows how to open
//! and close that session, write one command frame and read one response
//! frame. Framing of the SCPI-style protocol and error draining live in
//! [`crate::message`].

use anyhow::Result;
use async_trait::async_trait;

pub mod mock;
#[cfg(feature = "instrument_serial")]
pub mod serial;

pub use mock::{MockTransport, MockTransportHandle, WireEvent};
#[cfg(feature = "instrument_serial")]
pub use serial::SerialTransport;

/// One session to an instrument.
///
/// Implementations are not required to be safe under concurrent exchanges:
/// the owning [`Channel`](crate::channel::Channel) guarantees that at most one
/// write/read pair is in progress at any time.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the session. Opening an already open session is an error.
    async fn open(&mut self) -> Result<()>;

    /// Close the session. Closing a closed session is a no-op.
    async fn close(&mut self) -> Result<()>;

    /// Send one command frame (without line terminator).
    async fn write(&mut self, frame: &str) -> Result<()>;

    /// Receive one response frame, terminator stripped.
    async fn read(&mut self) -> Result<String>;

    /// Whether the session is currently open.
    fn is_open(&self) -> bool;

    /// Human-readable description, e.g. `serial:/dev/ttyUSB0@9600`.
    fn info(&self) -> String;
}
