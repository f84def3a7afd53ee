//! Serial line transport (RS-232 / USB-serial instruments).
//!
//! Wraps the `serialport` crate. The port is blocking, so every exchange runs
//! on Tokio's blocking pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serialport::SerialPort;
use tokio::sync::Mutex;
use tracing::debug;

use super::Transport;

/// Polling interval of the underlying port; reads loop until the frame deadline.
const PORT_POLL: Duration = Duration::from_millis(100);

/// Serial session to one instrument.
pub struct SerialTransport {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    line_terminator: String,
    response_delimiter: u8,
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialTransport {
    /// Create a closed serial transport.
    ///
    /// # Arguments
    /// * `port_name` - Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    /// * `baud_rate` - Communication speed (e.g., 9600, 115200)
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
            line_terminator: "\n".to_string(),
            response_delimiter: b'\n',
            port: None,
        }
    }

    /// Maximum time to wait for one response frame.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Terminator appended to every written frame. Its last byte also ends
    /// response frames.
    pub fn with_line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.line_terminator = terminator.into();
        self.response_delimiter = self.line_terminator.bytes().last().unwrap_or(b'\n');
        self
    }

    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| anyhow!("session not open"))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.port.is_some() {
            bail!("session already open");
        }
        let name = self.port_name.clone();
        let baud = self.baud_rate;
        let port = tokio::task::spawn_blocking(move || {
            serialport::new(&name, baud)
                .timeout(PORT_POLL)
                .open()
                .with_context(|| format!("Failed to open serial port '{name}' at {baud} baud"))
        })
        .await
        .context("Serial open task panicked")??;

        self.port = Some(Arc::new(Mutex::new(port)));
        debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.port.take().is_some() {
            debug!(port = %self.port_name, "serial port closed");
        }
        Ok(())
    }

    async fn write(&mut self, frame: &str) -> Result<()> {
        let port = self.port()?;
        let bytes = format!("{frame}{}", self.line_terminator).into_bytes();

        tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;

            let mut guard = port.blocking_lock();
            guard
                .write_all(&bytes)
                .context("Failed to write to serial port")?;
            guard.flush().context("Failed to flush serial port")?;
            Ok(())
        })
        .await
        .context("Serial I/O task panicked")?
    }

    async fn read(&mut self) -> Result<String> {
        let port = self.port()?;
        let delimiter = self.response_delimiter;
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<String> {
            use std::io::Read;

            let mut guard = port.blocking_lock();
            let mut response = Vec::new();
            let mut byte = [0u8; 1];
            let deadline = Instant::now() + timeout;

            loop {
                if Instant::now() > deadline {
                    bail!("timed out after {timeout:?} waiting for response");
                }
                match guard.read(&mut byte) {
                    Ok(1) if byte[0] == delimiter => break,
                    Ok(1) => response.push(byte[0]),
                    Ok(_) => bail!("serial port returned end of stream"),
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                    Err(e) => return Err(e).context("Serial read error"),
                }
            }

            let text = String::from_utf8_lossy(&response)
                .trim_end_matches(['\r', '\n'])
                .to_string();
            Ok(text)
        })
        .await
        .context("Serial I/O task panicked")?
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn info(&self) -> String {
        format!("serial:{}@{}", self.port_name, self.baud_rate)
    }
}
