//! SCPI-style command/response protocol.
//!
//! [`MessageChannel::send_message`] is the one way property callbacks talk to
//! an instrument. Each call holds the device channel lock for the whole
//! exchange:
//!
//! 1. The command is trimmed and framed. Queries (containing the query marker)
//!    go out as `*CLS;CMD`; everything else as `*CLS;CMD;*OPC?`, so every write
//!    becomes a confirmable round trip.
//! 2. The reply is read and normalized: trailing line endings are removed and,
//!    for non-queries, the echoed operation-complete `1` (and its separator).
//! 3. If anything failed, the device error queue is drained before the lock is
//!    released and the collected entries are reported as one failure.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::channel::{Channel, ChannelGuard};
use crate::error::{AppResult, DaqError};

/// Command vocabulary of a SCPI-style instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScpiVocabulary {
    /// Character marking a command as a query.
    pub query_marker: char,
    /// Status-clear directive prefixed to every command.
    pub clear_status: String,
    /// Operation-complete query appended to non-query commands.
    pub operation_complete: String,
    /// Command reading one entry of the error queue.
    pub error_query: String,
    /// Error-queue replies starting with any of these mean "no more errors".
    pub all_clear_prefixes: Vec<String>,
    /// Separator between chained commands.
    pub separator: String,
    /// Identification query.
    pub identify: String,
    /// Reset command.
    pub reset: String,
    /// Upper bound on error-queue entries read after one failure.
    pub max_error_drain: usize,
}

impl Default for ScpiVocabulary {
    fn default() -> Self {
        Self {
            query_marker: '?',
            clear_status: "*CLS".to_string(),
            operation_complete: "*OPC?".to_string(),
            error_query: "SYST:ERR?".to_string(),
            all_clear_prefixes: vec!["0".to_string(), "+0".to_string()],
            separator: ";".to_string(),
            identify: "*IDN?".to_string(),
            reset: "*RST".to_string(),
            max_error_drain: 64,
        }
    }
}

impl ScpiVocabulary {
    /// Whether `command` is a query.
    pub fn is_query(&self, command: &str) -> bool {
        command.contains(self.query_marker)
    }

    /// Frame a command for the wire.
    pub fn frame(&self, command: &str) -> String {
        let command = command.trim();
        let sep = &self.separator;
        if self.is_query(command) {
            format!("{}{sep}{command}", self.clear_status)
        } else {
            format!(
                "{}{sep}{command}{sep}{}",
                self.clear_status, self.operation_complete
            )
        }
    }

    /// Normalize a raw reply to `command`.
    pub fn normalize<'a>(&self, command: &str, reply: &'a str) -> &'a str {
        let reply = reply.trim_end_matches(['\r', '\n']);
        if self.is_query(command.trim()) {
            return reply;
        }
        match reply.strip_suffix('1') {
            Some(rest) => rest.strip_suffix(self.separator.as_str()).unwrap_or(rest),
            None => reply,
        }
    }

    /// Whether an error-queue entry means the queue is empty.
    pub fn is_all_clear(&self, entry: &str) -> bool {
        self.all_clear_prefixes
            .iter()
            .any(|prefix| entry.starts_with(prefix.as_str()))
    }
}

/// Protocol view of a device channel.
///
/// Cheap to clone; every clone shares the same channel lock.
#[derive(Debug, Clone)]
pub struct MessageChannel {
    channel: Channel,
    vocabulary: Arc<ScpiVocabulary>,
}

impl MessageChannel {
    /// Wrap a channel with a command vocabulary.
    pub fn new(channel: Channel, vocabulary: ScpiVocabulary) -> Self {
        Self {
            channel,
            vocabulary: Arc::new(vocabulary),
        }
    }

    /// Underlying channel (for lifecycle operations on the session).
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Command vocabulary.
    pub fn vocabulary(&self) -> &ScpiVocabulary {
        &self.vocabulary
    }

    /// Name of the owning device.
    pub fn device(&self) -> &str {
        self.channel.device()
    }

    /// Send one command and return its normalized reply.
    ///
    /// The channel lock is held from framing until the error drain finished.
    pub async fn send_message(&self, command: &str) -> AppResult<String> {
        let mut guard = self.channel.lock().await;
        self.exchange(&mut guard, command).await
    }

    /// Like [`send_message`](Self::send_message) on an already held guard.
    pub async fn exchange(&self, guard: &mut ChannelGuard<'_>, command: &str) -> AppResult<String> {
        let command = command.trim();
        let frame = self.vocabulary.frame(command);
        debug!(device = %self.device(), frame = %frame, "sending");

        match guard.send_raw(&frame).await {
            Ok(reply) => {
                let reply = self.vocabulary.normalize(command, &reply).to_string();
                debug!(device = %self.device(), reply = %reply, "received");
                Ok(reply)
            }
            Err(error) => {
                let errors = self.drain_errors(guard).await;
                if errors.is_empty() {
                    Err(DaqError::Transport {
                        device: self.device().to_string(),
                        command: command.to_string(),
                        message: format!("{error:#}"),
                    })
                } else {
                    Err(DaqError::DeviceReported {
                        device: self.device().to_string(),
                        command: command.to_string(),
                        errors,
                    })
                }
            }
        }
    }

    /// Read the error queue until it reports all-clear.
    ///
    /// A failing error query ends the drain without an error of its own, so
    /// the caller falls back to the original failure.
    pub async fn drain_errors(&self, guard: &mut ChannelGuard<'_>) -> Vec<String> {
        let limit = self.vocabulary.max_error_drain;
        let mut errors = Vec::new();

        while errors.len() < limit {
            match guard.send_raw(&self.vocabulary.error_query).await {
                Ok(entry) => {
                    let entry = entry.trim_end_matches(['\r', '\n']).to_string();
                    if self.vocabulary.is_all_clear(&entry) {
                        return errors;
                    }
                    debug!(device = %self.device(), entry = %entry, "error queue entry");
                    errors.push(entry);
                }
                Err(error) => {
                    debug!(device = %self.device(), error = %format!("{error:#}"), "error query failed, drain stopped");
                    return errors;
                }
            }
        }

        warn!(
            device = %self.device(),
            limit,
            "error queue did not report all-clear, drain stopped"
        );
        errors
    }

    /// Identification string (`*IDN?`).
    pub async fn get_identifier(&self) -> AppResult<String> {
        self.send_message(&self.vocabulary.identify).await
    }

    /// Reset the instrument (`*RST`).
    pub async fn reset(&self) -> AppResult<()> {
        self.send_message(&self.vocabulary.reset).await.map(|_| ())
    }

    /// Clear the status registers (`*CLS`).
    pub async fn clear_status(&self) -> AppResult<()> {
        self.send_message(&self.vocabulary.clear_status)
            .await
            .map(|_| ())
    }
}
