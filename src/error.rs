//! Custom error types for the library.
//!
//! This module defines the primary error type, `DaqError`, used across the
//! property, device and protocol layers. Using the `thiserror` crate, it
//! provides a centralized and consistent way to describe everything that can
//! go wrong between a property callback and the wire.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: The session collaborator failed while sending or
//!   receiving, and the device error queue had nothing to add.
//! - **`DeviceReported`**: The device error queue was drained after a failed
//!   exchange and reported one or more entries. All entries are kept.
//! - **`Lifecycle`**: A connect/disconnect was requested in a state that does
//!   not allow it (for example connecting an already connected device).
//! - **`Initialization`** / **`Teardown`**: The device-specific setup or
//!   teardown hook failed.
//! - **`Callback`**: A property or action callback panicked.
//! - **`InvalidValue`**: A value handed to a property through its type-erased
//!   interface could not be converted to the property's type.
//! - **`Configuration`**: Semantic configuration problems.
//!
//! `DaqError` is `Clone` so one failure can be delivered to every subscriber of
//! a property's notification channel.

use thiserror::Error;

use crate::device::DeviceState;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DaqError {
    #[error("[{device}] transport error during '{command}': {message}")]
    Transport {
        device: String,
        command: String,
        message: String,
    },

    #[error("[{device}] device reported error(s) during '{command}': {}", .errors.join("; "))]
    DeviceReported {
        device: String,
        command: String,
        errors: Vec<String>,
    },

    #[error("[{device}] cannot {message} while {state:?}")]
    Lifecycle {
        device: String,
        state: DeviceState,
        message: String,
    },

    #[error("[{device}] initialization failed: {message}")]
    Initialization { device: String, message: String },

    #[error("[{device}] teardown failed: {message}")]
    Teardown { device: String, message: String },

    #[error("Callback for '{property}' failed: {message}")]
    Callback { property: String, message: String },

    #[error("Invalid value for '{property}': {message}")]
    InvalidValue { property: String, message: String },

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

impl DaqError {
    /// Name of the device the error originated from, if it is device-scoped.
    pub fn device(&self) -> Option<&str> {
        match self {
            DaqError::Transport { device, .. }
            | DaqError::DeviceReported { device, .. }
            | DaqError::Lifecycle { device, .. }
            | DaqError::Initialization { device, .. }
            | DaqError::Teardown { device, .. } => Some(device),
            _ => None,
        }
    }

    /// Entries drained from the device error queue, empty for other variants.
    pub fn reported_errors(&self) -> &[String] {
        match self {
            DaqError::DeviceReported { errors, .. } => errors,
            _ => &[],
        }
    }
}
