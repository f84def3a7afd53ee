//! Configuration loading with Figment
//!
//! Configuration is read from a TOML file and overridden by environment
//! variables prefixed with `DAQPROPS_`. Nested keys are separated by a double
//! underscore:
//!
//! ```text
//! DAQPROPS_APPLICATION__LOG_LEVEL=debug
//! DAQPROPS_PROTOCOL__ERROR_QUERY="SYST:ERR:NEXT?"
//! DAQPROPS_PROPERTIES__AUTO_UPDATE_INTERVAL=250ms
//! ```
//!
//! # Example
//!
//! ```toml
//! [application]
//! name = "bench"
//! log_level = "info"
//!
//! [logging]
//! format = "json"
//!
//! [protocol]
//! error_query = "SYST:ERR?"
//! max_error_drain = 32
//!
//! [[devices]]
//! name = "psu"
//! transport = { type = "serial", port = "/dev/ttyUSB0", baud_rate = 9600, timeout = "2s" }
//! ```

use std::collections::HashSet;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::{Device, DeviceDriver};
use crate::error::{AppResult, DaqError};
use crate::logging::OutputFormat;
use crate::message::ScpiVocabulary;
use crate::property::{AsyncProperty, DEFAULT_EVENT_CAPACITY};
use crate::transport::{MockTransport, Transport};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DAQPROPS_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for DaqError {
    fn from(err: ConfigError) -> Self {
        DaqError::Configuration(err.to_string())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqPropsConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Log output settings
    pub logging: LoggingConfig,
    /// Command vocabulary of the message protocol
    pub protocol: ProtocolConfig,
    /// Defaults for declared properties
    pub properties: PropertyDefaults,
    /// Device definitions
    pub devices: Vec<DeviceDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-props".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Log output configuration. The level lives in [`ApplicationConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Output format (pretty, compact, json)
    pub format: OutputFormat,
    /// Log span open/close events
    pub span_events: bool,
    /// Include file and line numbers
    pub file_and_line: bool,
    /// Include thread names
    pub thread_names: bool,
    /// ANSI colors (ignored for json)
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Compact,
            span_events: false,
            file_and_line: false,
            thread_names: true,
            ansi: true,
        }
    }
}

/// SCPI-style command vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Character marking a command as a query
    pub query_marker: char,
    /// Status-clear directive
    pub clear_status: String,
    /// Operation-complete query
    pub operation_complete: String,
    /// Error-queue query
    pub error_query: String,
    /// Prefixes of an all-clear error-queue entry
    pub all_clear_prefixes: Vec<String>,
    /// Command separator
    pub separator: String,
    /// Identification query
    pub identify: String,
    /// Reset command
    pub reset: String,
    /// Maximum error-queue entries read after one failure
    pub max_error_drain: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ScpiVocabulary::default().into()
    }
}

impl From<ScpiVocabulary> for ProtocolConfig {
    fn from(v: ScpiVocabulary) -> Self {
        Self {
            query_marker: v.query_marker,
            clear_status: v.clear_status,
            operation_complete: v.operation_complete,
            error_query: v.error_query,
            all_clear_prefixes: v.all_clear_prefixes,
            separator: v.separator,
            identify: v.identify,
            reset: v.reset,
            max_error_drain: v.max_error_drain,
        }
    }
}

impl From<&ProtocolConfig> for ScpiVocabulary {
    fn from(c: &ProtocolConfig) -> Self {
        Self {
            query_marker: c.query_marker,
            clear_status: c.clear_status.clone(),
            operation_complete: c.operation_complete.clone(),
            error_query: c.error_query.clone(),
            all_clear_prefixes: c.all_clear_prefixes.clone(),
            separator: c.separator.clone(),
            identify: c.identify.clone(),
            reset: c.reset.clone(),
            max_error_drain: c.max_error_drain,
        }
    }
}

/// Defaults applied to declared properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyDefaults {
    /// Re-read the device after every write
    pub auto_refresh_after_set: bool,
    /// Capacity of each property's event channel
    pub event_capacity: usize,
    /// Cadence of background refreshes
    #[serde(with = "humantime_serde")]
    pub auto_update_interval: Duration,
}

impl Default for PropertyDefaults {
    fn default() -> Self {
        Self {
            auto_refresh_after_set: true,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            auto_update_interval: Duration::from_secs(1),
        }
    }
}

impl PropertyDefaults {
    /// Apply these defaults to a freshly built property.
    pub fn apply<T>(&self, property: AsyncProperty<T>) -> AsyncProperty<T>
    where
        T: Clone + Send + Sync + Debug + 'static,
    {
        property
            .with_auto_refresh(self.auto_refresh_after_set)
            .with_event_capacity(self.event_capacity)
    }
}

/// One configured device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDefinition {
    /// Unique device name
    pub name: String,
    /// How to reach the device
    pub transport: TransportConfig,
}

/// Description of a device session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Serial line
    Serial {
        /// Port path (e.g., "/dev/ttyUSB0", "COM3")
        port: String,
        /// Baud rate
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        /// Response timeout
        #[serde(default = "default_serial_timeout", with = "humantime_serde")]
        timeout: Duration,
        /// Terminator appended to written frames
        #[serde(default = "default_line_terminator")]
        line_terminator: String,
    },
    /// In-memory session without scripted replies
    Mock,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_serial_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_line_terminator() -> String {
    "\n".to_string()
}

impl TransportConfig {
    /// Create the (closed) transport this entry describes.
    pub fn build(&self) -> AppResult<Box<dyn Transport>> {
        match self {
            TransportConfig::Mock => Ok(Box::new(MockTransport::new())),
            #[cfg(feature = "instrument_serial")]
            TransportConfig::Serial {
                port,
                baud_rate,
                timeout,
                line_terminator,
            } => Ok(Box::new(
                crate::transport::SerialTransport::new(port.clone(), *baud_rate)
                    .with_timeout(*timeout)
                    .with_line_terminator(line_terminator.clone()),
            )),
            #[cfg(not(feature = "instrument_serial"))]
            TransportConfig::Serial { port, .. } => Err(DaqError::Configuration(format!(
                "serial port '{port}' requires the 'instrument_serial' feature"
            ))),
        }
    }
}

impl DaqPropsConfig {
    /// Load from `path` plus `DAQPROPS_` environment overrides, then validate.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Protocol vocabulary entries are non-empty
    /// - Error drain limit, event capacity and auto-update interval are non-zero
    /// - Device names are unique and non-empty
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let p = &self.protocol;
        for (field, value) in [
            ("clear_status", &p.clear_status),
            ("operation_complete", &p.operation_complete),
            ("error_query", &p.error_query),
            ("separator", &p.separator),
            ("identify", &p.identify),
            ("reset", &p.reset),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "protocol.{field} must not be empty"
                )));
            }
        }
        if p.all_clear_prefixes.is_empty() || p.all_clear_prefixes.iter().any(|s| s.is_empty()) {
            return Err(ConfigError::ValidationError(
                "protocol.all_clear_prefixes must list at least one non-empty prefix".to_string(),
            ));
        }
        if p.max_error_drain == 0 {
            return Err(ConfigError::ValidationError(
                "protocol.max_error_drain must be greater than 0".to_string(),
            ));
        }
        if self.properties.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "properties.event_capacity must be greater than 0".to_string(),
            ));
        }
        if self.properties.auto_update_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "properties.auto_update_interval must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "device name must not be empty".to_string(),
                ));
            }
            if !seen.insert(device.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate device name: {}",
                    device.name
                )));
            }
        }
        Ok(())
    }

    /// Command vocabulary for devices built from this configuration.
    pub fn vocabulary(&self) -> ScpiVocabulary {
        (&self.protocol).into()
    }

    /// Look up a device definition by name.
    pub fn device_definition(&self, name: &str) -> Option<&DeviceDefinition> {
        self.devices.iter().find(|d| d.name == name)
    }

    /// Build the named device with `driver`.
    pub fn build_device(&self, name: &str, driver: Arc<dyn DeviceDriver>) -> AppResult<Device> {
        let definition = self
            .device_definition(name)
            .ok_or_else(|| DaqError::Configuration(format!("no device named '{name}'")))?;
        let transport = definition.transport.build()?;
        Device::with_property_defaults(
            &definition.name,
            transport,
            self.vocabulary(),
            self.properties.clone(),
            driver,
        )
    }
}
