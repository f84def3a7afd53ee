//! Asynchronous instrument properties over a single message channel.
//!
//! A [`Device`] owns one exclusive session to an instrument and exposes its
//! parameters as [`AsyncProperty`] values and its commands as
//! [`DeviceAction`]s. Reads and writes run on background Tokio tasks, are
//! serialized per property, and meet at the device's channel lock so wire
//! traffic never interleaves. Failures never reach the caller of a write;
//! they are published as [`PropertyEvent::Failed`].
//!
//! The protocol layer ([`MessageChannel`]) frames SCPI-style commands,
//! confirms writes with an operation-complete query and drains the device
//! error queue whenever an exchange fails.

pub mod action;
pub mod auto_update;
pub mod channel;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod property;
pub mod registry;
pub mod transport;

pub use action::DeviceAction;
pub use auto_update::AutoUpdater;
pub use channel::{Channel, ChannelGuard};
pub use config::{ConfigError, DaqPropsConfig, LoggingConfig, PropertyDefaults, TransportConfig};
pub use device::{Device, DeviceDriver, DeviceState, GenericScpiDriver};
pub use error::{AppResult, DaqError};
pub use events::{ActionEvent, Completion, Operation, PropertyEvent};
pub use message::{MessageChannel, ScpiVocabulary};
pub use property::{AsyncProperty, PropertyMetadata};
pub use registry::{ActionSet, PropertyBase, PropertySet, Registry};
pub use transport::{MockTransport, MockTransportHandle, Transport};
