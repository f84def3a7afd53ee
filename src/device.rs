//! Devices: lifecycle state machine around one exclusive message channel.
//!
//! # Architecture
//!
//! ```text
//! Device
//!   ├─ MessageChannel ── Channel ── Mutex<Box<dyn Transport>>   (channel lock)
//!   ├─ DeviceDriver                (declare / initialize / deinitialize)
//!   ├─ Registry                    (properties + actions, declared once)
//!   ├─ state: watch::Sender        (Disconnected → Initializing → Connected → Deinitializing)
//!   └─ lifecycle: Mutex<()>        (serializes connect/disconnect)
//! ```
//!
//! Property and action callbacks created in [`DeviceDriver::declare`] capture a
//! clone of the [`MessageChannel`], so their wire traffic meets at the device's
//! single channel lock no matter which background task runs them.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::action::DeviceAction;
use crate::auto_update::AutoUpdater;
use crate::channel::Channel;
use crate::config::PropertyDefaults;
use crate::error::{AppResult, DaqError};
use crate::message::{MessageChannel, ScpiVocabulary};
use crate::property::AsyncProperty;
use crate::registry::{ActionSet, PropertySet, Registry};
use crate::transport::Transport;

/// Device lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// No session; the only state from which `connect` is accepted.
    Disconnected,
    /// Session open, device-specific setup running.
    Initializing,
    /// Ready for property and action traffic.
    Connected,
    /// Device-specific teardown running; the session closes next.
    Deinitializing,
}

/// Device-specific behavior plugged into a [`Device`].
///
/// `declare` runs once when the device is constructed. `initialize` runs after
/// the session was opened on every `connect`, `deinitialize` before the
/// session is closed on every `disconnect`.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Declare the device's properties and actions.
    fn declare(&self, channel: &MessageChannel, registry: &mut Registry) -> AppResult<()>;

    /// Device-specific setup after the session was opened.
    async fn initialize(&self, channel: &MessageChannel) -> AppResult<()>;

    /// Device-specific teardown before the session is closed.
    async fn deinitialize(&self, _channel: &MessageChannel) -> AppResult<()> {
        Ok(())
    }
}

struct DeviceInner {
    name: String,
    messages: MessageChannel,
    driver: Arc<dyn DeviceDriver>,
    registry: Registry,
    state: watch::Sender<DeviceState>,
    lifecycle: Mutex<()>,
}

/// One instrument: a message channel, its declared properties and actions,
/// and a connect/disconnect lifecycle.
///
/// Cloning yields another handle to the same device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("properties", &self.inner.registry.properties.names())
            .field("actions", &self.inner.registry.actions.names())
            .finish()
    }
}

impl Device {
    /// Build a device and run the driver's declaration step.
    ///
    /// The device starts `Disconnected`; the transport is not touched.
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        vocabulary: ScpiVocabulary,
        driver: Arc<dyn DeviceDriver>,
    ) -> AppResult<Self> {
        Self::with_property_defaults(name, transport, vocabulary, PropertyDefaults::default(), driver)
    }

    /// Like [`new`](Self::new), declaring properties with `defaults`.
    pub fn with_property_defaults(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        vocabulary: ScpiVocabulary,
        defaults: PropertyDefaults,
        driver: Arc<dyn DeviceDriver>,
    ) -> AppResult<Self> {
        let name = name.into();
        let messages = MessageChannel::new(Channel::new(name.as_str(), transport), vocabulary);
        let mut registry = Registry::with_defaults(defaults);
        driver.declare(&messages, &mut registry)?;
        let (state, _) = watch::channel(DeviceState::Disconnected);

        Ok(Self {
            inner: Arc::new(DeviceInner {
                name,
                messages,
                driver,
                registry,
                state,
                lifecycle: Mutex::new(()),
            }),
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> DeviceState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<DeviceState> {
        self.inner.state.subscribe()
    }

    /// Declared properties
    pub fn properties(&self) -> &PropertySet {
        &self.inner.registry.properties
    }

    /// Declared actions
    pub fn actions(&self) -> &ActionSet {
        &self.inner.registry.actions
    }

    /// Typed handle to a declared property.
    pub fn property<T>(&self, name: &str) -> Option<AsyncProperty<T>>
    where
        T: Clone + Send + Sync + Debug + 'static,
    {
        self.inner.registry.properties.get_typed(name)
    }

    /// Declared action by name.
    pub fn action(&self, name: &str) -> Option<&DeviceAction> {
        self.inner.registry.actions.get(name)
    }

    /// Protocol channel of this device.
    pub fn message_channel(&self) -> &MessageChannel {
        &self.inner.messages
    }

    /// Defaults the properties were declared with.
    pub fn property_defaults(&self) -> &PropertyDefaults {
        self.inner.registry.defaults()
    }

    /// Poll every readable property at the configured auto-update interval.
    pub fn auto_update(&self) -> AutoUpdater {
        AutoUpdater::spawn(
            self.properties().readable(),
            self.property_defaults().auto_update_interval,
        )
    }

    fn transition(&self, next: DeviceState) {
        let previous = self.inner.state.send_replace(next);
        info!(device = %self.name(), from = ?previous, to = ?next, "state transition");
    }

    /// Open the session and run device-specific setup.
    ///
    /// Fails with [`DaqError::Lifecycle`] unless the device is `Disconnected`;
    /// the session is not touched in that case. On setup failure the session is
    /// closed again and the device is back to `Disconnected`.
    pub async fn connect(&self) -> AppResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let state = self.state();
        if state != DeviceState::Disconnected {
            return Err(DaqError::Lifecycle {
                device: self.name().to_string(),
                state,
                message: "connect".to_string(),
            });
        }

        self.transition(DeviceState::Initializing);
        let channel = self.inner.messages.channel();

        if let Err(e) = channel.lock().await.open().await {
            self.transition(DeviceState::Disconnected);
            return Err(DaqError::Initialization {
                device: self.name().to_string(),
                message: format!("failed to open session: {e:#}"),
            });
        }

        if let Err(e) = self.inner.driver.initialize(&self.inner.messages).await {
            warn!(device = %self.name(), error = %e, "initialization failed, closing session");
            if let Err(close) = channel.lock().await.close().await {
                warn!(device = %self.name(), error = %format!("{close:#}"), "failed to close session");
            }
            self.transition(DeviceState::Disconnected);
            return Err(DaqError::Initialization {
                device: self.name().to_string(),
                message: e.to_string(),
            });
        }

        self.transition(DeviceState::Connected);
        Ok(())
    }

    /// Run device-specific teardown and close the session.
    ///
    /// No-op on a `Disconnected` device. In-flight writes and invocations
    /// settle first. The session is closed even if teardown fails; the
    /// teardown failure is returned afterwards.
    pub async fn disconnect(&self) -> AppResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.state() == DeviceState::Disconnected {
            return Ok(());
        }

        self.transition(DeviceState::Deinitializing);
        self.inner.registry.settle_all().await;

        let teardown = self.inner.driver.deinitialize(&self.inner.messages).await;
        let closed = self.inner.messages.channel().lock().await.close().await;
        self.transition(DeviceState::Disconnected);

        if let Err(e) = teardown {
            warn!(device = %self.name(), error = %e, "teardown failed");
            return Err(DaqError::Teardown {
                device: self.name().to_string(),
                message: e.to_string(),
            });
        }
        closed.map_err(|e| {
            warn!(device = %self.name(), error = %format!("{e:#}"), "failed to close session");
            DaqError::Teardown {
                device: self.name().to_string(),
                message: format!("failed to close session: {e:#}"),
            }
        })
    }

    /// Identification string (`*IDN?`).
    pub async fn get_identifier(&self) -> AppResult<String> {
        self.inner.messages.get_identifier().await
    }

    /// Reset the instrument (`*RST`).
    pub async fn reset(&self) -> AppResult<()> {
        self.inner.messages.reset().await
    }

    /// Clear the instrument's status registers (`*CLS`).
    pub async fn clear_status(&self) -> AppResult<()> {
        self.inner.messages.clear_status().await
    }
}

/// Driver for any SCPI-style instrument without device-specific parameters.
///
/// Declares an `identity` property (read from `*IDN?`) and `reset` / `clear`
/// actions. Initialization reads the identity once to prove the session works.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericScpiDriver;

#[async_trait]
impl DeviceDriver for GenericScpiDriver {
    fn declare(&self, channel: &MessageChannel, registry: &mut Registry) -> AppResult<()> {
        let ch = channel.clone();
        registry.property(
            AsyncProperty::read_only("identity", String::new(), move || {
                let ch = ch.clone();
                Box::pin(async move { ch.get_identifier().await })
            })
            .with_description("Instrument identification string"),
        )?;

        let ch = channel.clone();
        registry.action(DeviceAction::new("reset", move || {
            let ch = ch.clone();
            Box::pin(async move { ch.reset().await })
        }))?;

        let ch = channel.clone();
        registry.action(DeviceAction::new("clear", move || {
            let ch = ch.clone();
            Box::pin(async move { ch.clear_status().await })
        }))?;
        Ok(())
    }

    async fn initialize(&self, channel: &MessageChannel) -> AppResult<()> {
        let identity = channel.get_identifier().await?;
        info!(device = %channel.device(), identity = %identity, "instrument identified");
        Ok(())
    }
}
