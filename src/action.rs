//! Fire-and-forget device commands.
//!
//! A [`DeviceAction`] is a parameterless, write-only property: invoking it
//! schedules its callback on a background task and returns immediately. Calls
//! to one action are serialized in issue order, exactly like writes to a
//! property, and failures are reported through [`ActionEvent`]s.

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::AppResult;
use crate::events::{ActionEvent, Completion};
use crate::property::AsyncProperty;

/// Named device command such as `reset` or `clear`.
#[derive(Clone, Debug)]
pub struct DeviceAction {
    inner: AsyncProperty<()>,
}

impl DeviceAction {
    /// Create an action from its callback.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, AppResult<()>> + Send + Sync + 'static,
    {
        let inner = AsyncProperty::write_only(name, (), move |()| callback()).into_action();
        Self { inner }
    }

    /// Set action description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.inner = self.inner.with_description(description);
        self
    }

    /// Action name
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Schedule the callback. Never fails; see [`DeviceAction::events`].
    pub fn invoke(&self) -> Completion {
        self.inner.write_setter(())
    }

    /// Handle for the most recent invocation.
    pub fn await_completion(&self) -> Completion {
        self.inner.await_setter_completion()
    }

    /// Subscribe to started/completed/failed notifications.
    pub fn events(&self) -> broadcast::Receiver<ActionEvent> {
        self.inner.events()
    }

    /// Register a synchronous observer.
    pub fn add_listener(&self, listener: impl Fn(&ActionEvent) + Send + Sync + 'static) {
        self.inner.add_listener(listener);
    }
}
