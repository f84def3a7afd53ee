//! Notification plumbing shared by properties and actions.
//!
//! Every [`AsyncProperty`](crate::property::AsyncProperty) publishes
//! [`PropertyEvent`]s on a `tokio::sync::broadcast` channel and to an optional
//! list of synchronous listeners. Work scheduled on a property is represented
//! by a [`Completion`], a cloneable handle that resolves once that unit of
//! work has settled (successfully or not).

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{warn, Instrument};

use crate::error::DaqError;

/// Which direction of a property a failure belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Getter callback (device to cache).
    Get,
    /// Setter callback (caller to device).
    Set,
    /// Action callback.
    Invoke,
}

/// Notification published by a property or action.
///
/// Failures never propagate to the caller of `write_setter`/`invoke`; they are
/// delivered here as [`PropertyEvent::Failed`].
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyEvent<T> {
    /// The observable value changed.
    ///
    /// After a read, `old` and `new` are the cached value before and after it.
    /// After a successful write, `new` is the value the device accepted and
    /// `old` is the cached value at that moment; a write never touches the
    /// cache, so on a set-only property `old` is always the initial value.
    ValueChanged {
        /// Cached value before the change.
        old: T,
        /// Value after the change.
        new: T,
    },
    /// The getter completed and the cache now holds this value.
    GetterUpdated(T),
    /// Setter (or action) processing acquired the property and is about to
    /// call the device.
    SetterStarted(T),
    /// The setter (or action) callback completed successfully.
    SetterCompleted(T),
    /// A callback failed. The cache is left untouched.
    Failed {
        /// Direction that failed.
        operation: Operation,
        /// Causing failure.
        error: DaqError,
    },
}

impl<T> PropertyEvent<T> {
    /// The failure carried by this event, if any.
    pub fn error(&self) -> Option<&DaqError> {
        match self {
            PropertyEvent::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

/// Events published by a [`DeviceAction`](crate::action::DeviceAction).
///
/// Actions only ever emit `SetterStarted(())`, `SetterCompleted(())` and
/// `Failed { operation: Operation::Invoke, .. }`.
pub type ActionEvent = PropertyEvent<()>;

/// Synchronous observer invoked from the background unit that produced the event.
pub type Listener<T> = Arc<dyn Fn(&PropertyEvent<T>) + Send + Sync>;

/// Awaitable handle for a scheduled unit of work.
///
/// Cloning is cheap and every clone resolves at the same moment. Awaiting a
/// completion never yields an error: outcomes are reported through events.
#[derive(Clone)]
pub struct Completion {
    inner: Shared<BoxFuture<'static, ()>>,
}

impl Completion {
    /// A handle that is already settled (used for no-op requests).
    pub fn ready() -> Self {
        let inner = futures::future::ready(()).boxed().shared();
        // Shared only records its output once polled.
        let _ = inner.clone().now_or_never();
        Self { inner }
    }

    /// Spawn `work` on the Tokio runtime and return its completion handle.
    ///
    /// The task runs to completion even if every handle is dropped, inside
    /// the caller's current span. A panic in `work` settles the handle like
    /// any other outcome; it is logged and never reaches an awaiting caller.
    pub(crate) fn spawn<F>(work: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = tokio::spawn(work.in_current_span());
        let inner = async move {
            if let Err(error) = task.await {
                warn!(%error, "background unit ended abnormally");
            }
        }
        .in_current_span()
        .boxed()
        .shared();
        tokio::spawn(inner.clone());
        Self { inner }
    }

    /// Whether the underlying work has already finished.
    pub fn is_settled(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::ready()
    }
}

impl Future for Completion {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("settled", &self.is_settled())
            .finish()
    }
}
