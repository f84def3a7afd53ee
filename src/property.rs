//! AsyncProperty<T> - cached, serialized, observable device parameters
//!
//! An `AsyncProperty` is the client-facing view of one instrument parameter
//! (a voltage, an output flag, display text). Reads and writes are dispatched
//! to caller-supplied callbacks on background Tokio tasks, so the caller never
//! blocks on the slow communication channel behind them.
//!
//! # Architecture
//!
//! ```text
//! AsyncProperty<T>
//!   ├─ getter: Option<F>          (device -> cache)
//!   ├─ setter: Option<F>          (value -> device)
//!   ├─ cached: watch::Sender<T>   (last value read from the device)
//!   ├─ schedule: Mutex<Schedule>  (pending write, completion chain)
//!   ├─ events: broadcast::Sender  (ValueChanged, GetterUpdated, ...)
//!   └─ listeners: Vec<F>          (synchronous observers)
//! ```
//!
//! Every unit of work waits for its predecessor before running, so getter and
//! setter processing on one property are mutually exclusive and run in the
//! order they were requested. Different properties are *not* serialized here;
//! their callbacks meet at the device channel lock instead.
//!
//! # Example
//!
//! ```rust,ignore
//! let voltage = AsyncProperty::read_write(
//!     "voltage",
//!     0.0,
//!     move || { let ch = ch.clone(); Box::pin(async move { parse(ch.send_message("VOLT?").await?) }) },
//!     move |v| { let ch = ch2.clone(); Box::pin(async move { ch.send_message(&format!("VOLT {v}")).await.map(|_| ()) }) },
//! );
//!
//! // Fire and forget; failures arrive as events.
//! voltage.write_setter(5.0);
//!
//! // Or wait until the write (and the automatic re-read) settled.
//! voltage.write_setter(12.0).await;
//! println!("device reports {}", voltage.get());
//! ```

use std::any::Any;
use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};
use crate::events::{Completion, Listener, Operation, PropertyEvent};
use crate::registry::PropertyBase;

/// Default capacity of a property's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Getter callback: reads the current value from the device.
pub type Getter<T> = Arc<dyn Fn() -> BoxFuture<'static, AppResult<T>> + Send + Sync>;

/// Setter callback: writes a value to the device.
pub type Setter<T> = Arc<dyn Fn(T) -> BoxFuture<'static, AppResult<()>> + Send + Sync>;

/// Descriptive metadata of a property.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropertyMetadata {
    /// Property name (unique within its device)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Physical unit (e.g., "V", "A")
    pub unit: Option<String>,
    /// Whether a getter callback is attached
    pub can_get: bool,
    /// Whether a setter callback is attached
    pub can_set: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Property,
    Action,
}

/// Serialization state guarded by one lock so that recording the pending
/// value and extending the chain happen atomically.
struct Schedule<T> {
    tail: Completion,
    last_setter: Completion,
    last_getter: Completion,
    generation: u64,
    pending: Option<T>,
}

struct PropertyState<T> {
    cached: watch::Sender<T>,
    schedule: Mutex<Schedule<T>>,
    events: broadcast::Sender<PropertyEvent<T>>,
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T: Clone> PropertyState<T> {
    fn new(initial: T, capacity: usize) -> Self {
        let (cached, _) = watch::channel(initial);
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            cached,
            schedule: Mutex::new(Schedule {
                tail: Completion::ready(),
                last_setter: Completion::ready(),
                last_getter: Completion::ready(),
                generation: 0,
                pending: None,
            }),
            events,
            listeners: RwLock::new(Vec::new()),
        }
    }
}

/// Cached, serialized, observable get/set slot backed by device callbacks.
///
/// Cloning yields another handle to the same property.
///
/// # Type Requirements
///
/// T must implement:
/// - Clone: values are distributed to the cache, events and listeners
/// - Send + Sync + 'static: values cross into background tasks
/// - Debug: for logging
pub struct AsyncProperty<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    metadata: Arc<PropertyMetadata>,
    getter: Option<Getter<T>>,
    setter: Option<Setter<T>>,
    auto_refresh: bool,
    kind: Kind,
    state: Arc<PropertyState<T>>,
}

impl<T> Clone for AsyncProperty<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn clone(&self) -> Self {
        Self {
            metadata: self.metadata.clone(),
            getter: self.getter.clone(),
            setter: self.setter.clone(),
            auto_refresh: self.auto_refresh,
            kind: self.kind,
            state: self.state.clone(),
        }
    }
}

impl<T> Debug for AsyncProperty<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProperty")
            .field("metadata", &self.metadata)
            .field("auto_refresh", &self.auto_refresh)
            .field("cached", &*self.state.cached.borrow())
            .finish()
    }
}

impl<T> AsyncProperty<T>
where
    T: Clone + Send + Sync + Debug + 'static,
{
    fn build(
        name: impl Into<String>,
        initial: T,
        getter: Option<Getter<T>>,
        setter: Option<Setter<T>>,
    ) -> Self {
        Self {
            metadata: Arc::new(PropertyMetadata {
                name: name.into(),
                description: None,
                unit: None,
                can_get: getter.is_some(),
                can_set: setter.is_some(),
            }),
            getter,
            setter,
            auto_refresh: true,
            kind: Kind::Property,
            state: Arc::new(PropertyState::new(initial, DEFAULT_EVENT_CAPACITY)),
        }
    }

    /// Create a get-only property.
    pub fn read_only<G>(name: impl Into<String>, initial: T, getter: G) -> Self
    where
        G: Fn() -> BoxFuture<'static, AppResult<T>> + Send + Sync + 'static,
    {
        Self::build(name, initial, Some(Arc::new(getter)), None)
    }

    /// Create a set-only property. `initial` is what `get()` reports forever.
    pub fn write_only<S>(name: impl Into<String>, initial: T, setter: S) -> Self
    where
        S: Fn(T) -> BoxFuture<'static, AppResult<()>> + Send + Sync + 'static,
    {
        Self::build(name, initial, None, Some(Arc::new(setter)))
    }

    /// Create a property that can be both read and written.
    pub fn read_write<G, S>(name: impl Into<String>, initial: T, getter: G, setter: S) -> Self
    where
        G: Fn() -> BoxFuture<'static, AppResult<T>> + Send + Sync + 'static,
        S: Fn(T) -> BoxFuture<'static, AppResult<()>> + Send + Sync + 'static,
    {
        Self::build(name, initial, Some(Arc::new(getter)), Some(Arc::new(setter)))
    }

    /// Re-read the device after every write (default `true`).
    pub fn with_auto_refresh(mut self, enabled: bool) -> Self {
        self.auto_refresh = enabled;
        self
    }

    /// Set property description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.metadata).description = Some(description.into());
        self
    }

    /// Set property unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        Arc::make_mut(&mut self.metadata).unit = Some(unit.into());
        self
    }

    /// Resize the event channel.
    ///
    /// Must be called while building the property: it replaces the shared
    /// state, so existing clones, subscribers and listeners are detached.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        let current = self.state.cached.borrow().clone();
        self.state = Arc::new(PropertyState::new(current, capacity));
        self
    }

    pub(crate) fn into_action(mut self) -> Self {
        self.kind = Kind::Action;
        self.auto_refresh = false;
        self
    }

    /// Property name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Property metadata
    pub fn metadata(&self) -> &PropertyMetadata {
        &self.metadata
    }

    /// Whether a getter is attached.
    pub fn can_get(&self) -> bool {
        self.getter.is_some()
    }

    /// Whether a setter is attached.
    pub fn can_set(&self) -> bool {
        self.setter.is_some()
    }

    /// Whether writes are followed by a getter read.
    pub fn auto_refresh(&self) -> bool {
        self.auto_refresh
    }

    /// Last value produced by the getter (or the initial value).
    pub fn get(&self) -> T {
        self.state.cached.borrow().clone()
    }

    /// Value of the most recent write that has not completed successfully yet.
    pub fn pending(&self) -> Option<T> {
        self.state.schedule.lock().pending.clone()
    }

    /// Subscribe to the cached value.
    ///
    /// The receiver is notified whenever the getter stores a value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.state.cached.subscribe()
    }

    /// Subscribe to the notification stream.
    pub fn events(&self) -> broadcast::Receiver<PropertyEvent<T>> {
        self.state.events.subscribe()
    }

    /// Register a synchronous observer for every notification.
    pub fn add_listener(&self, listener: impl Fn(&PropertyEvent<T>) + Send + Sync + 'static) {
        self.state.listeners.write().push(Arc::new(listener));
    }

    /// Schedule a read of the device into the cache.
    ///
    /// No-op on a set-only property. Never fails: a getter error is published
    /// as [`PropertyEvent::Failed`] and the cached value is left unchanged.
    pub fn read_getter(&self) -> Completion {
        if self.getter.is_none() {
            return Completion::ready();
        }
        let this = self.clone();
        let mut schedule = self.state.schedule.lock();
        let completion = Self::chain(&mut schedule, async move { this.run_getter().await });
        schedule.last_getter = completion.clone();
        completion
    }

    /// Record `value` as pending and schedule it to be written to the device.
    ///
    /// No-op on a get-only property. The returned handle resolves after the
    /// setter callback (and the automatic re-read, when enabled) finished.
    pub fn write_setter(&self, value: T) -> Completion {
        if self.setter.is_none() {
            return Completion::ready();
        }
        let this = self.clone();
        let mut schedule = self.state.schedule.lock();
        schedule.generation += 1;
        schedule.pending = Some(value.clone());
        let generation = schedule.generation;
        let completion = Self::chain(&mut schedule, async move {
            this.run_setter(value, generation).await;
        });
        schedule.last_setter = completion.clone();
        completion
    }

    /// Handle for the most recently scheduled write.
    ///
    /// Already resolved if nothing was ever written.
    pub fn await_setter_completion(&self) -> Completion {
        self.state.schedule.lock().last_setter.clone()
    }

    /// Whether the most recent read has settled.
    pub fn refresh_settled(&self) -> bool {
        self.state.schedule.lock().last_getter.is_settled()
    }

    fn chain<F>(schedule: &mut Schedule<T>, work: F) -> Completion
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let previous = schedule.tail.clone();
        let completion = Completion::spawn(async move {
            previous.await;
            work.await;
        });
        schedule.tail = completion.clone();
        completion
    }

    async fn run_getter(&self) {
        let Some(getter) = self.getter.clone() else {
            return;
        };
        let result = self.contain(async move { getter().await }).await;
        match result {
            Ok(value) => {
                let old = self.state.cached.send_replace(value.clone());
                debug!(property = %self.name(), ?value, "getter updated");
                self.emit(PropertyEvent::ValueChanged {
                    old,
                    new: value.clone(),
                });
                self.emit(PropertyEvent::GetterUpdated(value));
            }
            Err(error) => {
                warn!(property = %self.name(), %error, "getter failed");
                self.emit(PropertyEvent::Failed {
                    operation: Operation::Get,
                    error,
                });
            }
        }
    }

    async fn run_setter(&self, value: T, generation: u64) {
        let Some(setter) = self.setter.clone() else {
            return;
        };
        self.emit(PropertyEvent::SetterStarted(value.clone()));

        let argument = value.clone();
        let result = self.contain(async move { setter(argument).await }).await;
        match result {
            Ok(()) => {
                {
                    let mut schedule = self.state.schedule.lock();
                    if schedule.generation == generation {
                        schedule.pending = None;
                    }
                }
                debug!(property = %self.name(), ?value, "setter completed");
                if self.kind == Kind::Property {
                    self.emit(PropertyEvent::ValueChanged {
                        old: self.get(),
                        new: value.clone(),
                    });
                }
                self.emit(PropertyEvent::SetterCompleted(value));
            }
            Err(error) => {
                warn!(property = %self.name(), %error, "setter failed");
                let operation = match self.kind {
                    Kind::Property => Operation::Set,
                    Kind::Action => Operation::Invoke,
                };
                self.emit(PropertyEvent::Failed { operation, error });
            }
        }

        if self.auto_refresh {
            self.run_getter().await;
        }
    }

    /// Run a callback future, turning a panic into a `Callback` error.
    async fn contain<R, F>(&self, callback: F) -> AppResult<R>
    where
        F: std::future::Future<Output = AppResult<R>>,
    {
        match AssertUnwindSafe(callback).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(DaqError::Callback {
                property: self.name().to_string(),
                message: panic_message(panic.as_ref()),
            }),
        }
    }

    fn emit(&self, event: PropertyEvent<T>) {
        let listeners = self.state.listeners.read().clone();
        for listener in &listeners {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if let Err(panic) = call {
                warn!(
                    property = %self.name(),
                    panic = %panic_message(panic.as_ref()),
                    "listener panicked"
                );
            }
        }
        // No subscribers is fine: nobody is watching this property right now.
        let _ = self.state.events.send(event);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("callback panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("callback panicked: {message}")
    } else {
        "callback panicked".to_string()
    }
}

// =============================================================================
// PropertyBase Implementation (for dynamic collections)
// =============================================================================

impl<T> PropertyBase for AsyncProperty<T>
where
    T: Clone + Send + Sync + Debug + Serialize + DeserializeOwned + 'static,
{
    fn name(&self) -> &str {
        &self.metadata.name
    }

    fn metadata(&self) -> &PropertyMetadata {
        &self.metadata
    }

    fn value_json(&self) -> serde_json::Value {
        serde_json::to_value(self.get()).unwrap_or(serde_json::Value::Null)
    }

    fn set_json(&self, value: serde_json::Value) -> AppResult<Completion> {
        if !self.can_set() {
            return Ok(Completion::ready());
        }
        let typed: T = serde_json::from_value(value).map_err(|e| DaqError::InvalidValue {
            property: self.name().to_string(),
            message: format!("{e}. Expected type: {}", std::any::type_name::<T>()),
        })?;
        Ok(self.write_setter(typed))
    }

    fn refresh(&self) -> Completion {
        self.read_getter()
    }

    fn settle(&self) -> Completion {
        self.await_setter_completion()
    }

    fn refresh_settled(&self) -> bool {
        AsyncProperty::refresh_settled(self)
    }

    fn boxed_clone(&self) -> Box<dyn PropertyBase> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn device_cell() -> Arc<Mutex<f64>> {
        Arc::new(Mutex::new(0.0))
    }

    fn clamped_voltage(cell: Arc<Mutex<f64>>, limit: f64) -> AsyncProperty<f64> {
        let read_cell = cell.clone();
        AsyncProperty::read_write(
            "voltage",
            0.0,
            move || {
                let cell = read_cell.clone();
                Box::pin(async move { Ok(*cell.lock()) })
            },
            move |value: f64| {
                let cell = cell.clone();
                Box::pin(async move {
                    *cell.lock() = value.min(limit);
                    Ok(())
                })
            },
        )
    }

    #[tokio::test]
    async fn test_property_basic() {
        let cell = device_cell();
        let voltage = clamped_voltage(cell.clone(), 30.0);
        assert!(voltage.can_get());
        assert!(voltage.can_set());
        assert_eq!(voltage.get(), 0.0);

        voltage.write_setter(12.5).await;
        assert_eq!(*cell.lock(), 12.5);
        assert_eq!(voltage.get(), 12.5);
        assert!(voltage.pending().is_none());
    }

    #[tokio::test]
    async fn test_auto_refresh_reflects_device_clamping() {
        let voltage = clamped_voltage(device_cell(), 30.0);
        voltage.write_setter(50.0).await;
        assert_eq!(voltage.get(), 30.0);
    }

    #[tokio::test]
    async fn test_without_auto_refresh_cache_is_untouched() {
        let voltage = clamped_voltage(device_cell(), 30.0).with_auto_refresh(false);
        voltage.write_setter(10.0).await;
        assert_eq!(voltage.get(), 0.0);

        voltage.read_getter().await;
        assert_eq!(voltage.get(), 10.0);
    }

    #[tokio::test]
    async fn test_read_only_ignores_writes() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let temperature = AsyncProperty::read_only("temperature", 20.0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(21.5) })
        });
        let mut events = temperature.events();

        let done = temperature.write_setter(99.0);
        assert!(done.is_settled());
        assert!(temperature.pending().is_none());
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert!(events.try_recv().is_err());

        temperature.read_getter().await;
        assert_eq!(temperature.get(), 21.5);
    }

    #[tokio::test]
    async fn test_write_only_ignores_reads() {
        let written = Arc::new(Mutex::new(String::new()));
        let sink = written.clone();
        let display = AsyncProperty::write_only("display", String::new(), move |text: String| {
            let sink = sink.clone();
            Box::pin(async move {
                *sink.lock() = text;
                Ok(())
            })
        });

        let mut events = display.events();

        assert!(display.read_getter().is_settled());
        display.write_setter("HELLO".to_string()).await;
        display.write_setter("WORLD".to_string()).await;
        assert_eq!(written.lock().as_str(), "WORLD");
        assert_eq!(display.get(), "");

        // Writes report the accepted value against the untouched cache.
        let changes: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                PropertyEvent::ValueChanged { old, new } => Some((old, new)),
                _ => None,
            })
            .collect();
        assert_eq!(
            changes,
            vec![
                (String::new(), "HELLO".to_string()),
                (String::new(), "WORLD".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_event_sequence_for_successful_write() {
        let voltage = clamped_voltage(device_cell(), 30.0);
        let mut events = voltage.events();

        voltage.write_setter(5.0).await;

        assert_eq!(events.recv().await.unwrap(), PropertyEvent::SetterStarted(5.0));
        assert_eq!(
            events.recv().await.unwrap(),
            PropertyEvent::ValueChanged { old: 0.0, new: 5.0 }
        );
        assert_eq!(events.recv().await.unwrap(), PropertyEvent::SetterCompleted(5.0));
        assert_eq!(
            events.recv().await.unwrap(),
            PropertyEvent::ValueChanged { old: 0.0, new: 5.0 }
        );
        assert_eq!(events.recv().await.unwrap(), PropertyEvent::GetterUpdated(5.0));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_setter_failure_is_contained() {
        let output = AsyncProperty::write_only("output", false, |_on: bool| {
            Box::pin(async {
                Err(DaqError::Transport {
                    device: "psu".into(),
                    command: "OUTP ON".into(),
                    message: "link down".into(),
                })
            })
        });
        let mut events = output.events();

        output.write_setter(true).await;

        assert_eq!(events.recv().await.unwrap(), PropertyEvent::SetterStarted(true));
        match events.recv().await.unwrap() {
            PropertyEvent::Failed { operation, error } => {
                assert_eq!(operation, Operation::Set);
                assert!(error.to_string().contains("link down"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(output.pending(), Some(true));
        assert!(logs_contain("setter failed"));
    }

    #[tokio::test]
    async fn test_getter_failure_keeps_cache() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let current = AsyncProperty::read_only("current", 1.5, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n == 0 {
                    Err(DaqError::Configuration("no answer".into()))
                } else {
                    Ok(2.5)
                }
            })
        });
        let mut events = current.events();

        current.read_getter().await;
        assert_eq!(current.get(), 1.5);
        assert_eq!(
            events.recv().await.unwrap().error().cloned(),
            Some(DaqError::Configuration("no answer".into()))
        );

        current.read_getter().await;
        assert_eq!(current.get(), 2.5);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_reported() {
        let flaky = AsyncProperty::write_only("flaky", 0u32, |value: u32| {
            Box::pin(async move {
                if value == 13 {
                    panic!("unlucky");
                }
                Ok(())
            })
        });
        let mut events = flaky.events();

        flaky.write_setter(13).await;
        let _started = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            PropertyEvent::Failed { error, .. } => {
                assert!(matches!(error, DaqError::Callback { .. }));
                assert!(error.to_string().contains("unlucky"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // The property keeps working afterwards.
        flaky.write_setter(1).await;
        assert!(flaky.pending().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_writes_run_in_issue_order_without_overlap() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let (sink, busy, clash) = (log.clone(), active.clone(), overlaps.clone());
        let setpoint = AsyncProperty::write_only("setpoint", 0u64, move |value: u64| {
            let (sink, busy, clash) = (sink.clone(), busy.clone(), clash.clone());
            Box::pin(async move {
                if busy.fetch_add(1, Ordering::SeqCst) != 0 {
                    clash.fetch_add(1, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.lock().push(value);
                busy.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let first = setpoint.write_setter(1);
        let second = setpoint.write_setter(2);
        assert_eq!(setpoint.pending(), Some(2));

        second.await;
        assert!(first.is_settled());
        assert_eq!(*log.lock(), vec![1, 2]);
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(setpoint.pending().is_none());
    }

    #[tokio::test]
    async fn test_earlier_write_does_not_clear_newer_pending_value() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let permits = gate.clone();
        let setpoint = AsyncProperty::write_only("setpoint", 0u64, move |_value: u64| {
            let permits = permits.clone();
            Box::pin(async move {
                permits.acquire().await.map(|p| p.forget()).ok();
                Ok(())
            })
        });

        let first = setpoint.write_setter(1);
        let second = setpoint.write_setter(2);
        gate.add_permits(1);
        first.await;
        assert_eq!(setpoint.pending(), Some(2));

        gate.add_permits(1);
        second.await;
        assert!(setpoint.pending().is_none());
    }

    #[tokio::test]
    async fn test_await_setter_completion() {
        let voltage = clamped_voltage(device_cell(), 30.0);
        assert!(voltage.await_setter_completion().is_settled());

        let _ = voltage.write_setter(3.0);
        voltage.await_setter_completion().await;
        assert_eq!(voltage.get(), 3.0);
    }

    #[tokio::test]
    async fn test_listener_and_subscription() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = calls.clone();
        let voltage = clamped_voltage(device_cell(), 30.0);
        voltage.add_listener(move |event| {
            if matches!(event, PropertyEvent::GetterUpdated(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        let mut rx = voltage.subscribe();

        voltage.write_setter(7.0).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 7.0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panicking_listener_does_not_break_property() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let setpoint = AsyncProperty::write_only("setpoint", 0u32, move |_value: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        });
        let tripped = Arc::new(AtomicUsize::new(0));
        let once = tripped.clone();
        setpoint.add_listener(move |event| {
            if matches!(event, PropertyEvent::SetterCompleted(_))
                && once.fetch_add(1, Ordering::SeqCst) == 0
            {
                panic!("observer failed");
            }
        });
        let mut events = setpoint.events();

        setpoint.write_setter(1).await;
        setpoint.write_setter(2).await;
        setpoint.await_setter_completion().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(setpoint.pending().is_none());
        let mut completed = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PropertyEvent::SetterCompleted(v) = event {
                completed.push(v);
            }
        }
        assert_eq!(completed, vec![1, 2]);
        assert!(logs_contain("listener panicked"));
    }

    #[tokio::test]
    async fn test_property_base_json_access() {
        let voltage = clamped_voltage(device_cell(), 30.0).with_unit("V");
        let param: &dyn PropertyBase = &voltage;

        assert_eq!(param.name(), "voltage");
        assert_eq!(param.metadata().unit.as_deref(), Some("V"));
        param.set_json(serde_json::json!(4.0)).unwrap().await;
        assert_eq!(param.value_json(), serde_json::json!(4.0));

        let err = param.set_json(serde_json::json!("four")).unwrap_err();
        assert!(matches!(err, DaqError::InvalidValue { .. }));
    }
}
