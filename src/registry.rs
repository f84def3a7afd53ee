//! Type-erased collections of properties and actions.
//!
//! A device declares its properties once, at construction, into a
//! [`Registry`]. Callers can then enumerate them by name, fetch a typed handle
//! with [`PropertySet::get_typed`], or drive them generically through the
//! [`PropertyBase`] trait (JSON values, refresh, settle).

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;

use futures::future::join_all;

use crate::action::DeviceAction;
use crate::config::PropertyDefaults;
use crate::error::{AppResult, DaqError};
use crate::events::Completion;
use crate::property::{AsyncProperty, PropertyMetadata};

/// Type-erased access to an [`AsyncProperty`].
pub trait PropertyBase: Send + Sync {
    /// Property name
    fn name(&self) -> &str;

    /// Property metadata
    fn metadata(&self) -> &PropertyMetadata;

    /// Whether a getter is attached
    fn can_get(&self) -> bool {
        self.metadata().can_get
    }

    /// Whether a setter is attached
    fn can_set(&self) -> bool {
        self.metadata().can_set
    }

    /// Cached value as JSON
    fn value_json(&self) -> serde_json::Value;

    /// Schedule a write from a JSON value.
    ///
    /// Returns a settled handle without effect when the property has no setter.
    fn set_json(&self, value: serde_json::Value) -> AppResult<Completion>;

    /// Schedule a getter read.
    fn refresh(&self) -> Completion;

    /// Handle for the most recent write.
    fn settle(&self) -> Completion;

    /// Whether the last scheduled read already settled.
    fn refresh_settled(&self) -> bool;

    /// Clone into a new boxed handle to the same property.
    fn boxed_clone(&self) -> Box<dyn PropertyBase>;

    /// For downcasting to the concrete `AsyncProperty<T>`.
    fn as_any(&self) -> &dyn Any;
}

impl Debug for dyn PropertyBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyBase")
            .field("name", &self.name())
            .field("value", &self.value_json())
            .finish()
    }
}

/// Named collection of properties.
#[derive(Default)]
pub struct PropertySet {
    properties: BTreeMap<String, Box<dyn PropertyBase>>,
}

impl PropertySet {
    /// Create empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a property. Names must be unique.
    pub fn register<P>(&mut self, property: P) -> AppResult<()>
    where
        P: PropertyBase + 'static,
    {
        let name = property.name().to_string();
        if self.properties.contains_key(&name) {
            return Err(DaqError::Configuration(format!(
                "property '{name}' declared twice"
            )));
        }
        self.properties.insert(name, Box::new(property));
        Ok(())
    }

    /// Get property by name
    pub fn get(&self, name: &str) -> Option<&dyn PropertyBase> {
        self.properties.get(name).map(|p| p.as_ref())
    }

    /// Get typed property by name
    pub fn get_typed<T>(&self, name: &str) -> Option<AsyncProperty<T>>
    where
        T: Clone + Send + Sync + Debug + 'static,
    {
        self.properties
            .get(name)
            .and_then(|p| p.as_any().downcast_ref::<AsyncProperty<T>>())
            .cloned()
    }

    /// Iterate over all properties
    pub fn iter(&self) -> impl Iterator<Item = (&str, &dyn PropertyBase)> {
        self.properties
            .iter()
            .map(|(name, property)| (name.as_str(), property.as_ref()))
    }

    /// Property names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }

    /// Properties that have a getter.
    pub fn readable(&self) -> Vec<Box<dyn PropertyBase>> {
        self.properties
            .values()
            .filter(|p| p.can_get())
            .map(|p| p.boxed_clone())
            .collect()
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether no property is declared
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }

    /// Schedule a getter read on every readable property and wait for all of them.
    pub async fn refresh_all(&self) {
        join_all(self.properties.values().map(|p| p.refresh())).await;
    }

    /// Wait until the most recent write of every property settled.
    pub async fn settle_all(&self) {
        join_all(self.properties.values().map(|p| p.settle())).await;
    }
}

/// Named collection of actions.
#[derive(Default)]
pub struct ActionSet {
    actions: BTreeMap<String, DeviceAction>,
}

impl ActionSet {
    /// Create empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action. Names must be unique.
    pub fn register(&mut self, action: DeviceAction) -> AppResult<()> {
        let name = action.name().to_string();
        if self.actions.contains_key(&name) {
            return Err(DaqError::Configuration(format!(
                "action '{name}' declared twice"
            )));
        }
        self.actions.insert(name, action);
        Ok(())
    }

    /// Get action by name
    pub fn get(&self, name: &str) -> Option<&DeviceAction> {
        self.actions.get(name)
    }

    /// Action names in sorted order
    pub fn names(&self) -> Vec<&str> {
        self.actions.keys().map(String::as_str).collect()
    }

    /// Iterate over all actions
    pub fn iter(&self) -> impl Iterator<Item = &DeviceAction> {
        self.actions.values()
    }

    /// Wait until the most recent invocation of every action settled.
    pub async fn settle_all(&self) {
        join_all(self.actions.values().map(|a| a.await_completion())).await;
    }
}

/// Everything a device declares: its properties and its actions.
#[derive(Default)]
pub struct Registry {
    /// Declared properties
    pub properties: PropertySet,
    /// Declared actions
    pub actions: ActionSet,
    defaults: PropertyDefaults,
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry whose properties get `defaults`.
    pub fn with_defaults(defaults: PropertyDefaults) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    /// Defaults applied by [`property`](Self::property).
    pub fn defaults(&self) -> &PropertyDefaults {
        &self.defaults
    }

    /// Declare a property and return a handle to it.
    ///
    /// The registry's [`PropertyDefaults`] (auto-refresh policy, event
    /// capacity) are applied first and win over builder settings. A property
    /// that needs its own policy is registered through
    /// [`PropertySet::register`] instead.
    pub fn property<T>(&mut self, property: AsyncProperty<T>) -> AppResult<AsyncProperty<T>>
    where
        T: Clone
            + Send
            + Sync
            + Debug
            + serde::Serialize
            + serde::de::DeserializeOwned
            + 'static,
    {
        let property = self.defaults.apply(property);
        self.properties.register(property.clone())?;
        Ok(property)
    }

    /// Declare an action and return a handle to it.
    pub fn action(&mut self, action: DeviceAction) -> AppResult<DeviceAction> {
        self.actions.register(action.clone())?;
        Ok(action)
    }

    /// Wait for every in-flight write and invocation to settle.
    pub async fn settle_all(&self) {
        self.properties.settle_all().await;
        self.actions.settle_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant(name: &str, value: f64) -> AsyncProperty<f64> {
        AsyncProperty::read_only(name, 0.0, move || Box::pin(async move { Ok(value) }))
    }

    #[tokio::test]
    async fn test_property_set_register_and_lookup() {
        let mut set = PropertySet::new();
        set.register(constant("voltage", 5.0)).unwrap();
        set.register(constant("current", 0.1)).unwrap();

        assert_eq!(set.names(), vec!["current", "voltage"]);
        assert_eq!(set.len(), 2);

        let voltage = set.get_typed::<f64>("voltage").unwrap();
        voltage.read_getter().await;
        assert_eq!(set.get("voltage").unwrap().value_json(), serde_json::json!(5.0));

        assert!(set.get_typed::<bool>("voltage").is_none());
        assert!(set.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut set = PropertySet::new();
        set.register(constant("voltage", 5.0)).unwrap();
        let err = set.register(constant("voltage", 6.0)).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_readable_skips_write_only() {
        let mut registry = Registry::new();
        registry.property(constant("voltage", 1.0)).unwrap();
        registry
            .property(AsyncProperty::write_only("display", String::new(), |_t: String| {
                Box::pin(async { Ok(()) })
            }))
            .unwrap();
        registry
            .action(DeviceAction::new("reset", || Box::pin(async { Ok(()) })))
            .unwrap();

        let readable = registry.properties.readable();
        assert_eq!(readable.len(), 1);
        assert_eq!(readable[0].name(), "voltage");
        assert_eq!(registry.actions.names(), vec!["reset"]);

        registry.settle_all().await;
    }

    #[test]
    fn test_declared_properties_get_registry_defaults() {
        let defaults = PropertyDefaults {
            auto_refresh_after_set: false,
            ..PropertyDefaults::default()
        };
        let mut registry = Registry::with_defaults(defaults);
        let voltage = registry
            .property(
                AsyncProperty::read_write(
                    "voltage",
                    0.0,
                    || Box::pin(async { Ok(1.0) }),
                    |_v: f64| Box::pin(async { Ok(()) }),
                )
                .with_auto_refresh(true),
            )
            .unwrap();

        assert!(!voltage.auto_refresh());
        assert!(!registry.properties.get_typed::<f64>("voltage").unwrap().auto_refresh());
        assert!(Registry::new().defaults().auto_refresh_after_set);
    }
}
