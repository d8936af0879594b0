//! Service resolution for injected dependencies.
//!
//! Transitions, business methods and handlers may depend on services (clocks,
//! pricing tables, id generators). Dependencies are declared up front and
//! resolved once when a table is bound, never looked up per invocation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Identity of a service type.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    id: TypeId,
    name: &'static str,
}

impl ServiceKey {
    /// The key of service type `T`.
    pub fn of<T: Any + Send + Sync>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The service type name.
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServiceKey").field(&self.name).finish()
    }
}

/// A source of shared service instances.
pub trait ServiceProvider: Send + Sync {
    /// Returns the instance registered under `key`, if any.
    fn resolve(&self, key: ServiceKey) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Typed lookup on top of any [`ServiceProvider`].
pub trait ServiceProviderExt: ServiceProvider {
    /// Returns the instance of `T`, if registered.
    fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resolve(ServiceKey::of::<T>())
            .and_then(|service| service.downcast::<T>().ok())
    }
}

impl<P: ServiceProvider + ?Sized> ServiceProviderExt for P {}

/// A simple type-keyed service map.
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<TypeId, (ServiceKey, Arc<dyn Any + Send + Sync>)>,
}

impl Services {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `service`, replacing any previous instance of its type.
    #[must_use]
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.insert(service);
        self
    }

    /// Registers `service`, replacing any previous instance of its type.
    pub fn insert<T: Any + Send + Sync>(&mut self, service: T) {
        self.insert_arc(Arc::new(service));
    }

    /// Registers an already shared instance.
    pub fn insert_arc<T: Any + Send + Sync>(&mut self, service: Arc<T>) {
        let key = ServiceKey::of::<T>();
        self.entries.insert(key.id, (key, service));
    }

    /// Whether a service of type `T` is registered.
    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no service is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ServiceProvider for Services {
    fn resolve(&self, key: ServiceKey) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries
            .get(&key.id)
            .map(|(_, service)| Arc::clone(service))
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.values().map(|(key, _)| key.name))
            .finish()
    }
}
