//! String-keyed service registry with lazy, cached construction.
//!
//! Factories are stored type-erased and run *outside* the registry lock, so a
//! factory can resolve its own dependencies from the same registry.
//!
//! # Example
//!
//! ```ignore
//! let registry = ServiceRegistry::new();
//! registry.register("disks", ServiceLifetime::Singleton, |_| Ok(DiskService::probe()?));
//! registry.register("installer", ServiceLifetime::Transient, |registry| {
//!     let disks = registry.resolve::<DiskService>("disks")?;
//!     Ok(Installer::new(disks))
//! });
//!
//! let installer = registry.resolve::<Installer>("installer")?;
//! ```

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::error::MarshalError;

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&ServiceRegistry) -> anyhow::Result<Instance> + Send + Sync>;

/// How long a resolved service lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceLifetime {
    /// Built on first resolve, then shared.
    #[default]
    Singleton,
    /// Built on every resolve.
    Transient,
}

#[derive(Clone)]
struct Registration {
    factory: Factory,
    lifetime: ServiceLifetime,
}

#[derive(Default)]
struct Services {
    registrations: HashMap<String, Registration>,
    singletons: HashMap<String, Instance>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<Services>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Services> {
        self.services
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Services> {
        self.services
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a factory under `key`, replacing any previous registration
    /// and dropping a cached instance.
    pub fn register<T, F>(&self, key: impl Into<String>, lifetime: ServiceLifetime, factory: F)
    where
        T: Any + Send + Sync,
        F: Fn(&ServiceRegistry) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let key = key.into();
        let factory: Factory = Arc::new(move |registry: &ServiceRegistry| {
            Ok(Arc::new(factory(registry)?) as Instance)
        });

        let mut services = self.write();
        services.singletons.remove(&key);
        debug!(service = %key, ?lifetime, "service registered");
        services
            .registrations
            .insert(key, Registration { factory, lifetime });
    }

    /// Register an already built singleton.
    pub fn register_instance<T>(&self, key: impl Into<String>, instance: T)
    where
        T: Any + Send + Sync,
    {
        let key = key.into();
        let instance: Instance = Arc::new(instance);
        let cached = instance.clone();
        let factory: Factory = Arc::new(move |_: &ServiceRegistry| Ok(cached.clone()));

        let mut services = self.write();
        services.registrations.insert(
            key.clone(),
            Registration {
                factory,
                lifetime: ServiceLifetime::Singleton,
            },
        );
        services.singletons.insert(key, instance);
    }

    /// Resolve the service under `key` as a `T`.
    pub fn resolve<T>(&self, key: &str) -> Result<Arc<T>, MarshalError>
    where
        T: Any + Send + Sync,
    {
        let registration = {
            let services = self.read();
            if let Some(instance) = services.singletons.get(key) {
                return downcast(key, instance.clone());
            }
            services
                .registrations
                .get(key)
                .cloned()
                .ok_or_else(|| MarshalError::ServiceNotRegistered {
                    key: key.to_string(),
                })?
        };

        let instance = (registration.factory)(self).map_err(|source| {
            MarshalError::ServiceFactory {
                key: key.to_string(),
                source,
            }
        })?;

        if registration.lifetime == ServiceLifetime::Transient {
            return downcast(key, instance);
        }

        // Another thread may have built the singleton while the factory ran;
        // the first stored instance wins.
        let stored = self
            .write()
            .singletons
            .entry(key.to_string())
            .or_insert(instance)
            .clone();
        downcast(key, stored)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().registrations.contains_key(key)
    }

    /// Remove every registration and cached instance.
    pub fn clear(&self) {
        let mut services = self.write();
        services.registrations.clear();
        services.singletons.clear();
    }
}

fn downcast<T: Any + Send + Sync>(key: &str, instance: Instance) -> Result<Arc<T>, MarshalError> {
    instance
        .downcast::<T>()
        .map_err(|_| MarshalError::ServiceTypeMismatch {
            key: key.to_string(),
            expected: type_name::<T>(),
        })
}

impl fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let services = self.read();
        let mut keys: Vec<_> = services.registrations.keys().collect();
        keys.sort();
        f.debug_struct("ServiceRegistry")
            .field("services", &keys)
            .field("cached", &services.singletons.len())
            .finish()
    }
}
