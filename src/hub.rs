//! Provides a tiny registry which exposes the central components of the cache.
//!
//! The hub is more or less a simple map which keeps all central components as **Arc<T>**
//! around (the config, the region manager, custom services). It also owns the central
//! **is_running** flag which all background tasks (shrinkers, the config monitor) poll and
//! which is toggled to *false* once [Hub::terminate](Hub::terminate) is invoked.
//!
//! In common cases [Hub::require](Hub::require) is the right way of fetching a component which
//! is known to be there. Be aware that once shutdown is initiated, the internal map is cleared
//! (so that all Drop handlers run). Code which might execute after
//! [Hub::terminate](Hub::terminate) should therefore use [Hub::find](Hub::find) and gracefully
//! handle the **None** case.
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use strata::hub::Hub;
//! struct Service {
//!     value: i32
//! }
//!
//! let hub = Hub::new();
//!
//! // Registers a new component...
//! hub.register::<Service>(Arc::new(Service { value: 42 }));
//!
//! // ...which can be fetched back later.
//! assert_eq!(hub.require::<Service>().value, 42);
//!
//! // By default the hub is running...
//! assert_eq!(hub.is_running(), true);
//!
//! // Once terminated, all components are dropped and background tasks will wind down...
//! hub.terminate();
//! assert_eq!(hub.find::<Service>().is_none(), true);
//! assert_eq!(hub.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Keeps all central components of the cache in a single place.
///
/// Next to being a component registry, the hub carries the run flag which bounds the lifetime
/// of every background task spawned by this crate.
pub struct Hub {
    services: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    is_running: AtomicBool,
}

impl Hub {
    /// Creates a new hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Hub {
            services: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a new component.
    pub fn register<T>(&self, service: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .services
            .lock()
            .unwrap()
            .insert(TypeId::of::<T>(), service);
    }

    /// Tries to resolve a previously registered component.
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let services = self.services.lock().unwrap();
        services
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a previously registered component.
    ///
    /// # Panics
    /// Panics if the requested component isn't available or if the hub is already shutting down.
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if self.is_running() {
            match self.find::<T>() {
                Some(service) => service,
                None => panic!(
                    "A required component ({}) was not available in the hub registry!",
                    std::any::type_name::<T>()
                ),
            }
        } else {
            panic!(
                "A required component ({}) has been requested but the system is already shutting down!",
                std::any::type_name::<T>()
            )
        }
    }

    /// Determines if the hub is still running or if [Hub::terminate](Hub::terminate) has
    /// already been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Terminates the hub.
    ///
    /// This will immediately release all components (so that their Drop handlers run eventually)
    /// and toggle the [is_running()](Hub::is_running) flag to **false**, which winds down all
    /// background tasks.
    pub fn terminate(&self) {
        self.services.lock().unwrap().clear();
        self.is_running.store(false, Ordering::Release);
    }
}
