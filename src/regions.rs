//! Provides type-safe access to named cache regions.
//!
//! A region is a named, independently configured memory store. Since callers refer to regions
//! by name, nothing in the type system stops two callers from picking the same name for
//! different value types. [CacheRegions] therefore remembers the value type a region was
//! created with and rejects any later access under a different type with a
//! [TypeMismatchError] instead of handing out a store which could never hold the requested
//! values.
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::error::RecvError;

use crate::config::{CacheAttributes, Config};
use crate::hub::Hub;
use crate::memory::{shrinker, DiscardSink, LruMemoryCache, MemoryStore, OverflowSink};

/// Signals that a region was accessed under a different value type than it was created with.
#[derive(Debug)]
pub struct TypeMismatchError {
    region: String,
    expected: &'static str,
    requested: &'static str,
}

impl Display for TypeMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region {} stores values of type {} but was accessed as {}",
            self.region, self.expected, self.requested
        )
    }
}

impl std::error::Error for TypeMismatchError {}

/// A created region: the value type it was created with and the store itself.
///
/// Since the value type is erased here, the entry also carries closures which re-apply
/// changed attributes to the store and install a shrinker for it. These captured the
/// typed store on creation and keep [reconfigure](CacheRegions::reconfigure) free of
/// any type parameter.
struct RegionEntry {
    value_type: TypeId,
    type_name: &'static str,
    store: Box<dyn Any + Send + Sync>,
    reconfigure: Box<dyn Fn(&CacheAttributes) + Send + Sync>,
    install_shrinker: Box<dyn Fn(&Arc<Hub>, CacheAttributes) + Send + Sync>,
    shrinker_installed: bool,
}

/// Manages the cache regions of a hub.
///
/// Regions are created lazily: the first access under a given name creates the store using the
/// attributes found in the [Config] (or the defaults if none is installed) and, if enabled for
/// the region, installs a background shrinker. Every further access returns a handle on the
/// same store, provided the value type matches.
///
/// # Example
/// ```
/// # use strata::hub::Hub;
/// # use strata::regions::CacheRegions;
/// let hub = Hub::new();
/// let regions = CacheRegions::new(&hub);
///
/// let products = regions.region::<String>("products").unwrap();
/// products.put(strata::element::CacheElement::new(
///     "products",
///     "a",
///     "A product".to_owned(),
/// ));
///
/// // Accessing the same region under another value type is rejected...
/// assert_eq!(regions.region::<i32>("products").is_err(), true);
/// ```
pub struct CacheRegions {
    hub: Arc<Hub>,
    regions: Mutex<HashMap<String, RegionEntry>>,
}

impl CacheRegions {
    /// Creates a region manager bound to the given hub.
    pub fn new(hub: &Arc<Hub>) -> Self {
        CacheRegions {
            hub: hub.clone(),
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the store of the given region, creating it on first access.
    ///
    /// Evicted elements of a region created this way are discarded. Use
    /// [region_with_sink](CacheRegions::region_with_sink) to attach a real overflow tier.
    pub fn region<V>(&self, name: &str) -> anyhow::Result<MemoryStore<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        self.region_with_sink(name, Arc::new(DiscardSink))
    }

    /// Returns the store of the given region, creating it with the given overflow sink.
    ///
    /// The sink only matters on first access; a region which already exists keeps the sink it
    /// was created with.
    pub fn region_with_sink<V>(
        &self,
        name: &str,
        sink: Arc<dyn OverflowSink<V>>,
    ) -> anyhow::Result<MemoryStore<V>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let mut regions = self.regions.lock().unwrap();
        if let Some(entry) = regions.get(name) {
            if entry.value_type != TypeId::of::<V>() {
                return Err(TypeMismatchError {
                    region: name.to_owned(),
                    expected: entry.type_name,
                    requested: std::any::type_name::<V>(),
                }
                .into());
            }

            return match entry.store.downcast_ref::<MemoryStore<V>>() {
                Some(store) => Ok(store.clone()),
                None => Err(anyhow::anyhow!(
                    "Region {} holds an unexpected store type",
                    name
                )),
            };
        }

        let attributes = self.attributes(name);
        let store = MemoryStore::new(LruMemoryCache::new(name, &attributes, sink));
        let shrinker_installed = attributes.use_memory_shrinker;
        if shrinker_installed {
            shrinker::install(&self.hub, store.clone(), attributes);
        }

        let reconfigured_store = store.clone();
        let shrinker_store = store.clone();
        let _ = regions.insert(
            name.to_owned(),
            RegionEntry {
                value_type: TypeId::of::<V>(),
                type_name: std::any::type_name::<V>(),
                store: Box::new(store.clone()),
                reconfigure: Box::new(move |attributes| {
                    reconfigured_store.update_attributes(attributes)
                }),
                install_shrinker: Box::new(move |hub, attributes| {
                    shrinker::install(hub, shrinker_store.clone(), attributes)
                }),
                shrinker_installed,
            },
        );

        Ok(store)
    }

    /// Drops the given region and all of its resident elements.
    ///
    /// Note that handles which were obtained earlier keep working on the detached store; the
    /// next [region](CacheRegions::region) call creates a fresh one.
    pub fn drop_region(&self, name: &str) -> bool {
        self.regions.lock().unwrap().remove(name).is_some()
    }

    /// Enumerates the names of all regions created so far.
    pub fn known_regions(&self) -> Vec<String> {
        let mut result: Vec<String> = self.regions.lock().unwrap().keys().cloned().collect();
        result.sort();
        result
    }

    /// Re-applies the currently configured attributes to every live region.
    ///
    /// Called by the change listener installed via [install](install) whenever the config
    /// was reloaded. A lowered capacity spills elements down to the new limit right away
    /// and a region whose shrinker was switched on receives one. The shrinker itself
    /// re-reads its settings on every run, so changed intervals or idle times need no
    /// handling here.
    pub fn reconfigure(&self) {
        let mut regions = self.regions.lock().unwrap();
        for (name, entry) in regions.iter_mut() {
            let attributes = self.attributes(name);
            log::debug!("Re-applying configured attributes to region {}...", name);
            (entry.reconfigure)(&attributes);

            if attributes.use_memory_shrinker && !entry.shrinker_installed {
                (entry.install_shrinker)(&self.hub, attributes);
                entry.shrinker_installed = true;
            }
        }
    }

    /// Determines the attributes of a region via the installed config, if any.
    fn attributes(&self, name: &str) -> CacheAttributes {
        match self.hub.find::<Config>() {
            Some(config) => config.current().attributes(name),
            None => CacheAttributes::default(),
        }
    }
}

/// Creates and installs a **CacheRegions** instance for the given hub.
///
/// If a [Config] is installed, this also attaches a change listener to its notifier which
/// re-applies the configured attributes to all live regions on every reload.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// regions part is disabled.
pub fn install(hub: &Arc<Hub>) {
    let regions = Arc::new(CacheRegions::new(hub));
    hub.register::<CacheRegions>(regions.clone());

    let hub = hub.clone();
    crate::spawn!(async move {
        let config = match hub.find::<Config>() {
            Some(config) => config,
            None => return,
        };
        let mut changes = config.notifier();

        while hub.is_running() {
            match changes.recv().await {
                Ok(()) | Err(RecvError::Lagged(_)) => regions.reconfigure(),
                Err(RecvError::Closed) => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::CacheElement;

    #[test]
    fn regions_hand_out_the_same_store_on_every_access() {
        let hub = Hub::new();
        let regions = CacheRegions::new(&hub);

        let first = regions.region::<i32>("products").unwrap();
        first.put(CacheElement::new("products", "a", 1));

        let second = regions.region::<i32>("products").unwrap();
        assert_eq!(*second.get("a").unwrap().value(), 1);
        assert_eq!(regions.known_regions(), vec!["products"]);
    }

    #[test]
    fn a_type_mismatch_is_rejected_with_a_dedicated_error() {
        let hub = Hub::new();
        let regions = CacheRegions::new(&hub);

        let store = regions.region::<i32>("products").unwrap();
        store.put(CacheElement::new("products", "a", 1));

        let error = regions.region::<String>("products").unwrap_err();
        assert_eq!(error.downcast_ref::<TypeMismatchError>().is_some(), true);

        // The failed access left the existing region untouched...
        let store = regions.region::<i32>("products").unwrap();
        assert_eq!(*store.get("a").unwrap().value(), 1);
    }

    #[test]
    fn regions_pick_up_their_configured_attributes() {
        let hub = Hub::new();
        let config = Arc::new(Config::new("test_settings.yml"));
        config
            .load_from_string("regions:\n    products:\n        max_objects: 3", None)
            .unwrap();
        hub.register::<Config>(config);

        let regions = CacheRegions::new(&hub);
        let store = regions.region::<i32>("products").unwrap();
        assert_eq!(store.capacity(), 3);
    }

    #[test]
    fn a_config_reload_reaches_live_regions() {
        crate::testing::test_async(async {
            let hub = Hub::new();
            let config = Arc::new(Config::new("test_settings.yml"));
            config
                .load_from_string("regions:\n    products:\n        max_objects: 8", None)
                .unwrap();
            hub.register::<Config>(config.clone());

            install(&hub);
            let regions = hub.require::<CacheRegions>();
            let store = regions.region::<i32>("products").unwrap();
            for i in 0..6 {
                store.put(CacheElement::new("products", format!("key{}", i), i));
            }
            assert_eq!(store.capacity(), 8);

            // Let the change listener attach itself before the reload is published...
            tokio::task::yield_now().await;
            config
                .load_from_string(
                    "regions:\n    products:\n        max_objects: 4\n        chunk_size: 1",
                    None,
                )
                .unwrap();
            tokio::task::yield_now().await;

            // The store picked up the lowered capacity and spilled down to it...
            assert_eq!(store.capacity(), 4);
            assert_eq!(store.len(), 3);
        });
    }

    #[test]
    fn dropped_regions_are_recreated_empty() {
        let hub = Hub::new();
        let regions = CacheRegions::new(&hub);

        let store = regions.region::<i32>("products").unwrap();
        store.put(CacheElement::new("products", "a", 1));

        assert_eq!(regions.drop_region("products"), true);
        assert_eq!(regions.drop_region("products"), false);

        let fresh = regions.region::<i32>("products").unwrap();
        assert_eq!(fresh.get("a").is_none(), true);
        assert_eq!(fresh.len(), 0);
    }
}
