//! Makes the LRU memory tier shareable across tasks.
use std::sync::{Arc, Mutex};

use crate::element::{CacheElement, ElementAttributes};
use crate::memory::LruMemoryCache;

/// Wraps an [LruMemoryCache] so that it can be shared across tasks and threads.
///
/// Every operation acquires the internal mutex, performs exactly one store operation and
/// releases the lock again. The map and the recency list therefore always change as one
/// atomic unit as observed from the outside. Cloning a store is cheap and yields a handle on
/// the same underlying data.
pub struct MemoryStore<V> {
    cache: Arc<Mutex<LruMemoryCache<V>>>,
}

impl<V> std::fmt::Debug for MemoryStore<V> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        MemoryStore {
            cache: self.cache.clone(),
        }
    }
}

impl<V> MemoryStore<V> {
    /// Wraps the given store.
    pub fn new(cache: LruMemoryCache<V>) -> Self {
        MemoryStore {
            cache: Arc::new(Mutex::new(cache)),
        }
    }

    /// Returns the name of the region this store belongs to.
    pub fn region(&self) -> String {
        self.cache.lock().unwrap().region().to_owned()
    }

    /// Inserts or replaces an element, evicting into the overflow sink if the store is full.
    pub fn put(&self, element: CacheElement<V>) {
        self.cache.lock().unwrap().put(element);
    }

    /// Returns a copy of the element stored for the given key, promoting it to the most
    /// recently used position.
    pub fn get(&self, key: &str) -> Option<CacheElement<V>>
    where
        V: Clone,
    {
        self.cache.lock().unwrap().get(key)
    }

    /// Removes the given key (or, for a key ending in the hierarchical delimiter, the whole
    /// group sharing that prefix). Returns whether anything was removed.
    pub fn remove(&self, key: &str) -> bool {
        self.cache.lock().unwrap().remove(key)
    }

    /// Removes all elements from the store.
    pub fn remove_all(&self) {
        self.cache.lock().unwrap().remove_all();
    }

    /// Returns the current number of resident elements.
    pub fn len(&self) -> usize {
        self.cache.lock().unwrap().len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().unwrap().is_empty()
    }

    /// Returns the maximal number of resident elements.
    pub fn capacity(&self) -> usize {
        self.cache.lock().unwrap().capacity()
    }

    /// Applies changed attributes (e.g. after a config reload) to the underlying store.
    pub fn update_attributes(&self, attributes: &crate::config::CacheAttributes) {
        self.cache.lock().unwrap().update_attributes(attributes);
    }

    /// Provides an unordered snapshot of the lifetime metadata of all resident elements.
    pub fn attribute_snapshot(&self) -> Vec<(String, ElementAttributes)> {
        self.cache.lock().unwrap().attribute_snapshot()
    }

    /// Enumerates all resident keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.cache.lock().unwrap().keys_by_recency()
    }

    /// Removes the given key into the overflow sink if the given condition still holds.
    ///
    /// The condition is re-evaluated against the current metadata while the lock is held, so
    /// an element which was touched between a stale snapshot and this call stays resident.
    /// Returns whether the element was removed.
    pub fn waterfall_if<P>(&self, key: &str, condition: P) -> bool
    where
        P: FnOnce(&ElementAttributes) -> bool,
    {
        let mut cache = self.cache.lock().unwrap();
        match cache.peek_attributes(key) {
            Some(attributes) if condition(attributes) => cache.waterfall(key),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheAttributes;
    use crate::memory::DiscardSink;

    fn store() -> MemoryStore<i32> {
        MemoryStore::new(LruMemoryCache::new(
            "testRegion",
            &CacheAttributes::default(),
            Arc::new(DiscardSink),
        ))
    }

    #[test]
    fn clones_operate_on_the_same_data() {
        let store = store();
        let other = store.clone();

        store.put(CacheElement::new("testRegion", "a", 1));
        assert_eq!(*other.get("a").unwrap().value(), 1);

        other.remove_all();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn waterfall_re_checks_its_condition_under_the_lock() {
        let store = store();
        store.put(CacheElement::new("testRegion", "a", 1));

        // A condition which no longer holds leaves the element resident...
        assert_eq!(store.waterfall_if("a", |_| false), false);
        assert_eq!(store.len(), 1);

        // ...while a holding one removes it.
        assert_eq!(store.waterfall_if("a", |_| true), true);
        assert_eq!(store.len(), 0);
        assert_eq!(store.waterfall_if("a", |_| true), false);
    }
}
