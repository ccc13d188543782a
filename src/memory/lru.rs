//! Provides the LRU data structure of the memory tier.
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::CacheAttributes;
use crate::element::{CacheElement, NAME_COMPONENT_DELIMITER};
use crate::memory::OverflowSink;

/// A descriptor wraps one resident element together with its position in the recency list.
///
/// The list is represented as slot indices into a flat arena instead of raw prev/next pointers:
/// the lookup map owns the existence of a key (it maps to exactly one slot) while the list owns
/// the positional order. A slot is either occupied by a descriptor or parked on the free list,
/// so dangling or duplicate-linked nodes cannot be expressed.
struct MemoryElementDescriptor<V> {
    element: CacheElement<V>,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Provides a bounded key/element store with strict LRU eviction.
///
/// Elements are kept in a lookup map plus a recency list whose head is the most recently used
/// element. Every `put` and every `get` promotes the touched element to the head. Once the
/// store reaches its capacity, a batch of `min(chunk_size, size)` tail elements is evicted and
/// handed to the overflow sink, least recently used first.
///
/// All operations take `&mut self` - this is the plain data structure. Concurrent access is
/// provided by [MemoryStore](crate::memory::MemoryStore) which wraps this type in a mutex so
/// that the map and the list are always updated as one atomic unit per operation.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use strata::config::CacheAttributes;
/// # use strata::element::CacheElement;
/// # use strata::memory::{DiscardSink, LruMemoryCache};
/// let attributes = CacheAttributes {
///     max_objects: 3,
///     chunk_size: 1,
///     ..Default::default()
/// };
/// let mut cache = LruMemoryCache::new("products", &attributes, Arc::new(DiscardSink));
///
/// cache.put(CacheElement::new("products", "a", 1));
/// cache.put(CacheElement::new("products", "b", 2));
/// assert_eq!(cache.len(), 2);
///
/// // The third element fills the store, so the least recently used one is displaced...
/// cache.put(CacheElement::new("products", "c", 3));
/// assert_eq!(cache.get("a").is_none(), true);
/// assert_eq!(*cache.get("c").unwrap().value(), 3);
/// ```
pub struct LruMemoryCache<V> {
    region: String,
    map: HashMap<String, usize>,
    slots: Vec<Option<MemoryElementDescriptor<V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
    chunk_size: usize,
    sink: Arc<dyn OverflowSink<V>>,
}

impl<V> LruMemoryCache<V> {
    /// Creates a new store for the given region.
    ///
    /// The capacity and the eviction batch size are taken from the given attributes. Evicted
    /// elements are handed to the given sink.
    pub fn new(
        region: impl Into<String>,
        attributes: &CacheAttributes,
        sink: Arc<dyn OverflowSink<V>>,
    ) -> Self {
        let region = region.into();
        log::info!(
            "Initialized LRU memory store for region {} (capacity: {}, chunk size: {})",
            region,
            attributes.max_objects,
            attributes.chunk_size
        );

        LruMemoryCache {
            region,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            capacity: attributes.max_objects.max(1),
            chunk_size: attributes.chunk_size.max(1),
            sink,
        }
    }

    /// Returns the name of the region this store belongs to.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Returns the current number of resident elements.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the maximal number of resident elements.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Applies changed attributes to a live store.
    ///
    /// Used when the config file is reloaded. If the new capacity is below the current
    /// size, tail elements are spilled in chunks until the store fits again.
    pub fn update_attributes(&mut self, attributes: &CacheAttributes) {
        self.capacity = attributes.max_objects.max(1);
        self.chunk_size = attributes.chunk_size.max(1);

        if self.map.len() >= self.capacity {
            log::info!(
                "{}: Capacity lowered to {}, spilling down to the new limit...",
                self.region,
                self.capacity
            );
        }
        while self.map.len() >= self.capacity {
            self.evict_batch();
        }
    }

    /// Inserts or replaces an element, making it the most recently used one.
    ///
    /// If the key already existed, its old descriptor is unlinked first so that the list never
    /// contains duplicate keys. Once the store holds `capacity` or more elements afterwards, a
    /// batch of `min(chunk_size, len)` tail elements is evicted and pushed into the overflow
    /// sink, least recently used first. A failing sink is logged and does not abort the
    /// remaining batch - the evicted elements have left the store either way.
    pub fn put(&mut self, mut element: CacheElement<V>) {
        element.attributes_mut().touch();

        let key = element.key().to_owned();
        if let Some(slot) = self.map.remove(&key) {
            self.unlink(slot);
            let _ = self.release(slot);
        }

        let slot = self.allocate(element);
        self.push_head(slot);
        let _ = self.map.insert(key, slot);

        if self.map.len() >= self.capacity {
            log::debug!("{}: In-memory limit reached, spilling...", self.region);
            self.evict_batch();
        }
    }

    /// Returns a copy of the element stored for the given key and promotes it to the most
    /// recently used position.
    ///
    /// Reads never evict; a miss simply returns **None**.
    pub fn get(&mut self, key: &str) -> Option<CacheElement<V>>
    where
        V: Clone,
    {
        match self.map.get(key).copied() {
            Some(slot) => {
                log::debug!("{}: LRU memory store hit for {}", self.region, key);
                self.unlink(slot);
                self.push_head(slot);

                let descriptor = self.slots[slot].as_mut()?;
                descriptor.element.attributes_mut().touch();
                Some(descriptor.element.clone())
            }
            None => {
                log::debug!("{}: LRU memory store miss for {}", self.region, key);
                None
            }
        }
    }

    /// Removes the element stored for the given key.
    ///
    /// If the key ends with the hierarchical delimiter, every key sharing that prefix is
    /// removed instead. Returns whether anything was removed. Removed elements are dropped,
    /// not spilled.
    pub fn remove(&mut self, key: &str) -> bool {
        if key.ends_with(NAME_COMPONENT_DELIMITER) {
            // Remove all keys of the same name hierarchy...
            let group: Vec<String> = self
                .map
                .keys()
                .filter(|candidate| candidate.starts_with(key))
                .cloned()
                .collect();

            let mut removed = false;
            for key in group {
                removed |= self.remove_single(&key);
            }

            removed
        } else {
            self.remove_single(key)
        }
    }

    /// Removes all elements from the store.
    pub fn remove_all(&mut self) {
        self.map = HashMap::new();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Removes the given key and hands the element to the overflow sink.
    ///
    /// This is the path used by the [shrinker](crate::memory::shrinker) - expired elements
    /// waterfall into the same sink which receives LRU evictions. Returns whether the key was
    /// still resident. A failing sink is logged; the element has left the store regardless.
    pub fn waterfall(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                match self.release(slot) {
                    Some(element) => self.spill(element),
                    None => (),
                }
                true
            }
            None => false,
        }
    }

    /// Returns the lifetime metadata of the given key without promoting the element.
    pub fn peek_attributes(&self, key: &str) -> Option<&crate::element::ElementAttributes> {
        let slot = self.map.get(key).copied()?;
        self.slots[slot]
            .as_ref()
            .map(|descriptor| descriptor.element.attributes())
    }

    /// Provides a snapshot of the lifetime metadata of all resident elements.
    ///
    /// The snapshot carries no ordering guarantee. It is taken in one pass so that a caller
    /// (the shrinker) can scan it without holding on to the store.
    pub fn attribute_snapshot(&self) -> Vec<(String, crate::element::ElementAttributes)> {
        self.map
            .iter()
            .filter_map(|(key, slot)| {
                self.slots[*slot]
                    .as_ref()
                    .map(|descriptor| (key.clone(), descriptor.element.attributes().clone()))
            })
            .collect()
    }

    /// Enumerates all resident keys from most to least recently used.
    ///
    /// This is a diagnostic helper - the walk visits every element.
    pub fn keys_by_recency(&self) -> Vec<String> {
        let mut result = Vec::with_capacity(self.map.len());
        let mut current = self.head;
        while let Some(slot) = current {
            match self.slots[slot].as_ref() {
                Some(descriptor) => {
                    result.push(descriptor.element.key().to_owned());
                    current = descriptor.next;
                }
                None => break,
            }
        }

        result
    }

    /// Evicts `min(chunk_size, len)` elements from the tail into the overflow sink.
    fn evict_batch(&mut self) {
        let batch = self.chunk_size.min(self.map.len());
        log::debug!(
            "{}: About to spill, size: {}, capacity: {}, elements to spill: {}",
            self.region,
            self.map.len(),
            self.capacity,
            batch
        );

        for _ in 0..batch {
            let slot = match self.tail {
                Some(slot) => slot,
                None => return,
            };

            self.unlink(slot);
            if let Some(element) = self.release(slot) {
                let _ = self.map.remove(element.key());
                self.spill(element);
            }
        }
    }

    /// Hands an element which already left the store to the overflow sink.
    fn spill(&self, element: CacheElement<V>) {
        let key = element.key().to_owned();
        if let Err(error) = self.sink.spill(element) {
            log::error!(
                "{}: Overflow sink failed to accept {}: {}",
                self.region,
                key,
                error
            );
        }
    }

    /// Removes a single key from map and list.
    fn remove_single(&mut self, key: &str) -> bool {
        match self.map.remove(key) {
            Some(slot) => {
                self.unlink(slot);
                let _ = self.release(slot);
                true
            }
            None => false,
        }
    }

    /// Stores a descriptor in a free slot and returns its index.
    fn allocate(&mut self, element: CacheElement<V>) -> usize {
        let descriptor = MemoryElementDescriptor {
            element,
            prev: None,
            next: None,
        };

        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(descriptor);
                slot
            }
            None => {
                self.slots.push(Some(descriptor));
                self.slots.len() - 1
            }
        }
    }

    /// Clears a slot, parks it on the free list and returns the element it held.
    fn release(&mut self, slot: usize) -> Option<CacheElement<V>> {
        let descriptor = self.slots[slot].take()?;
        self.free.push(slot);
        Some(descriptor.element)
    }

    /// Detaches the given slot from the recency list.
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_mut() {
            Some(descriptor) => {
                let links = (descriptor.prev, descriptor.next);
                descriptor.prev = None;
                descriptor.next = None;
                links
            }
            None => return,
        };

        match prev {
            Some(prev_slot) => {
                if let Some(descriptor) = self.slots[prev_slot].as_mut() {
                    descriptor.next = next;
                }
            }
            None => {
                if self.head == Some(slot) {
                    self.head = next;
                }
            }
        }

        match next {
            Some(next_slot) => {
                if let Some(descriptor) = self.slots[next_slot].as_mut() {
                    descriptor.prev = prev;
                }
            }
            None => {
                if self.tail == Some(slot) {
                    self.tail = prev;
                }
            }
        }
    }

    /// Attaches the given (detached) slot at the head of the recency list.
    fn push_head(&mut self, slot: usize) {
        if let Some(descriptor) = self.slots[slot].as_mut() {
            descriptor.prev = None;
            descriptor.next = self.head;
        }

        if let Some(old_head) = self.head {
            if let Some(descriptor) = self.slots[old_head].as_mut() {
                descriptor.prev = Some(slot);
            }
        } else {
            self.tail = Some(slot);
        }

        self.head = Some(slot);
    }
}
