//! Provides the unit of cached data and its metadata.
//!
//! A [CacheElement] is owned by exactly one store at a time: the memory tier, the overflow sink
//! it was spilled to, or the zombie queue of the remote client. Elements are never aliased across
//! tiers - whenever an element changes hands, it is moved (or cloned into an independent copy).
//!
//! The [ElementAttributes] carry the lifetime bookkeeping: creation time, last access time, an
//! optional maximum life and the **eternal** flag, which exempts an element from all expiry
//! checks performed by the [shrinker](crate::memory::shrinker).
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// The delimiter which closes a hierarchical key prefix.
///
/// A key ending in this delimiter denotes a removable prefix group: removing `"users:"` removes
/// every key starting with `"users:"` from the memory store.
pub const NAME_COMPONENT_DELIMITER: char = ':';

/// Contains the lifetime metadata of a cached element.
///
/// Note that by default, elements are **eternal**: they are only ever displaced by LRU pressure
/// and never expired by the shrinker. Expiry has to be enabled explicitly by calling
/// [set_eternal(false)](ElementAttributes::set_eternal) and optionally assigning a
/// [max life](ElementAttributes::set_max_life).
#[derive(Clone, Debug)]
pub struct ElementAttributes {
    create_time: Instant,
    last_access_time: Instant,
    max_life: Option<Duration>,
    eternal: bool,
}

impl Default for ElementAttributes {
    fn default() -> Self {
        ElementAttributes::new()
    }
}

impl ElementAttributes {
    /// Creates attributes for an element created right now.
    pub fn new() -> Self {
        let now = Instant::now();
        ElementAttributes {
            create_time: now,
            last_access_time: now,
            max_life: None,
            eternal: true,
        }
    }

    /// Determines if the element is exempt from all expiry checks.
    pub fn is_eternal(&self) -> bool {
        self.eternal
    }

    /// Specifies whether the element is exempt from all expiry checks.
    pub fn set_eternal(&mut self, eternal: bool) {
        self.eternal = eternal;
    }

    /// Returns the maximal life of the element or **None** if no age limit applies.
    pub fn max_life(&self) -> Option<Duration> {
        self.max_life
    }

    /// Limits the age of the element. Once it has been in the cache for longer than the given
    /// duration, the shrinker will expire it (unless the element is eternal).
    pub fn set_max_life(&mut self, max_life: Duration) {
        self.max_life = Some(max_life);
    }

    /// Returns the instant at which the element was created.
    pub fn create_time(&self) -> Instant {
        self.create_time
    }

    /// Returns the instant of the last read or write access.
    pub fn last_access_time(&self) -> Instant {
        self.last_access_time
    }

    /// Records an access right now.
    pub fn touch(&mut self) {
        self.last_access_time = Instant::now();
    }

    /// Computes how long the element has been idle relative to the given instant.
    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access_time)
    }

    /// Computes the age of the element relative to the given instant.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.create_time)
    }
}

/// Represents a single cached object along with its identity and metadata.
///
/// The identity of an element is the pair of its region name and its key. The value side is
/// generic - a store holds whatever its region was bound to.
#[derive(Clone, Debug)]
pub struct CacheElement<V> {
    region: String,
    key: String,
    value: V,
    attributes: ElementAttributes,
}

impl<V> CacheElement<V> {
    /// Creates a new element with default attributes.
    pub fn new(region: impl Into<String>, key: impl Into<String>, value: V) -> Self {
        CacheElement {
            region: region.into(),
            key: key.into(),
            value,
            attributes: ElementAttributes::new(),
        }
    }

    /// Creates a new element carrying the given attributes.
    pub fn with_attributes(
        region: impl Into<String>,
        key: impl Into<String>,
        value: V,
        attributes: ElementAttributes,
    ) -> Self {
        CacheElement {
            region: region.into(),
            key: key.into(),
            value,
            attributes,
        }
    }

    /// Returns the name of the region this element belongs to.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Returns the key under which the element is stored.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Provides access to the cached value.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Extracts the cached value, consuming the element.
    pub fn into_value(self) -> V {
        self.value
    }

    /// Provides access to the lifetime metadata.
    pub fn attributes(&self) -> &ElementAttributes {
        &self.attributes
    }

    /// Provides mutable access to the lifetime metadata.
    pub fn attributes_mut(&mut self) -> &mut ElementAttributes {
        &mut self.attributes
    }
}

impl<V: Serialize> CacheElement<V> {
    /// Converts the element into its wire form by serializing the value into a JSON payload.
    ///
    /// # Errors
    /// Fails if the value cannot be serialized. Such a failure is fatal for the single operation
    /// which required the wire form, but never affects the element in its current store.
    pub fn to_serialized(&self) -> anyhow::Result<SerializedElement> {
        let payload = serde_json::to_vec(&self.value)?;
        Ok(SerializedElement {
            region: self.region.clone(),
            key: self.key.clone(),
            attributes: self.attributes.clone(),
            payload: Bytes::from(payload),
        })
    }
}

/// Represents the wire form of a cache element as handed to the remote tier.
///
/// The value is carried as an opaque JSON payload so that the remote service never needs to know
/// the concrete value type of a region.
#[derive(Clone, Debug)]
pub struct SerializedElement {
    region: String,
    key: String,
    attributes: ElementAttributes,
    payload: Bytes,
}

impl SerializedElement {
    /// Returns the name of the region this element belongs to.
    pub fn region(&self) -> &str {
        &self.region
    }

    /// Returns the key under which the element is stored.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Provides access to the serialized value.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Provides access to the lifetime metadata.
    pub fn attributes(&self) -> &ElementAttributes {
        &self.attributes
    }

    /// Reconstructs a typed element by deserializing the payload.
    ///
    /// # Errors
    /// Fails if the payload does not deserialize into the requested value type.
    pub fn to_element<V: DeserializeOwned>(&self) -> anyhow::Result<CacheElement<V>> {
        let value = serde_json::from_slice(&self.payload)?;
        Ok(CacheElement {
            region: self.region.clone(),
            key: self.key.clone(),
            value,
            attributes: self.attributes.clone(),
        })
    }
}
