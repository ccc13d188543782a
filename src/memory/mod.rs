//! Provides the bounded in-process memory tier.
//!
//! The memory tier is a strict LRU store: elements are kept in a lookup map plus a recency list.
//! Every read or write moves the touched element to the head of the list, so the tail always
//! holds the least recently used element. Once the store reaches its configured capacity, a
//! batch of tail elements is evicted and handed to the [OverflowSink] - typically a disk tier
//! which picks the elements up asynchronously.
//!
//! Next to capacity pressure, elements can leave the memory tier through the background
//! [shrinker](shrinker), which expires idle or aged elements through the very same sink.
//!
//! The [LruMemoryCache] is the plain data structure (all operations take `&mut self`), while
//! [MemoryStore] is the shared handle which wraps it in a mutex and is what the rest of the
//! system (shrinker, region manager, application code) works with.
use crate::element::CacheElement;

pub mod shrinker;

mod lru;
mod store;

pub use lru::LruMemoryCache;
pub use store::MemoryStore;

/// Describes the overflow tier which receives evicted and expired elements.
///
/// The sink is invoked once per element, in least-recently-used-first order during batch
/// eviction. Errors are logged by the caller and never abort the remaining batch: the element
/// has already left the memory tier at that point and cache-only data is allowed to be lost -
/// a cache is not a durable source of truth.
pub trait OverflowSink<V>: Send + Sync {
    /// Accepts an element which has been evicted or expired out of the memory tier.
    fn spill(&self, element: CacheElement<V>) -> anyhow::Result<()>;
}

/// An overflow sink which simply discards the elements it receives.
///
/// This is the default sink for regions which have no deeper tier configured.
pub struct DiscardSink;

impl<V> OverflowSink<V> for DiscardSink {
    fn spill(&self, element: CacheElement<V>) -> anyhow::Result<()> {
        log::debug!(
            "{}: Discarding evicted element {} (no overflow tier configured)",
            element.region(),
            element.key()
        );
        Ok(())
    }
}
