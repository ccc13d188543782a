//! Expires idle and aged elements of the memory tier in the background.
//!
//! The shrinker complements LRU eviction: while eviction only fires under capacity pressure,
//! the shrinker walks the store periodically and pushes elements which exceeded their maximum
//! life or sat idle for too long into the overflow sink. A cache which receives no traffic
//! therefore still gives its memory back over time.
//!
//! Eternal elements (the default, see
//! [ElementAttributes::is_eternal](crate::element::ElementAttributes::is_eternal)) are never
//! touched by the shrinker.
#[cfg(test)]
use mock_instant::thread_local::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::Duration;

use crate::config::{CacheAttributes, Config};
use crate::element::ElementAttributes;
use crate::hub::Hub;
use crate::memory::MemoryStore;

/// Installs a background task which shrinks the given store periodically.
///
/// The task sleeps for the configured shrinker interval between runs and ends itself once the
/// hub is no longer running. The region attributes are re-read from the installed [Config]
/// before every run, so a config reload changes the interval, the idle limit or switches the
/// shrinker off without a restart. The given attributes serve as fallback if no config is
/// present.
pub fn install<V: Send + 'static>(
    hub: &std::sync::Arc<Hub>,
    store: MemoryStore<V>,
    attributes: CacheAttributes,
) {
    let hub = hub.clone();
    crate::spawn!(async move {
        log::info!(
            "{}: Starting memory shrinker (interval: {})",
            store.region(),
            crate::fmt::format_duration(attributes.shrinker_interval)
        );
        let region = store.region();

        while hub.is_running() {
            let attributes = current_attributes(&hub, &region, &attributes);
            tokio::time::sleep(attributes.shrinker_interval).await;
            if !hub.is_running() {
                return;
            }
            if !attributes.use_memory_shrinker {
                continue;
            }

            let expired = shrink(&store, &attributes);
            if expired > 0 {
                log::debug!("{}: Shrinker expired {} elements", store.region(), expired);
            }
        }
    });
}

/// Determines the current attributes of the given region, preferring the installed config.
fn current_attributes(
    hub: &std::sync::Arc<Hub>,
    region: &str,
    fallback: &CacheAttributes,
) -> CacheAttributes {
    match hub.find::<Config>() {
        Some(config) => config.current().attributes(region),
        None => fallback.clone(),
    }
}

/// Performs a single shrinker run against the given store.
///
/// The run takes an unordered metadata snapshot, determines the expired elements and removes
/// each of them into the overflow sink. The expiry condition is re-evaluated under the store
/// lock right before the removal, so an element which was touched after the snapshot stays
/// resident. At most `max_spool_per_run` elements are removed per run; whatever is left over
/// is picked up by a later run.
///
/// Returns the number of elements removed.
pub fn shrink<V>(store: &MemoryStore<V>, attributes: &CacheAttributes) -> usize {
    let snapshot = store.attribute_snapshot();
    let mut removed = 0;

    for (key, element_attributes) in snapshot {
        if removed >= attributes.max_spool_per_run {
            log::debug!(
                "{}: Shrinker reached its per-run limit of {}, deferring the rest",
                store.region(),
                attributes.max_spool_per_run
            );
            return removed;
        }

        if is_expired(&element_attributes, attributes.max_memory_idle_time, Instant::now())
            && store.waterfall_if(&key, |current| {
                is_expired(current, attributes.max_memory_idle_time, Instant::now())
            })
        {
            log::debug!("{}: Shrinker expired {}", store.region(), key);
            removed += 1;
        }
    }

    removed
}

/// Determines if an element has to go based on its lifetime metadata.
///
/// Eternal elements never expire. All others expire once their age exceeds their maximum life
/// (if one is set) or once they sat idle for longer than the region permits.
fn is_expired(attributes: &ElementAttributes, max_idle_time: Duration, now: Instant) -> bool {
    if attributes.is_eternal() {
        return false;
    }

    if let Some(max_life) = attributes.max_life() {
        if attributes.age(now) > max_life {
            return true;
        }
    }

    attributes.idle_time(now) > max_idle_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::CacheElement;
    use crate::memory::{DiscardSink, LruMemoryCache, OverflowSink};
    use mock_instant::thread_local::MockClock;
    use std::sync::{Arc, Mutex};

    struct RecordingSink {
        spilled: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(RecordingSink {
                spilled: Mutex::new(Vec::new()),
            })
        }
    }

    impl OverflowSink<i32> for RecordingSink {
        fn spill(&self, element: CacheElement<i32>) -> anyhow::Result<()> {
            self.spilled.lock().unwrap().push(element.key().to_owned());
            Ok(())
        }
    }

    fn store_with(
        attributes: &CacheAttributes,
        sink: Arc<dyn OverflowSink<i32>>,
    ) -> MemoryStore<i32> {
        MemoryStore::new(LruMemoryCache::new("testRegion", attributes, sink))
    }

    fn mortal_element(key: &str) -> CacheElement<i32> {
        let mut element = CacheElement::new("testRegion", key, 42);
        element.attributes_mut().set_eternal(false);
        element
    }

    #[test]
    fn eternal_elements_survive_any_amount_of_idle_time() {
        let attributes = CacheAttributes {
            max_memory_idle_time: Duration::from_secs(60),
            ..Default::default()
        };
        let store = store_with(&attributes, Arc::new(DiscardSink));

        store.put(CacheElement::new("testRegion", "eternal", 1));
        store.put(mortal_element("mortal"));

        MockClock::advance(Duration::from_secs(3600));
        assert_eq!(shrink(&store, &attributes), 1);
        assert_eq!(store.get("eternal").is_some(), true);
        assert_eq!(store.get("mortal").is_none(), true);
    }

    #[test]
    fn elements_past_their_max_life_are_expired() {
        let attributes = CacheAttributes {
            max_memory_idle_time: Duration::from_secs(3600),
            ..Default::default()
        };
        let store = store_with(&attributes, Arc::new(DiscardSink));

        let mut element = mortal_element("limited");
        element.attributes_mut().set_max_life(Duration::from_secs(10));
        store.put(element);
        store.put(mortal_element("unlimited"));

        // 30s exceeds the max life of 10s but not the idle limit of one hour...
        MockClock::advance(Duration::from_secs(30));
        assert_eq!(shrink(&store, &attributes), 1);
        assert_eq!(store.get("limited").is_none(), true);
        assert_eq!(store.get("unlimited").is_some(), true);
    }

    #[test]
    fn recently_touched_elements_are_not_idle_expired() {
        let attributes = CacheAttributes {
            max_memory_idle_time: Duration::from_secs(60),
            ..Default::default()
        };
        let store = store_with(&attributes, Arc::new(DiscardSink));

        store.put(mortal_element("stale"));
        store.put(mortal_element("busy"));

        MockClock::advance(Duration::from_secs(45));
        // Reading resets the idle clock of "busy"...
        let _ = store.get("busy");
        MockClock::advance(Duration::from_secs(45));

        assert_eq!(shrink(&store, &attributes), 1);
        assert_eq!(store.get("stale").is_none(), true);
        assert_eq!(store.get("busy").is_some(), true);
    }

    #[test]
    fn expired_elements_end_up_in_the_overflow_sink() {
        let attributes = CacheAttributes {
            max_memory_idle_time: Duration::from_secs(60),
            ..Default::default()
        };
        let sink = RecordingSink::new();
        let store = store_with(&attributes, sink.clone());

        store.put(mortal_element("a"));
        MockClock::advance(Duration::from_secs(120));

        assert_eq!(shrink(&store, &attributes), 1);
        assert_eq!(*sink.spilled.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn runs_are_capped_at_max_spool_per_run() {
        let attributes = CacheAttributes {
            max_memory_idle_time: Duration::from_secs(60),
            max_spool_per_run: 3,
            ..Default::default()
        };
        let store = store_with(&attributes, Arc::new(DiscardSink));

        for i in 0..10 {
            store.put(mortal_element(&format!("key{}", i)));
        }
        MockClock::advance(Duration::from_secs(120));

        // One run removes at most three elements, the rest is left for later runs...
        assert_eq!(shrink(&store, &attributes), 3);
        assert_eq!(store.len(), 7);
        assert_eq!(shrink(&store, &attributes), 3);
        assert_eq!(shrink(&store, &attributes), 3);
        assert_eq!(shrink(&store, &attributes), 1);
        assert_eq!(store.len(), 0);
    }
}
