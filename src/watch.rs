//! Keeps cache listeners attached across observer connection failures.
//!
//! A [CacheObserver](crate::remote::CacheObserver) connection is just as mortal as the remote
//! cache service itself. The [CacheWatchRepairable] registry therefore records every listener
//! registration in a local shadow before forwarding it: when the connection dies and a
//! replacement becomes available, [set_cache_watch](CacheWatchRepairable::set_cache_watch)
//! replays all known registrations against the fresh connection, so no subscription is lost.
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Mutex;

use crate::remote::{CacheListener, CacheObserver};

/// The observer connection and the local shadow of all registrations.
///
/// Both live behind one mutex so that a repair never races a registration: while a replay is
/// in progress, no listener can be added to or removed from the shadow.
struct WatchState {
    observer: Arc<dyn CacheObserver>,
    shadow: HashMap<String, HashMap<u64, Arc<dyn CacheListener>>>,
}

/// A listener registry which survives the observer connection going away.
///
/// All registrations pass through the local shadow first, so the registry always knows which
/// listeners belong to which region, independent of whether the remote side ever learned about
/// them.
pub struct CacheWatchRepairable {
    state: Mutex<WatchState>,
}

impl CacheWatchRepairable {
    /// Creates a registry forwarding to the given observer connection.
    pub fn new(observer: Arc<dyn CacheObserver>) -> Self {
        CacheWatchRepairable {
            state: Mutex::new(WatchState {
                observer,
                shadow: HashMap::new(),
            }),
        }
    }

    /// Attaches the given listener to the given region.
    ///
    /// The listener is recorded in the local shadow before the remote side is contacted:
    /// should the remote registration fail, the error is reported but the listener stays
    /// known, so the next [set_cache_watch](CacheWatchRepairable::set_cache_watch) attaches it.
    pub async fn add_cache_listener(
        &self,
        region: &str,
        listener: Arc<dyn CacheListener>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let _ = state
            .shadow
            .entry(region.to_owned())
            .or_default()
            .insert(listener.id(), listener.clone());

        state
            .observer
            .add_listener(region, listener)
            .await
            .context("Failed to register the listener with the remote observer")
    }

    /// Attaches the given listener to every region currently known to the registry.
    ///
    /// "Known" means a region which already has at least one listener recorded; regions which
    /// only appear later are not covered retroactively. The attachment is best-effort per
    /// region. Returns the number of regions the listener was attached to remotely.
    pub async fn add_cache_listener_to_all(&self, listener: Arc<dyn CacheListener>) -> usize {
        let mut state = self.state.lock().await;
        let regions: Vec<String> = state.shadow.keys().cloned().collect();

        let mut attached = 0;
        for region in regions {
            let _ = state
                .shadow
                .entry(region.clone())
                .or_default()
                .insert(listener.id(), listener.clone());

            match state.observer.add_listener(&region, listener.clone()).await {
                Ok(()) => attached += 1,
                Err(error) => {
                    log::warn!(
                        "{}: Failed to attach listener {} remotely: {}",
                        region,
                        listener.id(),
                        error
                    );
                }
            }
        }

        attached
    }

    /// Detaches the listener with the given id from the given region.
    ///
    /// The listener is dropped from the local shadow in any case; a remote failure is
    /// reported but cannot resurrect the registration.
    pub async fn remove_cache_listener(&self, region: &str, listener_id: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if let Some(listeners) = state.shadow.get_mut(region) {
            let _ = listeners.remove(&listener_id);
            if listeners.is_empty() {
                let _ = state.shadow.remove(region);
            }
        }

        state
            .observer
            .remove_listener(region, listener_id)
            .await
            .context("Failed to unregister the listener from the remote observer")
    }

    /// Detaches the listener with the given id from every region it is recorded for.
    ///
    /// The mirror of [add_cache_listener_to_all](CacheWatchRepairable::add_cache_listener_to_all):
    /// local removal always happens, the remote detach is best-effort per region.
    pub async fn remove_cache_listener_from_all(&self, listener_id: u64) {
        let mut state = self.state.lock().await;
        let regions: Vec<String> = state
            .shadow
            .iter()
            .filter(|(_, listeners)| listeners.contains_key(&listener_id))
            .map(|(region, _)| region.clone())
            .collect();

        for region in regions {
            if let Some(listeners) = state.shadow.get_mut(&region) {
                let _ = listeners.remove(&listener_id);
                if listeners.is_empty() {
                    let _ = state.shadow.remove(&region);
                }
            }

            if let Err(error) = state.observer.remove_listener(&region, listener_id).await {
                log::warn!(
                    "{}: Failed to detach listener {} remotely: {}",
                    region,
                    listener_id,
                    error
                );
            }
        }
    }

    /// Returns the number of listeners recorded for the given region.
    pub async fn listener_count(&self, region: &str) -> usize {
        self.state
            .lock()
            .await
            .shadow
            .get(region)
            .map(|listeners| listeners.len())
            .unwrap_or(0)
    }

    /// Replaces the observer connection and re-attaches all recorded listeners.
    ///
    /// The replay is best-effort: a listener which cannot be attached is logged and skipped,
    /// but stays in the shadow for the next repair attempt. Returns the number of listeners
    /// attached successfully.
    pub async fn set_cache_watch(&self, observer: Arc<dyn CacheObserver>) -> usize {
        let mut state = self.state.lock().await;
        state.observer = observer;

        let mut attached = 0;
        for (region, listeners) in &state.shadow {
            for listener in listeners.values() {
                match state.observer.add_listener(region, listener.clone()).await {
                    Ok(()) => attached += 1,
                    Err(error) => {
                        log::warn!(
                            "{}: Failed to re-attach listener {} to the fresh observer: {}",
                            region,
                            listener.id(),
                            error
                        );
                    }
                }
            }
        }

        log::info!(
            "Observer connection replaced, re-attached {} listeners",
            attached
        );
        attached
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::SerializedElement;
    use crate::testing::test_async;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// An observer which records registrations and can be toggled to fail.
    struct MockObserver {
        registrations: StdMutex<Vec<(String, u64)>>,
        broken: AtomicBool,
    }

    impl MockObserver {
        fn new() -> Arc<Self> {
            Arc::new(MockObserver {
                registrations: StdMutex::new(Vec::new()),
                broken: AtomicBool::new(false),
            })
        }

        fn registrations(&self) -> Vec<(String, u64)> {
            self.registrations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CacheObserver for MockObserver {
        async fn add_listener(
            &self,
            region: &str,
            listener: Arc<dyn CacheListener>,
        ) -> anyhow::Result<()> {
            if self.broken.load(Ordering::Acquire) {
                return Err(anyhow::anyhow!("Connection lost"));
            }
            self.registrations
                .lock()
                .unwrap()
                .push((region.to_owned(), listener.id()));
            Ok(())
        }

        async fn remove_listener(&self, region: &str, listener_id: u64) -> anyhow::Result<()> {
            if self.broken.load(Ordering::Acquire) {
                return Err(anyhow::anyhow!("Connection lost"));
            }
            self.registrations
                .lock()
                .unwrap()
                .retain(|(r, id)| r != region || *id != listener_id);
            Ok(())
        }
    }

    struct TestListener {
        id: u64,
    }

    impl CacheListener for TestListener {
        fn id(&self) -> u64 {
            self.id
        }

        fn handle_update(&self, _element: SerializedElement) {}

        fn handle_remove(&self, _region: &str, _key: &str) {}

        fn handle_remove_all(&self, _region: &str) {}
    }

    fn listener(id: u64) -> Arc<dyn CacheListener> {
        Arc::new(TestListener { id })
    }

    #[test]
    fn a_fresh_observer_receives_all_recorded_listeners() {
        test_async(async {
            let original = MockObserver::new();
            let watch = CacheWatchRepairable::new(original.clone());

            watch.add_cache_listener("products", listener(1)).await.unwrap();
            watch.add_cache_listener("products", listener(2)).await.unwrap();
            watch.add_cache_listener("orders", listener(3)).await.unwrap();
            assert_eq!(original.registrations().len(), 3);

            let replacement = MockObserver::new();
            assert_eq!(watch.set_cache_watch(replacement.clone()).await, 3);

            let mut replayed = replacement.registrations();
            replayed.sort();
            assert_eq!(
                replayed,
                vec![
                    ("orders".to_owned(), 3),
                    ("products".to_owned(), 1),
                    ("products".to_owned(), 2)
                ]
            );
        });
    }

    #[test]
    fn a_failed_remote_registration_keeps_the_listener_in_the_shadow() {
        test_async(async {
            let original = MockObserver::new();
            original.broken.store(true, Ordering::Release);
            let watch = CacheWatchRepairable::new(original.clone());

            assert_eq!(
                watch.add_cache_listener("products", listener(1)).await.is_err(),
                true
            );
            assert_eq!(watch.listener_count("products").await, 1);

            // The repair attaches the listener the remote side never learned about...
            let replacement = MockObserver::new();
            assert_eq!(watch.set_cache_watch(replacement.clone()).await, 1);
            assert_eq!(replacement.registrations(), vec![("products".to_owned(), 1)]);
        });
    }

    #[test]
    fn removed_listeners_are_not_replayed() {
        test_async(async {
            let original = MockObserver::new();
            let watch = CacheWatchRepairable::new(original.clone());

            watch.add_cache_listener("products", listener(1)).await.unwrap();
            watch.add_cache_listener("products", listener(2)).await.unwrap();
            watch.remove_cache_listener("products", 1).await.unwrap();
            assert_eq!(watch.listener_count("products").await, 1);

            let replacement = MockObserver::new();
            assert_eq!(watch.set_cache_watch(replacement.clone()).await, 1);
            assert_eq!(replacement.registrations(), vec![("products".to_owned(), 2)]);
        });
    }

    #[test]
    fn a_global_add_covers_all_currently_known_regions() {
        test_async(async {
            let original = MockObserver::new();
            let watch = CacheWatchRepairable::new(original.clone());

            watch.add_cache_listener("products", listener(1)).await.unwrap();
            watch.add_cache_listener("orders", listener(2)).await.unwrap();

            assert_eq!(watch.add_cache_listener_to_all(listener(9)).await, 2);
            assert_eq!(watch.listener_count("products").await, 2);
            assert_eq!(watch.listener_count("orders").await, 2);

            // A region created afterwards is not covered retroactively...
            watch.add_cache_listener("users", listener(3)).await.unwrap();
            assert_eq!(watch.listener_count("users").await, 1);
        });
    }

    #[test]
    fn a_global_remove_detaches_the_listener_everywhere() {
        test_async(async {
            let original = MockObserver::new();
            let watch = CacheWatchRepairable::new(original.clone());

            watch.add_cache_listener("products", listener(1)).await.unwrap();
            watch.add_cache_listener("orders", listener(1)).await.unwrap();
            watch.add_cache_listener("orders", listener(2)).await.unwrap();

            watch.remove_cache_listener_from_all(1).await;
            assert_eq!(watch.listener_count("products").await, 0);
            assert_eq!(watch.listener_count("orders").await, 1);
            assert_eq!(original.registrations(), vec![("orders".to_owned(), 2)]);
        });
    }

    #[test]
    fn a_broken_replacement_keeps_the_shadow_for_the_next_repair() {
        test_async(async {
            let original = MockObserver::new();
            let watch = CacheWatchRepairable::new(original.clone());
            watch.add_cache_listener("products", listener(1)).await.unwrap();

            let broken = MockObserver::new();
            broken.broken.store(true, Ordering::Release);
            assert_eq!(watch.set_cache_watch(broken).await, 0);

            let working = MockObserver::new();
            assert_eq!(watch.set_cache_watch(working.clone()).await, 1);
            assert_eq!(working.registrations(), vec![("products".to_owned(), 1)]);
        });
    }
}
