//! Implements the zombie-failover client for the remote cache tier.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::CacheAttributes;
use crate::element::{CacheElement, SerializedElement};
use crate::remote::{CacheEventLogger, RemoteCacheService, RemoteOp, ZombieQueue};

/// The state of a client: either talking to the remote tier or buffering for it.
///
/// Both states carry the service, so the client is always bound to its most recent
/// connection: a zombie keeps the one which failed (or the replacement whose replay
/// failed) until [fix_cache](RemoteCacheClient::fix_cache) succeeds.
enum ClientState {
    /// The remote tier is reachable and operations are forwarded directly.
    Alive { service: Arc<dyn RemoteCacheService> },
    /// The remote tier is unreachable. Mutations are buffered, reads report a miss.
    Zombie {
        service: Arc<dyn RemoteCacheService>,
        queue: ZombieQueue,
    },
}

/// A client for the remote cache tier which survives the remote tier going away.
///
/// While the wrapped [RemoteCacheService] works, all operations are forwarded to it. The first
/// transport failure flips the client into the **zombie** state: from then on, updates and
/// removals are buffered in a bounded FIFO queue and reads simply report a miss, so callers
/// never block on a dead peer. Once a replacement connection is available, calling
/// [fix_cache](RemoteCacheClient::fix_cache) replays the buffered operations in their original
/// order and revives the client.
///
/// The state (including the queue) sits behind a single async mutex which is held across the
/// remote calls. This serializes all operations of one client, which is exactly what preserves
/// the buffer order during a replay: no fresh mutation can slip into the middle of a drain.
///
/// # Example
/// ```no_run
/// # use std::sync::Arc;
/// # use strata::config::CacheAttributes;
/// # use strata::element::CacheElement;
/// # use strata::remote::{RemoteCacheClient, RemoteCacheService};
/// # async fn example(service: Arc<dyn RemoteCacheService>) -> anyhow::Result<()> {
/// let client = RemoteCacheClient::new(service, &CacheAttributes::default());
/// client.update_element(&CacheElement::new("products", "a", 42)).await?;
///
/// // Even if the remote tier died in between, this simply reports a miss...
/// let hit = client.get("products", "a").await?;
/// # Ok(())
/// # }
/// ```
pub struct RemoteCacheClient {
    state: Mutex<ClientState>,
    event_logger: Arc<dyn CacheEventLogger>,
    max_queue_size: usize,
}

impl RemoteCacheClient {
    /// Creates a client forwarding to the given service.
    ///
    /// The attributes are typically those of the region this client serves, obtained via
    /// [Handle::attributes](crate::config::Handle::attributes). Their `max_queue_size`
    /// bounds the zombie queue; once it is full, the oldest buffered operation is dropped
    /// per additional mutation.
    pub fn new(service: Arc<dyn RemoteCacheService>, attributes: &CacheAttributes) -> Self {
        RemoteCacheClient {
            state: Mutex::new(ClientState::Alive { service }),
            event_logger: Arc::new(crate::remote::NoopEventLogger),
            max_queue_size: attributes.max_queue_size,
        }
    }

    /// Attaches an event logger which is notified about every operation of this client.
    pub fn with_event_logger(mut self, event_logger: Arc<dyn CacheEventLogger>) -> Self {
        self.event_logger = event_logger;
        self
    }

    /// Determines if the client is currently talking to the remote tier.
    pub async fn is_alive(&self) -> bool {
        matches!(&*self.state.lock().await, ClientState::Alive { .. })
    }

    /// Returns the number of buffered operations awaiting replay.
    pub async fn queued_ops(&self) -> usize {
        match &*self.state.lock().await {
            ClientState::Alive { .. } => 0,
            ClientState::Zombie { queue, .. } => queue.len(),
        }
    }

    /// Serializes the given element and stores it on the remote tier.
    ///
    /// A value which cannot be serialized is reported as an error without touching the client
    /// state: such an element can never reach the remote tier, so there is nothing worth
    /// buffering. Transport failures on the other hand flip the client into the zombie state
    /// and buffer the update.
    pub async fn update_element<V: Serialize>(
        &self,
        element: &CacheElement<V>,
    ) -> anyhow::Result<()> {
        match element.to_serialized() {
            Ok(serialized) => self.update(serialized).await,
            Err(error) => {
                self.event_logger.error(
                    element.region(),
                    &format!("Failed to serialize {}: {}", element.key(), error),
                );
                Err(error)
            }
        }
    }

    /// Stores or replaces the given element on the remote tier, buffering if it is down.
    pub async fn update(&self, element: SerializedElement) -> anyhow::Result<()> {
        let region = element.region().to_owned();
        let key = element.key().to_owned();
        self.mutate("update", &region, Some(&key), RemoteOp::Update(element))
            .await
    }

    /// Removes the element stored for the given key, buffering if the remote tier is down.
    pub async fn remove(&self, region: &str, key: &str) -> anyhow::Result<()> {
        self.mutate(
            "remove",
            region,
            Some(key),
            RemoteOp::Remove {
                region: region.to_owned(),
                key: key.to_owned(),
            },
        )
        .await
    }

    /// Removes all elements of the given region, buffering if the remote tier is down.
    pub async fn remove_all(&self, region: &str) -> anyhow::Result<()> {
        self.mutate(
            "removeAll",
            region,
            None,
            RemoteOp::RemoveAll {
                region: region.to_owned(),
            },
        )
        .await
    }

    /// Forwards or buffers a single mutation.
    async fn mutate(
        &self,
        operation: &str,
        region: &str,
        key: Option<&str>,
        op: RemoteOp,
    ) -> anyhow::Result<()> {
        self.event_logger.event_started(region, operation, key);
        let started = Instant::now();

        let mut state = self.state.lock().await;
        let success = match &mut *state {
            ClientState::Alive { service } => match replay(service.as_ref(), &op).await {
                Ok(()) => true,
                Err(error) => {
                    let mut queue = self.degraded_queue(region, operation, error);
                    queue.push(op);
                    let dead = service.clone();
                    *state = ClientState::Zombie {
                        service: dead,
                        queue,
                    };
                    false
                }
            },
            ClientState::Zombie { queue, .. } => {
                queue.push(op);
                false
            }
        };

        self.event_logger
            .event_finished(region, operation, started.elapsed(), success);
        Ok(())
    }

    /// Fetches the element stored for the given key and deserializes its payload.
    ///
    /// A payload which does not deserialize into the requested type is reported as an error
    /// without touching the client state.
    pub async fn get_element<V: serde::de::DeserializeOwned>(
        &self,
        region: &str,
        key: &str,
    ) -> anyhow::Result<Option<CacheElement<V>>> {
        match self.get(region, key).await? {
            Some(serialized) => Ok(Some(serialized.to_element()?)),
            None => Ok(None),
        }
    }

    /// Fetches the element stored for the given key.
    ///
    /// A zombie client (and a client which just became one due to a transport failure) reports
    /// a miss, so callers fall back to their slower source of truth instead of failing.
    pub async fn get(&self, region: &str, key: &str) -> anyhow::Result<Option<SerializedElement>> {
        self.event_logger.event_started(region, "get", Some(key));
        let started = Instant::now();

        let mut state = self.state.lock().await;
        let result = match &mut *state {
            ClientState::Alive { service } => match service.get(region, key).await {
                Ok(result) => result,
                Err(error) => {
                    let queue = self.degraded_queue(region, "get", error);
                    let dead = service.clone();
                    *state = ClientState::Zombie {
                        service: dead,
                        queue,
                    };
                    None
                }
            },
            ClientState::Zombie { .. } => None,
        };

        self.event_logger
            .event_finished(region, "get", started.elapsed(), result.is_some());
        Ok(result)
    }

    /// Fetches all of the given keys in one round trip.
    ///
    /// A zombie client reports an empty result.
    pub async fn get_multiple(
        &self,
        region: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, SerializedElement>> {
        self.event_logger.event_started(region, "getMultiple", None);
        let started = Instant::now();

        let mut state = self.state.lock().await;
        let result = match &mut *state {
            ClientState::Alive { service } => match service.get_multiple(region, keys).await {
                Ok(result) => result,
                Err(error) => {
                    let queue = self.degraded_queue(region, "getMultiple", error);
                    let dead = service.clone();
                    *state = ClientState::Zombie {
                        service: dead,
                        queue,
                    };
                    HashMap::new()
                }
            },
            ClientState::Zombie { .. } => HashMap::new(),
        };

        self.event_logger.event_finished(
            region,
            "getMultiple",
            started.elapsed(),
            !result.is_empty(),
        );
        Ok(result)
    }

    /// Revives the client with a replacement connection.
    ///
    /// All buffered operations are replayed against the replacement in their original order
    /// before the client becomes alive. If the replay fails halfway, the failed operation and
    /// everything after it stay buffered, an error is reported and the client remains a
    /// zombie which is now bound to the replacement. Calling this on an alive client simply
    /// swaps the connection.
    pub async fn fix_cache(&self, replacement: Arc<dyn RemoteCacheService>) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        match &mut *state {
            ClientState::Alive { service } => {
                *service = replacement;
                Ok(())
            }
            ClientState::Zombie { service, queue } => {
                let buffered = queue.len();
                while let Some(op) = queue.pop() {
                    if let Err(error) = replay(replacement.as_ref(), &op).await {
                        log::warn!(
                            "Replay of buffered operation ({}) failed, staying a zombie: {}",
                            op.describe(),
                            error
                        );
                        queue.push_front(op);
                        *service = replacement;
                        return Err(error);
                    }
                }

                log::info!(
                    "Remote cache connection repaired, replayed {} buffered operations",
                    buffered
                );
                *state = ClientState::Alive {
                    service: replacement,
                };
                Ok(())
            }
        }
    }

    /// Logs the degradation and prepares the queue for the zombie state.
    fn degraded_queue(&self, region: &str, operation: &str, error: anyhow::Error) -> ZombieQueue {
        log::warn!(
            "{}: Remote cache failed during {}, degrading into a zombie: {}",
            region,
            operation,
            error
        );
        self.event_logger
            .error(region, &format!("Remote cache failed during {}", operation));

        ZombieQueue::new(self.max_queue_size)
    }
}

/// Applies one operation to the given service.
async fn replay(service: &dyn RemoteCacheService, op: &RemoteOp) -> anyhow::Result<()> {
    match op {
        RemoteOp::Update(element) => service.update(element.clone()).await,
        RemoteOp::Remove { region, key } => service.remove(region, key).await.map(|_| ()),
        RemoteOp::RemoveAll { region } => service.remove_all(region).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::test_async;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A service which records every call and can be toggled to fail.
    struct MockService {
        calls: StdMutex<Vec<String>>,
        broken: AtomicBool,
    }

    impl MockService {
        fn new() -> Arc<Self> {
            Arc::new(MockService {
                calls: StdMutex::new(Vec::new()),
                broken: AtomicBool::new(false),
            })
        }

        fn break_connection(&self) {
            self.broken.store(true, Ordering::Release);
        }

        fn repair_connection(&self) {
            self.broken.store(false, Ordering::Release);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> anyhow::Result<()> {
            if self.broken.load(Ordering::Acquire) {
                return Err(anyhow::anyhow!("Connection lost"));
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteCacheService for MockService {
        async fn update(&self, element: SerializedElement) -> anyhow::Result<()> {
            self.record(format!("update {}", element.key()))
        }

        async fn get(
            &self,
            _region: &str,
            key: &str,
        ) -> anyhow::Result<Option<SerializedElement>> {
            self.record(format!("get {}", key))?;
            Ok(None)
        }

        async fn get_multiple(
            &self,
            _region: &str,
            _keys: &[String],
        ) -> anyhow::Result<HashMap<String, SerializedElement>> {
            self.record("getMultiple".to_owned())?;
            Ok(HashMap::new())
        }

        async fn remove(&self, _region: &str, key: &str) -> anyhow::Result<bool> {
            self.record(format!("remove {}", key))?;
            Ok(true)
        }

        async fn remove_all(&self, _region: &str) -> anyhow::Result<()> {
            self.record("removeAll".to_owned())
        }
    }

    /// An event logger which counts starts and completions.
    struct CountingLogger {
        started: StdMutex<Vec<String>>,
        finished: StdMutex<Vec<(String, bool)>>,
    }

    impl CountingLogger {
        fn new() -> Arc<Self> {
            Arc::new(CountingLogger {
                started: StdMutex::new(Vec::new()),
                finished: StdMutex::new(Vec::new()),
            })
        }
    }

    impl CacheEventLogger for CountingLogger {
        fn event_started(&self, _region: &str, operation: &str, _key: Option<&str>) {
            self.started.lock().unwrap().push(operation.to_owned());
        }

        fn event_finished(
            &self,
            _region: &str,
            operation: &str,
            _duration: std::time::Duration,
            success: bool,
        ) {
            self.finished
                .lock()
                .unwrap()
                .push((operation.to_owned(), success));
        }

        fn error(&self, _region: &str, _message: &str) {}
    }

    fn element(key: &str) -> SerializedElement {
        CacheElement::new("testRegion", key, 42).to_serialized().unwrap()
    }

    fn client_with_queue(service: Arc<MockService>, max_queue_size: usize) -> RemoteCacheClient {
        let attributes = CacheAttributes {
            max_queue_size,
            ..Default::default()
        };
        RemoteCacheClient::new(service, &attributes)
    }

    #[test]
    fn a_failed_mutation_is_buffered_and_replayed_in_order() {
        test_async(async {
            let service = MockService::new();
            let client = client_with_queue(service.clone(), 100);

            client.update(element("a")).await.unwrap();

            service.break_connection();
            client.update(element("b")).await.unwrap();
            client.remove("testRegion", "a").await.unwrap();
            client.remove_all("testRegion").await.unwrap();

            // "b" triggered the degradation but was still buffered...
            assert_eq!(client.is_alive().await, false);
            assert_eq!(client.queued_ops().await, 3);

            service.repair_connection();
            client.fix_cache(service.clone()).await.unwrap();

            assert_eq!(client.is_alive().await, true);
            assert_eq!(client.queued_ops().await, 0);
            assert_eq!(
                service.calls(),
                vec!["update a", "update b", "remove a", "removeAll"]
            );
        });
    }

    #[test]
    fn zombie_reads_report_a_miss_without_touching_the_service() {
        test_async(async {
            let service = MockService::new();
            let client = client_with_queue(service.clone(), 100);

            service.break_connection();
            assert_eq!(client.get("testRegion", "a").await.unwrap().is_none(), true);
            assert_eq!(client.is_alive().await, false);

            service.repair_connection();
            assert_eq!(client.get("testRegion", "a").await.unwrap().is_none(), true);
            assert_eq!(
                client
                    .get_multiple("testRegion", &["a".to_owned()])
                    .await
                    .unwrap()
                    .is_empty(),
                true
            );

            // The service saw only the first (failing) call, nothing after the degradation...
            assert_eq!(service.calls().is_empty(), true);
        });
    }

    #[test]
    fn the_zombie_queue_drops_its_oldest_entries_on_overflow() {
        test_async(async {
            let service = MockService::new();
            let client = client_with_queue(service.clone(), 2);

            service.break_connection();
            client.update(element("a")).await.unwrap();
            client.update(element("b")).await.unwrap();
            client.update(element("c")).await.unwrap();
            client.update(element("d")).await.unwrap();

            assert_eq!(client.queued_ops().await, 2);

            service.repair_connection();
            client.fix_cache(service.clone()).await.unwrap();
            assert_eq!(service.calls(), vec!["update c", "update d"]);
        });
    }

    #[test]
    fn a_failing_replay_keeps_the_client_a_zombie_on_the_replacement() {
        test_async(async {
            let service = MockService::new();
            let client = client_with_queue(service.clone(), 100);

            service.break_connection();
            client.update(element("a")).await.unwrap();
            client.update(element("b")).await.unwrap();

            // The replacement connection is just as dead...
            let replacement = MockService::new();
            replacement.break_connection();
            assert_eq!(client.fix_cache(replacement.clone()).await.is_err(), true);
            assert_eq!(client.is_alive().await, false);
            assert_eq!(client.queued_ops().await, 2);

            // Once the replacement recovers, the buffered operations reach it and not the
            // original connection...
            replacement.repair_connection();
            client.fix_cache(replacement.clone()).await.unwrap();
            assert_eq!(replacement.calls(), vec!["update a", "update b"]);
            assert_eq!(service.calls().is_empty(), true);
        });
    }

    #[test]
    fn the_queue_bound_comes_from_the_region_attributes() {
        test_async(async {
            let config = crate::config::Config::new("test_settings.yml");
            config
                .load_from_string("regions:\n    testRegion:\n        max_queue_size: 2", None)
                .unwrap();

            let service = MockService::new();
            let client = RemoteCacheClient::new(
                service.clone(),
                &config.current().attributes("testRegion"),
            );

            service.break_connection();
            client.update(element("a")).await.unwrap();
            client.update(element("b")).await.unwrap();
            client.update(element("c")).await.unwrap();

            // The configured bound of two dropped the oldest buffered update...
            assert_eq!(client.queued_ops().await, 2);
        });
    }

    #[test]
    fn every_operation_is_bracketed_by_events_in_both_states() {
        test_async(async {
            let service = MockService::new();
            let logger = CountingLogger::new();
            let client =
                client_with_queue(service.clone(), 100).with_event_logger(logger.clone());

            client.update(element("a")).await.unwrap();
            service.break_connection();
            client.update(element("b")).await.unwrap();
            client.get("testRegion", "a").await.unwrap();
            client.remove("testRegion", "a").await.unwrap();

            assert_eq!(
                *logger.started.lock().unwrap(),
                vec!["update", "update", "get", "remove"]
            );
            let finished = logger.finished.lock().unwrap().clone();
            assert_eq!(finished.len(), 4);
            assert_eq!(finished[0], ("update".to_owned(), true));
            assert_eq!(finished[1], ("update".to_owned(), false));
        });
    }

    #[test]
    fn unserializable_values_fail_without_degrading_the_client() {
        test_async(async {
            use serde::Serializer;

            struct Unserializable;
            impl Serialize for Unserializable {
                fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
                    Err(serde::ser::Error::custom("not serializable"))
                }
            }

            let service = MockService::new();
            let client = client_with_queue(service.clone(), 100);

            let broken = CacheElement::new("testRegion", "a", Unserializable);
            assert_eq!(client.update_element(&broken).await.is_err(), true);

            // The client stays alive and nothing was buffered or sent...
            assert_eq!(client.is_alive().await, true);
            assert_eq!(service.calls().is_empty(), true);
        });
    }
}
