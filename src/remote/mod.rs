//! Provides the client for the remote cache tier and the traits describing its collaborators.
//!
//! The remote tier itself (a replicated cache server, a distributed store, ...) is not part of
//! this crate. It is represented by the [RemoteCacheService] trait, which a deployment
//! implements on top of its transport of choice. What this crate does provide is the
//! resilience around such a service: the [RemoteCacheClient] keeps working when the remote
//! peer goes away by degrading into a **zombie** which buffers all mutations and replays them
//! once the connection is repaired.
//!
//! Event subscriptions are covered by the same pattern: the
//! [CacheWatchRepairable](crate::watch::CacheWatchRepairable) registry records all listeners in
//! a local shadow so that they can be re-attached to a fresh [CacheObserver] connection.
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::element::SerializedElement;

mod client;
mod zombie;

pub use client::RemoteCacheClient;
pub use zombie::{RemoteOp, ZombieQueue};

/// Describes the remote cache tier.
///
/// Implementations wrap the actual transport (TCP, HTTP, shared memory, ...). All methods may
/// fail with a transport error, which the [RemoteCacheClient] treats as the signal to degrade
/// into a zombie.
#[async_trait]
pub trait RemoteCacheService: Send + Sync {
    /// Stores or replaces the given element on the remote tier.
    async fn update(&self, element: SerializedElement) -> anyhow::Result<()>;

    /// Fetches the element stored for the given key, if any.
    async fn get(&self, region: &str, key: &str) -> anyhow::Result<Option<SerializedElement>>;

    /// Fetches all of the given keys in one round trip.
    ///
    /// Keys which are not present on the remote tier are simply absent from the result.
    async fn get_multiple(
        &self,
        region: &str,
        keys: &[String],
    ) -> anyhow::Result<HashMap<String, SerializedElement>>;

    /// Removes the element stored for the given key.
    ///
    /// Returns whether the key was present on the remote tier.
    async fn remove(&self, region: &str, key: &str) -> anyhow::Result<bool>;

    /// Removes all elements of the given region.
    async fn remove_all(&self, region: &str) -> anyhow::Result<()>;
}

/// Describes the subscription endpoint of the remote tier.
///
/// An observer connection carries the listener registrations. Just like the service, it can
/// fail at any time; the [CacheWatchRepairable](crate::watch::CacheWatchRepairable) registry
/// replays all known registrations against a replacement connection.
#[async_trait]
pub trait CacheObserver: Send + Sync {
    /// Attaches the given listener to the given region.
    async fn add_listener(
        &self,
        region: &str,
        listener: std::sync::Arc<dyn CacheListener>,
    ) -> anyhow::Result<()>;

    /// Detaches the listener with the given id from the given region.
    async fn remove_listener(&self, region: &str, listener_id: u64) -> anyhow::Result<()>;
}

/// Receives change notifications for a watched region.
pub trait CacheListener: Send + Sync {
    /// Returns the id under which this listener is registered.
    ///
    /// Ids are assigned by the caller and have to be unique per region.
    fn id(&self) -> u64;

    /// Invoked when an element was stored or replaced.
    fn handle_update(&self, element: SerializedElement);

    /// Invoked when an element was removed.
    fn handle_remove(&self, region: &str, key: &str);

    /// Invoked when a whole region was cleared.
    fn handle_remove_all(&self, region: &str);
}

/// Receives a start and a completion notification for every remote cache operation.
///
/// The [RemoteCacheClient] brackets each of its calls with these notifications, in the alive
/// state as well as in the zombie state, so that an implementation can derive call counts and
/// latencies. [CacheEventStats](crate::stats::CacheEventStats) is the built-in implementation.
pub trait CacheEventLogger: Send + Sync {
    /// Invoked when an operation starts.
    fn event_started(&self, region: &str, operation: &str, key: Option<&str>);

    /// Invoked when an operation ends.
    ///
    /// `success` reports whether the operation reached the remote tier; a buffered zombie
    /// mutation ends with `success == false` even though it will be replayed later.
    fn event_finished(&self, region: &str, operation: &str, duration: Duration, success: bool);

    /// Invoked when an operation failed in an unexpected way.
    fn error(&self, region: &str, message: &str);
}

/// A logger which discards all events.
///
/// This is the default used by clients without an attached statistics collector.
pub struct NoopEventLogger;

impl CacheEventLogger for NoopEventLogger {
    fn event_started(&self, _region: &str, _operation: &str, _key: Option<&str>) {}

    fn event_finished(
        &self,
        _region: &str,
        _operation: &str,
        _duration: Duration,
        _success: bool,
    ) {
    }

    fn error(&self, _region: &str, _message: &str) {}
}
