//! Strata is a library providing a multi-tier object cache.
//!
//! # Introduction
//! **Strata** keeps hot objects in a bounded in-process memory tier and pushes everything else
//! down to slower tiers. The memory tier is a strict LRU store: the least recently used elements
//! are handed to an overflow sink (e.g. a disk tier) once the configured capacity is reached.
//! A background **shrinker** additionally expires idle or aged elements independent of capacity
//! pressure, so a quiet cache gives its memory back.
//!
//! Next to the local tier, Strata ships a client for a remote (replicated) cache tier which is
//! built to survive transient network failure: once the remote peer becomes unreachable, the
//! client degrades into a **zombie** which buffers all mutating operations locally. When the
//! connection is re-established, the buffered operations are replayed in order, so no update or
//! removal is lost along the way. The same resilience is applied to event subscriptions: a local
//! shadow registry records which listeners should be attached to which region and re-attaches
//! all of them once a fresh observer connection is available.
//!
//! # Modules
//! * **memory**: The LRU memory tier ([LruMemoryCache](memory::LruMemoryCache) and its
//!   shared handle [MemoryStore](memory::MemoryStore)) together with the background
//!   [shrinker](memory::shrinker).
//! * **remote**: The zombie-failover client for the remote tier
//!   ([RemoteCacheClient](remote::RemoteCacheClient)) and the traits which describe the
//!   remote collaborators.
//! * **watch**: The repairable listener registry ([CacheWatchRepairable](watch::CacheWatchRepairable)).
//! * **regions**: Type-safe access to named cache regions ([CacheRegions](regions::CacheRegions)).
//! * **config**: The reload-aware YAML configuration which carries the per-region attributes.
//!
//! # Collaborators
//! Strata deliberately does not implement a disk store, a network transport or a serialization
//! codec beyond plain JSON. These are external collaborators described by small traits
//! ([OverflowSink](memory::OverflowSink), [RemoteCacheService](remote::RemoteCacheService),
//! [CacheObserver](remote::CacheObserver), [CacheEventLogger](remote::CacheEventLogger)) so that
//! every deployment can plug in its own tiers.
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod config;
pub mod element;
pub mod fmt;
pub mod hub;
pub mod memory;
pub mod regions;
pub mod remote;
pub mod signals;
pub mod stats;
pub mod watch;

/// Contains the version of the Strata library.
pub const STRATA_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate strata;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
