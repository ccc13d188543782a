//! Collects call statistics for the remote cache tier.
//!
//! [CacheEventStats] is the built-in [CacheEventLogger](crate::remote::CacheEventLogger): it
//! counts the calls per region and operation and keeps a sliding [Average] of their durations.
//! The averages are lock and wait free, so recording a measurement is cheap enough to bracket
//! every single cache operation.
use std::collections::HashMap;
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::fmt::format_micros;
use crate::remote::CacheEventLogger;

/// A sliding average over the most recent measurements.
///
/// Besides the average itself the total number of recorded values is kept, so a single
/// instance answers both "how fast" and "how often" for one operation. Readers and
/// writers never block each other.
///
/// # Example
///
/// ```
/// # use strata::stats::Average;
/// let durations = Average::new();
/// durations.add(10);
/// durations.add(20);
/// durations.add(30);
///
/// assert_eq!(durations.avg(), 20);
/// assert_eq!(durations.count(), 3);
/// ```
#[derive(Default)]
pub struct Average {
    window: AtomicU64,
    total: AtomicU64,
}

impl Clone for Average {
    fn clone(&self) -> Self {
        Average {
            window: AtomicU64::new(self.window.load(Ordering::Relaxed)),
            total: AtomicU64::new(self.total.load(Ordering::Relaxed)),
        }
    }
}

impl Average {
    /// Creates a new average.
    pub fn new() -> Average {
        Average {
            window: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    /// Splits the window word into its sum (upper half) and count (lower half).
    fn unpack_window(&self) -> (i32, i32) {
        let window = self.window.load(Ordering::Relaxed);
        let count = (window & 0xFFFFFFFF) as i32;
        let sum = ((window >> 32) & 0xFFFFFFFF) as i32;

        (sum, count)
    }

    /// Records another measurement.
    ///
    /// The running sum and the window count are packed into a single u64 which is read
    /// and written with plain atomic operations, so no lock is ever taken. Once the
    /// window holds 100 values, or admitting the next value would overflow the i32 sum,
    /// both halves are repeatedly halved before the value is added. Old measurements
    /// therefore fade out instead of dominating the result forever.
    ///
    /// Concurrent writers may lose an update to the window now and then. For a
    /// statistical value fed with microsecond durations this is perfectly acceptable.
    pub fn add(&self, value: i32) {
        self.total.fetch_add(1, Ordering::Relaxed);

        let (mut sum, mut count) = self.unpack_window();

        while count > 100 || sum as i64 + value as i64 > i32::MAX as i64 {
            sum = count / 2 * sum / count;
            count /= 2;
        }

        sum += value;
        count += 1;

        let window = (sum as u64 & 0xFFFFFFFF) << 32 | (count as u64 & 0xFFFFFFFF);
        self.window.store(window, Ordering::Relaxed);
    }

    /// Returns how many values were recorded in total, not just within the current window.
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the average of the values in the current window.
    pub fn avg(&self) -> i32 {
        let (sum, count) = self.unpack_window();

        if sum == 0 {
            0
        } else {
            sum / count
        }
    }
}

impl Display for Average {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        format_micros(self.avg(), f)?;
        write!(f, " ({})", self.count())?;
        Ok(())
    }
}

/// The per-operation measurements of one region.
#[derive(Default, Clone)]
struct OperationStats {
    duration: Average,
    successes: u64,
}

/// Counts and times the remote cache calls per region and operation.
///
/// An instance is attached to a
/// [RemoteCacheClient](crate::remote::RemoteCacheClient) via
/// [with_event_logger](crate::remote::RemoteCacheClient::with_event_logger) and can be rendered
/// into a report at any time.
#[derive(Default)]
pub struct CacheEventStats {
    operations: Mutex<HashMap<(String, String), OperationStats>>,
    errors: Mutex<HashMap<String, u64>>,
}

impl CacheEventStats {
    /// Creates an empty statistics collector.
    pub fn new() -> Self {
        CacheEventStats::default()
    }

    /// Returns the total number of completed calls of the given operation in the given region.
    pub fn calls(&self, region: &str, operation: &str) -> u64 {
        self.operations
            .lock()
            .unwrap()
            .get(&(region.to_owned(), operation.to_owned()))
            .map(|stats| stats.duration.count())
            .unwrap_or(0)
    }

    /// Returns the number of calls of the given operation which reached the remote tier.
    pub fn successes(&self, region: &str, operation: &str) -> u64 {
        self.operations
            .lock()
            .unwrap()
            .get(&(region.to_owned(), operation.to_owned()))
            .map(|stats| stats.successes)
            .unwrap_or(0)
    }

    /// Returns the sliding average duration (in microseconds) of the given operation.
    pub fn average_duration(&self, region: &str, operation: &str) -> i32 {
        self.operations
            .lock()
            .unwrap()
            .get(&(region.to_owned(), operation.to_owned()))
            .map(|stats| stats.duration.avg())
            .unwrap_or(0)
    }

    /// Returns the number of errors reported for the given region.
    pub fn errors(&self, region: &str) -> u64 {
        self.errors
            .lock()
            .unwrap()
            .get(region)
            .copied()
            .unwrap_or(0)
    }

    /// Renders a small report, one line per region and operation.
    pub fn report(&self) -> String {
        let operations = self.operations.lock().unwrap();
        let mut keys: Vec<&(String, String)> = operations.keys().collect();
        keys.sort();

        let mut result = String::new();
        for key in keys {
            if let Some(stats) = operations.get(key) {
                result.push_str(&format!(
                    "{}/{}: {} ({} remote)\n",
                    key.0, key.1, stats.duration, stats.successes
                ));
            }
        }

        result
    }
}

impl CacheEventLogger for CacheEventStats {
    fn event_started(&self, _region: &str, _operation: &str, _key: Option<&str>) {
        // Only completions are recorded; a started event carries no measurement yet.
    }

    fn event_finished(&self, region: &str, operation: &str, duration: Duration, success: bool) {
        let mut operations = self.operations.lock().unwrap();
        let stats = operations
            .entry((region.to_owned(), operation.to_owned()))
            .or_default();
        stats
            .duration
            .add(duration.as_micros().min(std::i32::MAX as u128) as i32);
        if success {
            stats.successes += 1;
        }
    }

    fn error(&self, region: &str, _message: &str) {
        *self.errors.lock().unwrap().entry(region.to_owned()).or_insert(0) += 1;
    }
}
