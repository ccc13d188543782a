//! Buffers mutating remote cache operations while the remote tier is unreachable.
use std::collections::VecDeque;

use crate::element::SerializedElement;

/// A single buffered mutation.
///
/// Reads are never buffered (they simply report a miss while the remote tier is down), so the
/// queue only ever carries updates and removals.
#[derive(Debug)]
pub enum RemoteOp {
    /// Stores or replaces an element.
    Update(SerializedElement),
    /// Removes a single key.
    Remove {
        /// The region to remove from.
        region: String,
        /// The key to remove.
        key: String,
    },
    /// Clears a whole region.
    RemoveAll {
        /// The region to clear.
        region: String,
    },
}

impl RemoteOp {
    /// Provides a short human readable description for log output.
    pub fn describe(&self) -> String {
        match self {
            RemoteOp::Update(element) => {
                format!("update {}/{}", element.region(), element.key())
            }
            RemoteOp::Remove { region, key } => format!("remove {}/{}", region, key),
            RemoteOp::RemoveAll { region } => format!("removeAll {}", region),
        }
    }
}

/// A bounded FIFO buffer of mutations awaiting replay.
///
/// The queue is lossy towards its oldest entries: once the configured limit is reached, the
/// oldest buffered operation is dropped to make room for the newest one. This keeps the most
/// recent state transitions, which are the ones worth replaying after a long outage.
pub struct ZombieQueue {
    ops: VecDeque<RemoteOp>,
    max_size: usize,
    dropped: u64,
}

impl ZombieQueue {
    /// Creates a queue holding at most the given number of operations.
    pub fn new(max_size: usize) -> Self {
        ZombieQueue {
            ops: VecDeque::new(),
            max_size: max_size.max(1),
            dropped: 0,
        }
    }

    /// Appends an operation, dropping the oldest buffered one if the queue is full.
    pub fn push(&mut self, op: RemoteOp) {
        if self.ops.len() >= self.max_size {
            if let Some(lost) = self.ops.pop_front() {
                self.dropped += 1;
                log::warn!(
                    "Zombie queue overflow, dropping oldest buffered operation: {}",
                    lost.describe()
                );
            }
        }

        self.ops.push_back(op);
    }

    /// Removes and returns the oldest buffered operation.
    pub fn pop(&mut self) -> Option<RemoteOp> {
        self.ops.pop_front()
    }

    /// Puts an operation back at the front of the queue.
    ///
    /// This is used when a replay attempt fails halfway: the failed operation has to be the
    /// next one replayed so that the original order is preserved.
    pub fn push_front(&mut self, op: RemoteOp) {
        self.ops.push_front(op);
    }

    /// Returns the number of buffered operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Determines if no operations are buffered.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the number of operations lost to overflow so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remove_op(key: &str) -> RemoteOp {
        RemoteOp::Remove {
            region: "testRegion".to_owned(),
            key: key.to_owned(),
        }
    }

    fn key_of(op: &RemoteOp) -> String {
        match op {
            RemoteOp::Remove { key, .. } => key.clone(),
            _ => panic!("Unexpected op"),
        }
    }

    #[test]
    fn operations_are_replayed_in_insertion_order() {
        let mut queue = ZombieQueue::new(10);
        assert_eq!(queue.is_empty(), true);

        queue.push(remove_op("a"));
        queue.push(remove_op("b"));
        queue.push(remove_op("c"));
        assert_eq!(queue.is_empty(), false);

        assert_eq!(key_of(&queue.pop().unwrap()), "a");
        assert_eq!(key_of(&queue.pop().unwrap()), "b");
        assert_eq!(key_of(&queue.pop().unwrap()), "c");
        assert_eq!(queue.pop().is_none(), true);
        assert_eq!(queue.is_empty(), true);
    }

    #[test]
    fn overflow_drops_the_oldest_entries_first() {
        let mut queue = ZombieQueue::new(2);
        queue.push(remove_op("a"));
        queue.push(remove_op("b"));
        queue.push(remove_op("c"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(key_of(&queue.pop().unwrap()), "b");
        assert_eq!(key_of(&queue.pop().unwrap()), "c");
    }

    #[test]
    fn push_front_restores_the_replay_position() {
        let mut queue = ZombieQueue::new(10);
        queue.push(remove_op("a"));
        queue.push(remove_op("b"));

        let failed = queue.pop().unwrap();
        queue.push_front(failed);

        assert_eq!(key_of(&queue.pop().unwrap()), "a");
        assert_eq!(key_of(&queue.pop().unwrap()), "b");
    }
}
