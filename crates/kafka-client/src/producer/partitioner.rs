use murmur2::{murmur2, KAFKA_SEED};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Partitioner selects the partition of records which don't name one.
///
/// Keyed records are hashed with murmur2, compatibly with other Kafka
/// clients, so that a key always maps to the same partition. Un-keyed
/// records "stick" to one partition of their topic, which is rotated
/// round-robin when the batch it was filling is closed, or after
/// `interval` has elapsed. This fills larger batches than spraying
/// records across partitions would.
#[derive(Debug)]
pub struct Partitioner {
    interval: Duration,
    sticky: Mutex<HashMap<String, Sticky>>,
}

#[derive(Debug)]
struct Sticky {
    partition: i32,
    since: Instant,
}

impl Partitioner {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sticky: Default::default(),
        }
    }

    /// Partition of a record of `topic` with `key`. `available` lists
    /// partitions with a known leader, and may be empty.
    /// `count` must be positive.
    pub fn partition(&self, topic: &str, key: Option<&[u8]>, available: &[i32], count: usize) -> i32 {
        if let Some(key) = key {
            return hash_partition(key, count);
        }

        let now = Instant::now();
        let mut sticky = self.sticky.lock().unwrap();

        match sticky.get_mut(topic) {
            Some(current)
                if (current.partition as usize) < count
                    && now.duration_since(current.since) < self.interval =>
            {
                current.partition
            }
            Some(current) => {
                current.partition = next_partition(current.partition, available, count);
                current.since = now;
                current.partition
            }
            None => {
                let partition = if available.is_empty() {
                    rand::thread_rng().gen_range(0..count) as i32
                } else {
                    available[rand::thread_rng().gen_range(0..available.len())]
                };
                sticky.insert(topic.to_string(), Sticky { partition, since: now });
                partition
            }
        }
    }

    /// Rotate the sticky partition of `topic`, if it's `partition`.
    /// Called as the batch of `partition` is closed.
    pub fn on_batch_closed(&self, topic: &str, partition: i32, available: &[i32], count: usize) {
        let mut sticky = self.sticky.lock().unwrap();

        if let Some(current) = sticky.get_mut(topic) {
            if current.partition == partition {
                current.partition = next_partition(partition, available, count);
                current.since = Instant::now();
            }
        }
    }
}

/// Partition of `key` among `count` partitions, as computed by the Java client.
pub fn hash_partition(key: &[u8], count: usize) -> i32 {
    ((murmur2(key, KAFKA_SEED) & 0x7fff_ffff) % count as u32) as i32
}

// The partition following `current`, preferring those with a known leader.
fn next_partition(current: i32, available: &[i32], count: usize) -> i32 {
    if let Some(next) = available.iter().find(|p| **p > current) {
        *next
    } else if let Some(first) = available.first() {
        *first
    } else {
        (current + 1).rem_euclid(count.max(1) as i32)
    }
}
