//! # Sharded Map
//!
//! A fixed array of independently locked hash maps. Sharding exists purely to
//! reduce lock contention under high connection churn; with a single shard
//! the structure degenerates to one locked map.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::hash::Hash;

/// One shard, padded so neighbouring locks never share a cache line.
#[repr(align(64))]
struct Shard<K, V> {
    map: Mutex<HashMap<K, V>>,
}

/// A partitioned map whose shard count is fixed at construction.
///
/// ## Lock Ordering
/// Any operation that needs more than one shard goes through [`lock_all`],
/// which acquires shards in ascending index order. Code that only touches
/// one shard at a time can never deadlock against it.
///
/// [`lock_all`]: ShardedMap::lock_all
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    /// Creates `shards` empty shards. A count of zero is promoted to one.
    pub fn new(shards: usize) -> Self {
        let count = shards.max(1);
        let shards = (0..count)
            .map(|_| Shard { map: Mutex::new(HashMap::new()) })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { shards }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Maps a stable routing key onto a shard index.
    #[inline]
    pub fn index_of(&self, routing_key: u64) -> usize {
        (routing_key % self.shards.len() as u64) as usize
    }

    /// Locks a single shard.
    ///
    /// # Panics
    /// Panics if `idx` is out of range.
    pub fn lock_shard(&self, idx: usize) -> MutexGuard<'_, HashMap<K, V>> {
        self.shards[idx].map.lock()
    }

    /// Locks every shard in ascending order.
    ///
    /// The returned guard releases them in reverse order when dropped.
    pub fn lock_all(&self) -> AllShardsGuard<'_, K, V> {
        let mut guards = Vec::with_capacity(self.shards.len());
        for shard in self.shards.iter() {
            guards.push(shard.map.lock());
        }
        AllShardsGuard { guards }
    }

    /// Sums shard sizes one shard at a time. Not a consistent snapshot.
    pub fn len_relaxed(&self) -> usize {
        self.shards.iter().map(|s| s.map.lock().len()).sum()
    }
}

/// Holds every shard lock of a [`ShardedMap`] at once.
pub struct AllShardsGuard<'a, K, V> {
    guards: Vec<MutexGuard<'a, HashMap<K, V>>>,
}

impl<'a, K, V> AllShardsGuard<'a, K, V> {
    /// Iterates all entries, shard by shard in ascending order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
        Box::new(self.guards.iter().flat_map(|g| g.iter()))
    }

    pub fn len(&self) -> usize {
        self.guards.iter().map(|g| g.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.iter().all(|g| g.is_empty())
    }
}

impl<'a, K, V> Drop for AllShardsGuard<'a, K, V> {
    fn drop(&mut self) {
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}

static_assertions::assert_impl_all!(ShardedMap<u64, u64>: Send, Sync);
