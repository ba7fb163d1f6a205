//! Per-key mutual exclusion for stores without atomic updates.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock shards.
pub const DEFAULT_SHARDS: usize = 64;

/// Serializes read-modify-write cycles on the same key.
///
/// Keys are hashed onto a fixed set of async mutexes. Two calls for the same
/// key always contend on the same shard; unrelated keys usually do not. With a
/// single shard every key shares one lock.
///
/// This only orders calls within one process. It gives no protection to a
/// store shared with other engine instances.
#[derive(Debug)]
pub struct KeyGuard {
    shards: Box<[Mutex<()>]>,
    hasher: RandomState,
}

impl KeyGuard {
    /// Create a guard with `shards` locks (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            shards,
            hasher: RandomState::new(),
        }
    }

    /// Number of lock shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// The lock is held until the returned guard is dropped, including when the
    /// owning future is cancelled.
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(key)].lock().await
    }

    fn shard_index(&self, key: &str) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

impl Default for KeyGuard {
    fn default() -> Self {
        Self::new(DEFAULT_SHARDS)
    }
}
