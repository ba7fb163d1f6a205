//! In-process bucket table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::Store;
use crate::bucket::BucketState;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BucketState,
    /// Store clock reading of the last write
    written: i64,
}

/// Bucket state held in a concurrent map owned by this process.
///
/// Individual reads and writes are atomic, but a get followed by a set is not:
/// this store is [`Atomicity::ProcessLocal`](super::Atomicity::ProcessLocal).
#[derive(Debug)]
pub struct MemoryStore {
    buckets: DashMap<String, Entry>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store stamping writes with `clock`.
    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            buckets: DashMap::new(),
            clock: Arc::new(clock),
        }
    }

    /// Number of keys with a record.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no key has a record.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Drop the record for `key`, returning it if present.
    pub fn remove(&self, key: &str) -> Option<BucketState> {
        self.buckets.remove(key).map(|(_, entry)| entry.state)
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.buckets.clear();
    }

    /// Drop records not written for longer than `idle`.
    ///
    /// Every take writes its key, rejected ones included, so only keys nobody
    /// asked about for `idle` are dropped. Such a key comes back full.
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let idle = i64::try_from(idle.as_nanos()).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_nanos().saturating_sub(idle);

        let mut evicted = 0;
        self.buckets.retain(|_, entry| {
            let keep = entry.written >= cutoff;
            if !keep {
                evicted += 1;
            }
            keep
        });
        if evicted > 0 {
            debug!(evicted, remaining = self.buckets.len(), "Evicted idle buckets");
        }
        evicted
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<BucketState> {
        Ok(self
            .buckets
            .get(key)
            .map(|entry| entry.state)
            .unwrap_or_default())
    }

    async fn set(&self, key: &str, state: BucketState) -> Result<()> {
        let entry = Entry {
            state,
            written: self.clock.now_nanos(),
        };
        self.buckets.insert(key.to_string(), entry);
        Ok(())
    }
}
