use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use super::{CacheEntry, CacheKey, CacheResult, CacheStore};
use crate::check::CheckResult;

const DEFAULT_SHARDS: usize = 16;

type Shard = HashMap<CacheKey, CacheEntry>;

/// In-memory store split into `RwLock` shards selected by key digest.
pub struct MemoryCacheStore {
    shards: Vec<RwLock<Shard>>,
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }
}

impl MemoryCacheStore {
    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        Self {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, key: &CacheKey) -> &RwLock<Shard> {
        let digest = key.digest();
        let bytes = digest.as_bytes();
        let index = u16::from_be_bytes([bytes[0], bytes[1]]) as usize % self.shards.len();
        &self.shards[index]
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| read(shard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// A panic while holding a shard lock cannot leave a map half-updated, so a
// poisoned lock is still safe to use.
fn read(shard: &RwLock<Shard>) -> RwLockReadGuard<'_, Shard> {
    shard.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write(shard: &RwLock<Shard>) -> RwLockWriteGuard<'_, Shard> {
    shard.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let now = Utc::now();
        Ok(read(self.shard_for(key))
            .get(key)
            .filter(|entry| !entry.is_expired_at(now))
            .cloned())
    }

    fn put(&self, key: &CacheKey, result: &CheckResult, ttl: Duration) -> CacheResult<()> {
        let entry = CacheEntry::new(key.clone(), result.clone(), ttl);
        let now = Utc::now();
        let mut shard = write(self.shard_for(key));
        shard.retain(|_, existing| !existing.is_expired_at(now));
        shard.insert(key.clone(), entry);
        Ok(())
    }
}
