//! Single-flight access to a [`CacheStore`].
//!
//! Callers take the per-key lock before looking up and hold it until the
//! attempt's result is written. A second caller for the same key waits and
//! then finds the first caller's entry instead of repeating the backend call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use super::{CacheKey, CacheResult, CacheStore};
use crate::check::CheckResult;

/// Held while a caller owns a key. Dropping it lets the next caller in.
pub type KeyGuard = OwnedMutexGuard<()>;

pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    ttl: Duration,
    locks: Mutex<HashMap<CacheKey, Arc<AsyncMutex<()>>>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Wait for exclusive ownership of `key`.
    pub async fn lock(&self, key: &CacheKey) -> KeyGuard {
        let gate = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            // Drop gates nobody holds or waits on.
            locks.retain(|_, gate| Arc::strong_count(gate) > 1);
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        gate.lock_owned().await
    }

    /// The live cached result for `key`, marked as served from cache.
    pub fn lookup(&self, key: &CacheKey) -> CacheResult<Option<CheckResult>> {
        Ok(self.store.get(key)?.map(|entry| {
            let mut result = entry.result;
            result.cached = true;
            result
        }))
    }

    /// Store `result` if it is cacheable. Returns whether it was written.
    pub fn record(&self, key: &CacheKey, result: &CheckResult) -> CacheResult<bool> {
        if !result.is_cacheable() {
            return Ok(false);
        }
        let mut stored = result.clone();
        stored.cached = false;
        self.store.put(key, &stored, self.ttl)?;
        debug!(
            instance = %key.instance,
            kind = %key.kind,
            fingerprint = %key.fingerprint.short(),
            "cached result"
        );
        Ok(true)
    }
}
