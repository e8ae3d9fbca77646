//! Time-bounded result cache.
//!
//! Entries are addressed by (instance, check kind, runner fingerprint) and
//! expire after a TTL. Two stores implement [`CacheStore`]: a sharded
//! in-memory map and a sharded directory of JSON files. [`ResultCache`] puts
//! a single-flight gate in front of either.

pub mod fs;
pub mod memory;
pub mod singleflight;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::check::{CheckKind, CheckResult};
use crate::config::CacheConfig;
use crate::fingerprint::Fingerprint;
use crate::instance::InstanceId;

pub use fs::FsCacheStore;
pub use memory::MemoryCacheStore;
pub use singleflight::ResultCache;

/// Identity of a cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub instance: InstanceId,
    pub kind: CheckKind,
    pub fingerprint: Fingerprint,
}

impl CacheKey {
    pub fn new(instance: InstanceId, kind: CheckKind, fingerprint: Fingerprint) -> Self {
        Self {
            instance,
            kind,
            fingerprint,
        }
    }

    /// Stable digest of the whole key, used for sharding and file names.
    pub fn digest(&self) -> Fingerprint {
        Fingerprint::from_parts(&[
            self.instance.as_str().as_bytes(),
            self.kind.as_str().as_bytes(),
            self.fingerprint.as_bytes(),
        ])
    }
}

/// A stored result with its validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub result: CheckResult,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(key: CacheKey, result: CheckResult, ttl: Duration) -> Self {
        let stored_at = Utc::now();
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| stored_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key,
            result,
            stored_at,
            expires_at,
        }
    }

    /// An entry is expired at and after its expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entry serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Storage for cache entries. Implementations synchronize internally.
pub trait CacheStore: Send + Sync {
    /// The live entry for `key`; `None` if absent or expired.
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>>;

    /// Insert or overwrite the entry for `key`.
    fn put(&self, key: &CacheKey, result: &CheckResult, ttl: Duration) -> CacheResult<()>;
}

/// Open the store described by `config`: file-backed when a directory is
/// set, in-memory otherwise.
pub fn open_store(config: &CacheConfig) -> CacheResult<Arc<dyn CacheStore>> {
    Ok(match &config.dir {
        Some(dir) => Arc::new(FsCacheStore::new(dir)?),
        None => Arc::new(MemoryCacheStore::default()),
    })
}
