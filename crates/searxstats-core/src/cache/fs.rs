use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::{CacheEntry, CacheKey, CacheResult, CacheStore};
use crate::check::CheckResult;

/// File-backed store with git-style 2-char sharding.
///
/// Layout: `<root>/entries/<first 2 hex chars>/<remaining hex chars>.json`,
/// named by the key digest. Entries survive across runs.
pub struct FsCacheStore {
    entries_dir: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root`. Creates `root/entries/` if needed.
    pub fn new(root: impl AsRef<Path>) -> CacheResult<Self> {
        let entries_dir = root.as_ref().join("entries");
        fs::create_dir_all(&entries_dir)?;
        Ok(Self { entries_dir })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let hex = key.digest().to_hex();
        self.entries_dir
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]))
    }

    fn remove_stale(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "failed to remove cache entry");
            }
        }
    }
}

impl CacheStore for FsCacheStore {
    fn get(&self, key: &CacheKey) -> CacheResult<Option<CacheEntry>> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // An unreadable entry is treated as a miss and replaced on the next put.
        let entry: CacheEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding corrupt cache entry");
                Self::remove_stale(&path);
                return Ok(None);
            }
        };
        if entry.key != *key {
            return Ok(None);
        }
        if entry.is_expired() {
            debug!(path = %path.display(), "evicting expired cache entry");
            Self::remove_stale(&path);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    fn put(&self, key: &CacheKey, result: &CheckResult, ttl: Duration) -> CacheResult<()> {
        let entry = CacheEntry::new(key.clone(), result.clone(), ttl);
        let path = self.entry_path(key);
        let shard_dir = path
            .parent()
            .unwrap_or(self.entries_dir.as_path())
            .to_path_buf();
        fs::create_dir_all(&shard_dir)?;

        // Atomic write: temp file in the same directory, then rename over.
        let mut tmp = NamedTempFile::new_in(&shard_dir)?;
        serde_json::to_writer(&mut tmp, &entry)?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::tests::sample_key;
    use crate::check::{CheckOutcome, FailureKind};

    fn make_store() -> (tempfile::TempDir, FsCacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::new(dir.path()).unwrap();
        (dir, store)
    }

    fn hard_result(key: &CacheKey) -> CheckResult {
        CheckResult::unattempted(
            key.instance.clone(),
            key.kind,
            CheckOutcome::hard(FailureKind::NotAnInstance, "parked domain"),
        )
    }

    #[test]
    fn entry_roundtrip() {
        let (_dir, store) = make_store();
        let key = sample_key("https://a.example/");
        let result = hard_result(&key);
        store.put(&key, &result, Duration::from_secs(60)).unwrap();
        let entry = store.get(&key).unwrap().unwrap();
        assert_eq!(entry.result, result);
        assert_eq!(entry.key, key);
    }

    #[test]
    fn sharded_layout() {
        let (dir, store) = make_store();
        let key = sample_key("https://a.example/");
        store
            .put(&key, &hard_result(&key), Duration::from_secs(60))
            .unwrap();

        let hex = key.digest().to_hex();
        let file = dir
            .path()
            .join("entries")
            .join(&hex[..2])
            .join(format!("{}.json", &hex[2..]));
        assert!(file.is_file());
    }

    #[test]
    fn survives_reopen() {
        let (dir, store) = make_store();
        let key = sample_key("https://a.example/");
        store
            .put(&key, &hard_result(&key), Duration::from_secs(60))
            .unwrap();
        drop(store);

        let reopened = FsCacheStore::new(dir.path()).unwrap();
        assert!(reopened.get(&key).unwrap().is_some());
    }

    #[test]
    fn expired_entry_removed_on_read() {
        let (_dir, store) = make_store();
        let key = sample_key("https://a.example/");
        store.put(&key, &hard_result(&key), Duration::ZERO).unwrap();
        let path = store.entry_path(&key);
        assert!(path.exists());

        assert!(store.get(&key).unwrap().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let (_dir, store) = make_store();
        let key = sample_key("https://a.example/");
        store
            .put(&key, &hard_result(&key), Duration::from_secs(60))
            .unwrap();
        std::fs::write(store.entry_path(&key), b"{ not json").unwrap();

        assert!(store.get(&key).unwrap().is_none());
        store
            .put(&key, &hard_result(&key), Duration::from_secs(60))
            .unwrap();
        assert!(store.get(&key).unwrap().is_some());
    }

    #[test]
    fn missing_entry_is_none() {
        let (_dir, store) = make_store();
        assert!(store
            .get(&sample_key("https://nobody.example/"))
            .unwrap()
            .is_none());
    }
}
