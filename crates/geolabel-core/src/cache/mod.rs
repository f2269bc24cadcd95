//! Lookup result memoization.
//!
//! A [`CacheStore`] is a plain key-value contract owned by the host; the
//! [`Memoizer`] layers the success/failure reuse policy on top of it.

mod key;

use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use key::{CacheKey, KeySpec};

/// Stored outcome of one lookup: `{"result": ...}` on success, `{}` on failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl CacheEntry {
    pub fn success(result: Value) -> Self {
        Self {
            result: Some(result),
        }
    }

    pub fn failure() -> Self {
        Self { result: None }
    }

    pub fn is_failure(&self) -> bool {
        self.result.is_none()
    }
}

/// Key-value store shared by all tasks of a batch.
///
/// `get` and `set` must each be atomic; concurrent writers to one key may
/// race, last write wins. Expiration is the store's business.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry>;
    fn set(&self, key: &CacheKey, entry: CacheEntry);
}

/// In-process store backed by `moka`.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Cache<String, CacheEntry>,
}

impl MemoryCache {
    pub fn new(max_entries: u64) -> Self {
        Self {
            inner: Cache::new(max_entries),
        }
    }

    /// Entries older than `ttl` are evicted.
    pub fn with_ttl(max_entries: u64, ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
        }
    }

    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("entries", &self.inner.entry_count())
            .finish()
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.get(key.as_str())
    }

    fn set(&self, key: &CacheKey, entry: CacheEntry) {
        self.inner.insert(key.as_str().to_string(), entry);
    }
}

/// What the cache says about a record before any lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheDecision {
    /// Prior success; use this result.
    Hit(Value),
    /// Prior failure and failures are honored; skip the record.
    HonoredFailure,
    /// Nothing usable; perform the lookup.
    Miss,
}

/// Reuse policy over an optional store. Without a store every call is a
/// no-op and every lookup is a miss.
#[derive(Clone)]
pub struct Memoizer {
    store: Option<Arc<dyn CacheStore>>,
    ignore_failed: bool,
}

impl Memoizer {
    pub fn new(store: Option<Arc<dyn CacheStore>>, ignore_failed: bool) -> Self {
        Self {
            store,
            ignore_failed,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn lookup(&self, key: &CacheKey) -> CacheDecision {
        let Some(store) = &self.store else {
            return CacheDecision::Miss;
        };
        match store.get(key) {
            Some(CacheEntry {
                result: Some(result),
            }) => {
                debug!(key = %key, "cache hit");
                CacheDecision::Hit(result)
            }
            Some(_) if !self.ignore_failed => {
                debug!(key = %key, "cached failure honored");
                CacheDecision::HonoredFailure
            }
            Some(_) => {
                debug!(key = %key, "cached failure ignored, retrying lookup");
                CacheDecision::Miss
            }
            None => {
                debug!(key = %key, "cache miss");
                CacheDecision::Miss
            }
        }
    }

    pub fn store_success(&self, key: &CacheKey, result: Value) {
        if let Some(store) = &self.store {
            store.set(key, CacheEntry::success(result));
        }
    }

    pub fn store_failure(&self, key: &CacheKey) {
        if let Some(store) = &self.store {
            store.set(key, CacheEntry::failure());
        }
    }
}

impl std::fmt::Debug for Memoizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memoizer")
            .field("enabled", &self.is_enabled())
            .field("ignore_failed", &self.ignore_failed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s.to_string())
    }

    #[test]
    fn test_entry_wire_shape() {
        let ok = CacheEntry::success(json!({"country": "JP"}));
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"result": {"country": "JP"}})
        );
        assert_eq!(serde_json::to_value(CacheEntry::failure()).unwrap(), json!({}));

        let parsed: CacheEntry = serde_json::from_value(json!({})).unwrap();
        assert!(parsed.is_failure());
    }

    #[test]
    fn test_disabled_memoizer_never_reads_or_writes() {
        let memo = Memoizer::new(None, true);
        memo.store_failure(&key("k"));
        assert_eq!(memo.lookup(&key("k")), CacheDecision::Miss);
        assert!(!memo.is_enabled());
    }

    #[test]
    fn test_failure_honored_unless_ignored() {
        let store = Arc::new(MemoryCache::default());
        store.set(&key("k"), CacheEntry::failure());

        let honoring = Memoizer::new(Some(store.clone()), false);
        assert_eq!(honoring.lookup(&key("k")), CacheDecision::HonoredFailure);

        let ignoring = Memoizer::new(Some(store), true);
        assert_eq!(ignoring.lookup(&key("k")), CacheDecision::Miss);
    }

    #[test]
    fn test_success_wins_regardless_of_policy() {
        let store = Arc::new(MemoryCache::default());
        let memo = Memoizer::new(Some(store.clone()), true);
        memo.store_success(&key("k"), json!({"country": "JP"}));
        assert_eq!(
            memo.lookup(&key("k")),
            CacheDecision::Hit(json!({"country": "JP"}))
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_cache_last_write_wins() {
        let store = MemoryCache::default();
        store.set(&key("k"), CacheEntry::failure());
        store.set(&key("k"), CacheEntry::success(json!(1)));
        assert_eq!(store.get(&key("k")), Some(CacheEntry::success(json!(1))));
    }
}
