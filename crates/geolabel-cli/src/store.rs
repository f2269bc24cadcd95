//! Persistent cache store: one JSON file, entries stamped with their write
//! time and dropped once older than the TTL.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use geolabel_core::{CacheEntry, CacheKey, CacheStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 48 hours.
pub const DEFAULT_TTL_MS: u64 = 48 * 3600 * 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Stored {
    stored_at: DateTime<Utc>,
    #[serde(flatten)]
    entry: CacheEntry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub successes: usize,
    pub failures: usize,
}

#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    ttl: Duration,
    entries: Mutex<BTreeMap<String, Stored>>,
    dirty: AtomicBool,
}

impl FileCache {
    /// Default location under the user cache directory.
    pub fn default_path() -> PathBuf {
        dirs::cache_dir()
            .map(|d| d.join("geolabel").join("cache.json"))
            .unwrap_or_else(|| PathBuf::from(".geolabel-cache.json"))
    }

    /// Load `path`, dropping expired entries. A missing file is an empty cache.
    pub fn open(path: impl Into<PathBuf>, ttl: Duration) -> anyhow::Result<Self> {
        let path = path.into();
        let mut entries: BTreeMap<String, Stored> = match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => BTreeMap::new(),
            Ok(text) => serde_json::from_str(&text)
                .with_context(|| format!("invalid cache file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read cache file {}", path.display()))
            }
        };

        let before = entries.len();
        let now = Utc::now();
        entries.retain(|_, stored| !expired(stored, now, ttl));
        let evicted = before - entries.len();
        debug!(path = %path.display(), entries = entries.len(), evicted, "cache file loaded");

        Ok(Self {
            path,
            ttl,
            entries: Mutex::new(entries),
            dirty: AtomicBool::new(evicted > 0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.lock();
        let failures = entries.values().filter(|s| s.entry.is_failure()).count();
        CacheStats {
            entries: entries.len(),
            successes: entries.len() - failures,
            failures,
        }
    }

    /// Write back to disk if anything changed. The file is replaced
    /// atomically via a sibling temp file.
    pub fn flush(&self) -> anyhow::Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let text = {
            let entries = self.lock();
            serde_json::to_string_pretty(&*entries).context("serialize cache")?
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, text).with_context(|| format!("cannot write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("cannot replace {}", self.path.display()))?;

        info!(path = %self.path.display(), entries = self.lock().len(), "cache saved");
        Ok(())
    }

    /// Drop every entry and remove the file.
    pub fn clear(&self) -> anyhow::Result<usize> {
        let removed = {
            let mut entries = self.lock();
            let n = entries.len();
            entries.clear();
            n
        };
        self.dirty.store(false, Ordering::SeqCst);
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(removed),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(removed),
            Err(e) => Err(e).with_context(|| format!("cannot remove {}", self.path.display())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Stored>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheStore for FileCache {
    fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entries = self.lock();
        let stored = entries.get(key.as_str())?;
        if expired(stored, Utc::now(), self.ttl) {
            return None;
        }
        Some(stored.entry.clone())
    }

    fn set(&self, key: &CacheKey, entry: CacheEntry) {
        self.lock().insert(
            key.as_str().to_string(),
            Stored {
                stored_at: Utc::now(),
                entry,
            },
        );
        self.dirty.store(true, Ordering::SeqCst);
    }
}

fn expired(stored: &Stored, now: DateTime<Utc>, ttl: Duration) -> bool {
    let age = now.signed_duration_since(stored.stored_at);
    age.to_std().map(|age| age > ttl).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(s: &str) -> CacheKey {
        CacheKey::from(s.to_string())
    }

    #[test]
    fn test_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("cache.json");

        let cache = FileCache::open(&path, Duration::from_secs(60)).unwrap();
        cache.set(&key("a"), CacheEntry::success(json!({"country": "JP"})));
        cache.set(&key("b"), CacheEntry::failure());
        cache.flush().unwrap();

        let reopened = FileCache::open(&path, Duration::from_secs(60)).unwrap();
        assert_eq!(
            reopened.get(&key("a")),
            Some(CacheEntry::success(json!({"country": "JP"})))
        );
        assert_eq!(reopened.get(&key("b")), Some(CacheEntry::failure()));
        assert_eq!(
            reopened.stats(),
            CacheStats {
                entries: 2,
                successes: 1,
                failures: 1
            }
        );
    }

    #[test]
    fn test_expired_entries_evicted_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(
            &path,
            r#"{
  "old": {"stored_at": "2000-01-01T00:00:00Z", "result": {"country": "JP"}},
  "new": {"stored_at": "2999-01-01T00:00:00Z"}
}"#,
        )
        .unwrap();

        let cache = FileCache::open(&path, Duration::from_millis(DEFAULT_TTL_MS)).unwrap();
        assert_eq!(cache.get(&key("old")), None);
        assert_eq!(cache.get(&key("new")), Some(CacheEntry::failure()));
        assert_eq!(cache.stats().entries, 1);
    }

    #[test]
    fn test_entry_file_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = FileCache::open(&path, Duration::from_secs(60)).unwrap();
        cache.set(&key("k"), CacheEntry::failure());
        cache.flush().unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw["k"]["stored_at"].is_string());
        assert!(raw["k"].get("result").is_none());
    }

    #[test]
    fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let cache = FileCache::open(&path, Duration::from_secs(60)).unwrap();
        cache.set(&key("k"), CacheEntry::failure());
        cache.flush().unwrap();

        assert_eq!(cache.clear().unwrap(), 1);
        assert!(!path.exists());
        assert_eq!(cache.clear().unwrap(), 0);
    }
}
