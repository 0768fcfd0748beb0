//! Content-addressed cache shared by every hook of a build.
//!
//! The cache is a persistent `key → bytes` store. It serves two purposes:
//! memoizing expensive hook computations (rendered HTML, derived text) and
//! recording which documents a previous build completed, for the
//! [skip engine](crate::skip).
//!
//! # Design
//!
//! ## Cache keys
//!
//! Keys are SHA-256 digests of an ordered tuple of inputs. [`make_key`]
//! hashes raw parts; [`KeyBuilder`] is the normal entry point and always
//! starts with a use-site name and a version tag, so changing the logic at
//! one use-site (bump its version) invalidates only that site's entries.
//! Every part is length-prefixed, so `("ab", "c")` and `("a", "bc")` never
//! collide.
//!
//! ## Expiry
//!
//! Each entry records its creation time and an optional expiry. Expired
//! entries behave exactly like absent ones and are dropped on persist.
//!
//! ## Concurrency
//!
//! Entries live in a [`DashMap`], so workers of the load and render pools
//! read and write without a global lock. Two workers writing the same key
//! race and one write wins; the cache is advisory, so that is fine.
//!
//! ## Storage
//!
//! The store is a JSON file at `<cache dir>/store.json` (default
//! `.plinth.cache/`). A missing, unreadable, corrupt or version-mismatched
//! store loads as empty. Deleting the directory only costs build time.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default cache directory, relative to the working directory.
pub const DEFAULT_CACHE_DIR: &str = ".plinth.cache";

/// Name of the store file within the cache directory.
const STORE_FILENAME: &str = "store.json";

/// Version of the store format. Bump this to invalidate all existing
/// caches when the format changes.
const STORE_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How long an entry stays valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Ttl {
    /// The cache's configured default.
    #[default]
    Default,
    Never,
    After(Duration),
}

/// A single stored value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheEntry {
    #[serde(with = "hex_bytes")]
    pub value: Vec<u8>,
    /// Unix seconds.
    pub created_at: i64,
    /// Unix seconds; the entry is a miss from this moment on.
    pub expires_at: Option<i64>,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

/// The build-wide key/value store.
pub struct ContentCache {
    /// `None` for in-memory caches that never persist.
    dir: Option<PathBuf>,
    entries: DashMap<String, CacheEntry>,
    default_ttl: Option<Duration>,
    enabled: bool,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    key_hits: DashMap<String, u64>,
}

impl ContentCache {
    /// Open the store in `dir`. Never fails: any problem reading the store
    /// is logged and yields an empty cache.
    pub fn open(dir: &Path, default_ttl: Option<Duration>) -> Self {
        let mut cache = Self::in_memory(default_ttl);
        cache.dir = Some(dir.to_path_buf());
        match load_store(dir) {
            Ok(Some(entries)) => {
                let now = unix_now();
                for (key, entry) in entries {
                    if !entry.is_expired(now) {
                        cache.entries.insert(key, entry);
                    }
                }
                tracing::debug!(dir = %dir.display(), entries = cache.entries.len(), "cache loaded");
            }
            Ok(None) => {
                tracing::debug!(dir = %dir.display(), "no cache store, starting empty");
            }
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "cache store unreadable, starting empty");
            }
        }
        cache
    }

    /// A cache that lives only for this process.
    pub fn in_memory(default_ttl: Option<Duration>) -> Self {
        Self {
            dir: None,
            entries: DashMap::new(),
            default_ttl,
            enabled: true,
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            key_hits: DashMap::new(),
        }
    }

    /// A cache that misses every lookup and stores nothing.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::in_memory(None)
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Look up a value. Expired entries are misses.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let found = self.enabled.then(|| self.lookup(key)).flatten();
        match found {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                *self.key_hits.entry(key.to_string()).or_insert(0) += 1;
                Some(value)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        let entry = self.entries.get(key)?;
        if entry.is_expired(unix_now()) {
            drop(entry);
            self.entries.remove(key);
            self.dirty.store(true, Ordering::Relaxed);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Store a value.
    pub fn set(&self, key: &str, value: impl Into<Vec<u8>>, ttl: Ttl) {
        if !self.enabled {
            return;
        }
        let now = unix_now();
        let lifetime = match ttl {
            Ttl::Default => self.default_ttl,
            Ttl::Never => None,
            Ttl::After(d) => Some(d),
        };
        let expires_at = lifetime.map(|d| now.saturating_add(d.as_secs() as i64));
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.into(),
                created_at: now,
                expires_at,
            },
        );
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|bytes| String::from_utf8(bytes).ok())
    }

    pub fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Ttl) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, bytes, ttl),
            Err(e) => tracing::warn!(error = %e, "value not cacheable"),
        }
    }

    pub fn remove(&self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.dirty.store(true, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hits and misses recorded since the cache was opened.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Number of hits on one key since the cache was opened.
    pub fn hits_for(&self, key: &str) -> u64 {
        self.key_hits.get(key).map(|n| *n).unwrap_or(0)
    }

    /// Every key hit so far with its count.
    pub fn key_hits(&self) -> BTreeMap<String, u64> {
        self.key_hits
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Write the store to disk if anything changed. Expired entries are
    /// dropped. The file is replaced atomically.
    pub fn persist(&self) -> Result<(), CacheError> {
        let Some(dir) = &self.dir else {
            return Ok(());
        };
        if !self.enabled || !self.dirty.load(Ordering::Relaxed) {
            return Ok(());
        }
        let now = unix_now();
        let entries: BTreeMap<String, CacheEntry> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_string(&StoreFile {
            version: STORE_VERSION,
            entries,
        })?;
        let tmp = dir.join(format!("{STORE_FILENAME}.tmp"));
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, dir.join(STORE_FILENAME))?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }
}

impl fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCache")
            .field("dir", &self.dir)
            .field("entries", &self.entries.len())
            .field("enabled", &self.enabled)
            .finish()
    }
}

fn load_store(dir: &Path) -> Result<Option<BTreeMap<String, CacheEntry>>, CacheError> {
    let path = dir.join(STORE_FILENAME);
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let store: StoreFile = serde_json::from_str(&content)?;
    if store.version != STORE_VERSION {
        tracing::debug!(found = store.version, expected = STORE_VERSION, "cache version changed");
        return Ok(None);
    }
    Ok(Some(store.entries))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Keys
// =============================================================================

/// SHA-256 over length-prefixed parts, as a hex string.
pub fn make_key<P: AsRef<[u8]>>(parts: &[P]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        let bytes = part.as_ref();
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    }
    format!("{:x}", hasher.finalize())
}

/// Typed key construction for one cache use-site.
///
/// ```
/// use plinth::cache::KeyBuilder;
///
/// let key = KeyBuilder::new("render", "1")
///     .str("content-hash")
///     .u64(42)
///     .finish();
/// assert_eq!(key.len(), 64);
/// ```
#[derive(Debug, Clone)]
pub struct KeyBuilder {
    hasher: Sha256,
}

impl KeyBuilder {
    pub fn new(use_site: &str, version: &str) -> Self {
        let builder = Self {
            hasher: Sha256::new(),
        };
        builder.tagged(b's', use_site.as_bytes()).tagged(b'v', version.as_bytes())
    }

    fn tagged(mut self, tag: u8, bytes: &[u8]) -> Self {
        self.hasher.update([tag]);
        self.hasher.update((bytes.len() as u64).to_le_bytes());
        self.hasher.update(bytes);
        self
    }

    pub fn str(self, value: &str) -> Self {
        self.tagged(b'a', value.as_bytes())
    }

    pub fn bytes(self, value: &[u8]) -> Self {
        self.tagged(b'b', value)
    }

    pub fn u64(self, value: u64) -> Self {
        self.tagged(b'n', &value.to_le_bytes())
    }

    /// File modification time, to nanosecond precision.
    pub fn mtime(self, value: SystemTime) -> Self {
        let nanos = value
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        self.tagged(b'm', &nanos.to_le_bytes())
    }

    /// Any serializable value, via its JSON encoding.
    pub fn json<T: Serialize>(self, value: &T) -> Self {
        let encoded = serde_json::to_vec(value).unwrap_or_default();
        self.tagged(b'j', &encoded)
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

// =============================================================================
// Stats
// =============================================================================

/// Summary of cache performance for a build run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn total(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit rate in percent, `0.0` with no lookups.
    pub fn hit_rate(&self) -> f64 {
        if self.total() == 0 {
            0.0
        } else {
            self.hits as f64 * 100.0 / self.total() as f64
        }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.total() == 0 {
            write!(f, "no lookups")
        } else {
            write!(
                f,
                "{} hits, {} misses ({:.1}% hit rate)",
                self.hits,
                self.misses,
                self.hit_rate()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    // =========================================================================
    // get / set
    // =========================================================================

    #[test]
    fn set_then_get_hits() {
        let cache = ContentCache::in_memory(None);
        cache.set("k", "value", Ttl::Default);
        assert_eq!(cache.get("k"), Some(b"value".to_vec()));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 0 });
    }

    #[test]
    fn absent_key_misses() {
        let cache = ContentCache::in_memory(None);
        assert_eq!(cache.get("nope"), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn expired_entry_is_miss() {
        let cache = ContentCache::in_memory(None);
        cache.set("k", "v", Ttl::After(Duration::ZERO));
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn default_ttl_applies() {
        let cache = ContentCache::in_memory(Some(Duration::ZERO));
        cache.set("short", "v", Ttl::Default);
        cache.set("forever", "v", Ttl::Never);
        assert_eq!(cache.get("short"), None);
        assert!(cache.get("forever").is_some());
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = ContentCache::disabled();
        cache.set("k", "v", Ttl::Never);
        assert_eq!(cache.get("k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn json_values_roundtrip() {
        let cache = ContentCache::in_memory(None);
        cache.set_json("k", &vec!["a", "b"], Ttl::Default);
        assert_eq!(
            cache.get_json::<Vec<String>>("k"),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn hits_counted_per_key() {
        let cache = ContentCache::in_memory(None);
        cache.set("a", "1", Ttl::Default);
        cache.get("a");
        cache.get("a");
        cache.get("b");
        assert_eq!(cache.hits_for("a"), 2);
        assert_eq!(cache.hits_for("b"), 0);
        assert_eq!(cache.key_hits(), BTreeMap::from([("a".to_string(), 2)]));
    }

    #[test]
    fn concurrent_writers_do_not_corrupt() {
        let cache = Arc::new(ContentCache::in_memory(None));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("k{}", i % 50);
                        cache.set(&key, format!("{t}:{i}"), Ttl::Default);
                        cache.get(&key);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 50);
        for i in 0..50 {
            let value = cache.get_str(&format!("k{i}")).unwrap();
            assert!(value.contains(':'));
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    #[test]
    fn persist_and_reopen() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join(".plinth.cache");
        let cache = ContentCache::open(&dir, None);
        cache.set("k", vec![0u8, 1, 2, 255], Ttl::Default);
        cache.persist().unwrap();

        let reopened = ContentCache::open(&dir, None);
        assert_eq!(reopened.get("k"), Some(vec![0u8, 1, 2, 255]));
    }

    #[test]
    fn persist_drops_expired_entries() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::open(tmp.path(), None);
        cache.set("gone", "v", Ttl::After(Duration::ZERO));
        cache.set("kept", "v", Ttl::Never);
        cache.persist().unwrap();

        let reopened = ContentCache::open(tmp.path(), None);
        assert_eq!(reopened.len(), 1);
        assert!(reopened.get("kept").is_some());
    }

    #[test]
    fn open_missing_dir_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::open(&tmp.path().join("absent"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn open_corrupt_store_is_empty() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(STORE_FILENAME), "not json").unwrap();
        let cache = ContentCache::open(tmp.path(), None);
        assert!(cache.is_empty());
        assert_eq!(cache.get("anything"), None);
    }

    #[test]
    fn open_wrong_version_is_empty() {
        let tmp = TempDir::new().unwrap();
        let json = format!(
            r#"{{"version": {}, "entries": {{"k": {{"value": "00", "created_at": 0, "expires_at": null}}}}}}"#,
            STORE_VERSION + 1
        );
        fs::write(tmp.path().join(STORE_FILENAME), json).unwrap();
        assert!(ContentCache::open(tmp.path(), None).is_empty());
    }

    #[test]
    fn persist_without_changes_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let cache = ContentCache::open(tmp.path(), None);
        cache.persist().unwrap();
        assert!(!tmp.path().join(STORE_FILENAME).exists());
    }

    // =========================================================================
    // Keys
    // =========================================================================

    #[test]
    fn make_key_is_stable() {
        let a = make_key(&["render", "v1", "hashA"]);
        let b = make_key(&["render", "v1", "hashA"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn make_key_changes_with_any_part() {
        let base = make_key(&["render", "v1", "hashA"]);
        assert_ne!(base, make_key(&["layout", "v1", "hashA"]));
        assert_ne!(base, make_key(&["render", "v2", "hashA"]));
        assert_ne!(base, make_key(&["render", "v1", "hashB"]));
    }

    #[test]
    fn make_key_parts_do_not_run_together() {
        assert_ne!(make_key(&["ab", "c"]), make_key(&["a", "bc"]));
    }

    #[test]
    fn key_builder_separates_use_sites_and_versions() {
        let a = KeyBuilder::new("render", "1").str("x").finish();
        assert_eq!(a, KeyBuilder::new("render", "1").str("x").finish());
        assert_ne!(a, KeyBuilder::new("render", "2").str("x").finish());
        assert_ne!(a, KeyBuilder::new("describe", "1").str("x").finish());
    }

    #[test]
    fn key_builder_types_are_distinct() {
        let as_str = KeyBuilder::new("s", "1").str("1").finish();
        let as_bytes = KeyBuilder::new("s", "1").bytes(b"1").finish();
        assert_ne!(as_str, as_bytes);
    }

    #[test]
    fn key_builder_mtime_and_json() {
        let t = UNIX_EPOCH + Duration::from_secs(100);
        let a = KeyBuilder::new("s", "1").mtime(t).json(&("x", 1)).finish();
        let b = KeyBuilder::new("s", "1")
            .mtime(t + Duration::from_nanos(1))
            .json(&("x", 1))
            .finish();
        assert_ne!(a, b);
    }

    // =========================================================================
    // CacheStats
    // =========================================================================

    #[test]
    fn cache_stats_display_with_lookups() {
        let s = CacheStats { hits: 3, misses: 1 };
        assert_eq!(format!("{}", s), "3 hits, 1 misses (75.0% hit rate)");
    }

    #[test]
    fn cache_stats_display_no_lookups() {
        assert_eq!(format!("{}", CacheStats::default()), "no lookups");
    }
}
