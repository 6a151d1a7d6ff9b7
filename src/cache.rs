// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! TTL + tag + version cache with strict LRU eviction.
//!
//! Values are stored as JSON bytes, zstd-compressed above a size threshold.
//!
//! # Expiry
//!
//! TTL is checked lazily on read: an expired entry is purged and reported as
//! a miss. [`get_stale`](IntelligentCache::get_stale) is the explicit opt-in
//! that ignores TTL, used to serve "stale data as of T" when a live fetch fails.
//!
//! # Eviction
//!
//! Every read and write advances a logical clock; the entry with the oldest
//! tick is evicted first (so ties resolve by insertion order). Eviction runs
//! synchronously on write while the entry count or byte total exceeds its bound.
//!
//! # Invalidation
//!
//! By key, by tag, or by semantic [`CacheEvent`] through an extensible rule
//! table. Rule tags may contain `{address}`, filled from the event.
//!
//! | Event | Rule |
//! |-------|------|
//! | `wallet_reconnected` | everything |
//! | `wallet_disconnected` | `wallet:{address}` |
//! | `collection_changed` | `nft`, `profile` |
//! | `stats_changed` | `stats`, `profile` |
//!
//! # Corruption
//!
//! An entry whose bytes fail to decompress or deserialize is purged and
//! treated as a miss. Reads never panic on stored bytes.

use crate::config::CacheConfig;
use crate::error::{BoxFuture, Result, SyncError};
use crate::metrics;
use crate::resilience::Bulkhead;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Decompress zstd frames, pass anything else through unchanged.
pub fn maybe_decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() >= 4 && data[..4] == ZSTD_MAGIC {
        let mut decoder = zstd::Decoder::new(data)
            .map_err(|e| SyncError::Validation(format!("zstd init: {}", e)))?;
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| SyncError::Validation(format!("zstd decode: {}", e)))?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

/// Per-write options.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Falls back to the configured default TTL.
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
    /// Writes carrying an older version than the live entry are ignored.
    pub version: Option<u64>,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }
}

/// A stored entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub data: Vec<u8>,
    pub created_at: Instant,
    pub stored_at: DateTime<Utc>,
    pub ttl: Duration,
    pub tags: Vec<String>,
    pub version: Option<u64>,
    pub access_count: u64,
    pub compressed: bool,
    tick: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.created_at) >= self.ttl
    }

    fn size(&self) -> usize {
        self.key.len() + self.data.len()
    }

    fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let bytes = if self.compressed {
            if self.data.len() < 4 || self.data[..4] != ZSTD_MAGIC {
                return Err(SyncError::Validation("missing zstd frame".to_string()));
            }
            maybe_decompress(&self.data)?
        } else {
            self.data.clone()
        };
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Result of an explicit stale read.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleRead<T> {
    pub data: T,
    pub stored_at: DateTime<Utc>,
    pub age: Duration,
    pub expired: bool,
}

/// Semantic events that invalidate groups of entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    WalletReconnected,
    WalletDisconnected { address: String },
    CollectionChanged { address: String },
    StatsChanged { address: String },
    Custom { name: String, address: Option<String> },
}

impl CacheEvent {
    pub fn name(&self) -> &str {
        match self {
            Self::WalletReconnected => "wallet_reconnected",
            Self::WalletDisconnected { .. } => "wallet_disconnected",
            Self::CollectionChanged { .. } => "collection_changed",
            Self::StatsChanged { .. } => "stats_changed",
            Self::Custom { name, .. } => name.as_str(),
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            Self::WalletReconnected => None,
            Self::WalletDisconnected { address }
            | Self::CollectionChanged { address }
            | Self::StatsChanged { address } => Some(address),
            Self::Custom { address, .. } => address.as_deref(),
        }
    }
}

/// What an event invalidates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationRule {
    All,
    Tags(Vec<String>),
}

fn default_rules() -> HashMap<String, InvalidationRule> {
    let tags = |t: &[&str]| InvalidationRule::Tags(t.iter().map(|s| s.to_string()).collect());
    HashMap::from([
        ("wallet_reconnected".to_string(), InvalidationRule::All),
        ("wallet_disconnected".to_string(), tags(&["wallet:{address}"])),
        ("collection_changed".to_string(), tags(&["nft", "profile"])),
        ("stats_changed".to_string(), tags(&["stats", "profile"])),
    ])
}

/// Occupancy and hit statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub stale_reads: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub corrupt: u64,
    pub hit_rate: f64,
}

/// One key to preload.
pub struct WarmupEntry<T> {
    pub key: String,
    pub options: CacheOptions,
    pub fetch: BoxFuture<'static, T>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub loaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, CacheEntry>,
    lru: BTreeMap<u64, String>,
    tick: u64,
    bytes: usize,
    hits: u64,
    misses: u64,
    stale_reads: u64,
    evictions: u64,
    expirations: u64,
    corrupt: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn touch(&mut self, key: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(key) {
            self.lru.remove(&entry.tick);
            entry.tick = tick;
            entry.access_count += 1;
            self.lru.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.tick);
        self.bytes = self.bytes.saturating_sub(entry.size());
        Some(entry)
    }

    fn remove_where(&mut self, predicate: impl Fn(&CacheEntry) -> bool) -> usize {
        let keys: Vec<String> = self
            .entries
            .values()
            .filter(|e| predicate(e))
            .map(|e| e.key.clone())
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }
}

enum Lookup<T> {
    Hit(T),
    Missing,
    Expired,
    Corrupt(SyncError),
}

pub struct IntelligentCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    rules: Mutex<HashMap<String, InvalidationRule>>,
}

impl IntelligentCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
            rules: Mutex::new(default_rules()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn publish_size(inner: &Inner) {
        metrics::set_cache_size(inner.entries.len(), inner.bytes);
    }

    /// Fresh value for `key`, or `None` on miss, expiry or corruption.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut inner = self.lock();
        let now = Instant::now();

        let lookup = match inner.entries.get(key) {
            None => Lookup::Missing,
            Some(entry) if entry.is_expired(now) => Lookup::Expired,
            Some(entry) => match entry.decode::<T>() {
                Ok(value) => Lookup::Hit(value),
                Err(e) => Lookup::Corrupt(e),
            },
        };

        let decoded = match lookup {
            Lookup::Hit(value) => Some(value),
            Lookup::Missing => None,
            Lookup::Expired => {
                inner.remove(key);
                inner.expirations += 1;
                metrics::record_cache_eviction("expired", 1);
                debug!(key, "Cache entry expired");
                None
            }
            Lookup::Corrupt(e) => {
                inner.remove(key);
                inner.corrupt += 1;
                metrics::record_cache_eviction("corrupt", 1);
                warn!(key, error = %e, "Discarding unreadable cache entry");
                None
            }
        };

        if decoded.is_some() {
            inner.touch(key);
            inner.hits += 1;
            metrics::record_cache_lookup("hit");
        } else {
            inner.misses += 1;
            metrics::record_cache_lookup("miss");
        }
        decoded
    }

    /// Value for `key` regardless of TTL.
    pub fn get_stale<T: DeserializeOwned>(&self, key: &str) -> Option<StaleRead<T>> {
        let mut inner = self.lock();
        let now = Instant::now();

        let (result, stored_at, age, expired) = {
            let entry = inner.entries.get(key)?;
            (
                entry.decode::<T>(),
                entry.stored_at,
                now.duration_since(entry.created_at),
                entry.is_expired(now),
            )
        };

        match result {
            Ok(data) => {
                inner.stale_reads += 1;
                metrics::record_cache_lookup("stale");
                Some(StaleRead {
                    data,
                    stored_at,
                    age,
                    expired,
                })
            }
            Err(e) => {
                inner.remove(key);
                inner.corrupt += 1;
                metrics::record_cache_eviction("corrupt", 1);
                warn!(key, error = %e, "Discarding unreadable cache entry");
                None
            }
        }
    }

    /// Whether a non-expired entry exists. Does not touch LRU order.
    pub fn contains(&self, key: &str) -> bool {
        let inner = self.lock();
        inner
            .entries
            .get(key)
            .map_or(false, |e| !e.is_expired(Instant::now()))
    }

    /// Serialize and store `value`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: CacheOptions) -> Result<()> {
        let json = serde_json::to_vec(value)?;
        let (data, compressed) = if json.len() > self.config.compression_threshold_bytes {
            match zstd::encode_all(&json[..], self.config.compression_level) {
                Ok(encoded) => (encoded, true),
                Err(e) => {
                    warn!(key, error = %e, "Compression failed, storing uncompressed");
                    (json, false)
                }
            }
        } else {
            (json, false)
        };
        self.set_raw(key, data, compressed, options)
    }

    /// Store pre-encoded bytes (for example a snapshot restored from disk).
    /// Validity is checked on read.
    pub fn set_raw(&self, key: &str, data: Vec<u8>, compressed: bool, options: CacheOptions) -> Result<()> {
        let size = key.len() + data.len();
        if size > self.config.max_bytes {
            return Err(SyncError::Validation(format!(
                "cache entry '{}' is {} bytes, larger than the cache ({} bytes)",
                key, size, self.config.max_bytes
            )));
        }

        let mut inner = self.lock();
        let now = Instant::now();

        if let (Some(new_version), Some(existing)) = (options.version, inner.entries.get(key)) {
            if let Some(current) = existing.version {
                if new_version < current && !existing.is_expired(now) {
                    debug!(key, new_version, current, "Ignoring write with older version");
                    return Ok(());
                }
            }
        }

        inner.remove(key);
        let tick = inner.next_tick();
        let entry = CacheEntry {
            key: key.to_string(),
            data,
            created_at: now,
            stored_at: Utc::now(),
            ttl: options.ttl.unwrap_or_else(|| self.config.default_ttl()),
            tags: options.tags,
            version: options.version,
            access_count: 0,
            compressed,
            tick,
        };
        inner.bytes += entry.size();
        inner.lru.insert(tick, key.to_string());
        inner.entries.insert(key.to_string(), entry);

        let max_entries = self.config.max_entries.max(1);
        let mut evicted = 0;
        while inner.entries.len() > max_entries || inner.bytes > self.config.max_bytes {
            let Some((_, victim)) = inner.lru.pop_first() else {
                break;
            };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.bytes = inner.bytes.saturating_sub(entry.size());
                evicted += 1;
                debug!(key = %victim, "Evicted least recently used cache entry");
            }
        }
        inner.evictions += evicted;
        metrics::record_cache_eviction("lru", evicted as usize);
        Self::publish_size(&inner);
        Ok(())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.lock();
        let removed = inner.remove(key).is_some();
        Self::publish_size(&inner);
        removed
    }

    /// Remove every entry carrying any of `tags`.
    pub fn invalidate_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let wanted: HashSet<&str> = tags.iter().map(|t| t.as_ref()).collect();
        let mut inner = self.lock();
        let removed = inner.remove_where(|e| e.tags.iter().any(|t| wanted.contains(t.as_str())));
        Self::publish_size(&inner);
        if removed > 0 {
            metrics::record_cache_invalidation("tags", removed);
            debug!(removed, tags = ?wanted, "Invalidated cache entries by tag");
        }
        removed
    }

    /// Apply the rule registered for `event`.
    pub fn invalidate_by_event(&self, event: &CacheEvent) -> usize {
        let rule = self
            .rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(event.name())
            .cloned();

        let removed = match rule {
            None => {
                debug!(event = event.name(), "No invalidation rule for cache event");
                0
            }
            Some(InvalidationRule::All) => {
                let mut inner = self.lock();
                let removed = inner.entries.len();
                inner.entries.clear();
                inner.lru.clear();
                inner.bytes = 0;
                Self::publish_size(&inner);
                removed
            }
            Some(InvalidationRule::Tags(tags)) => {
                let resolved: Vec<String> = tags
                    .iter()
                    .filter_map(|tag| {
                        if tag.contains("{address}") {
                            event.address().map(|a| tag.replace("{address}", a))
                        } else {
                            Some(tag.clone())
                        }
                    })
                    .collect();
                self.invalidate_by_tags(&resolved)
            }
        };

        metrics::record_cache_invalidation(event.name(), removed);
        removed
    }

    /// Add or replace the rule for an event name.
    pub fn register_event_rule(&self, event_name: &str, rule: InvalidationRule) {
        self.rules
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(event_name.to_string(), rule);
    }

    /// Preload entries, skipping keys already cached and isolating failures.
    pub async fn warmup_cache<T: Serialize + Send + 'static>(
        &self,
        entries: Vec<WarmupEntry<T>>,
        concurrency: usize,
    ) -> WarmupReport {
        let bulkhead = Arc::new(Bulkhead::new(concurrency));
        let mut report = WarmupReport::default();
        let mut pending = Vec::new();

        for entry in entries {
            if self.contains(&entry.key) {
                report.skipped += 1;
                continue;
            }
            let bulkhead = Arc::clone(&bulkhead);
            pending.push(async move {
                let _permit = bulkhead.acquire().await;
                let result = entry.fetch.await;
                (entry.key, entry.options, result)
            });
        }

        for (key, options, result) in futures::future::join_all(pending).await {
            match result {
                // Another writer may have filled the key while we fetched.
                Ok(_) if self.contains(&key) => report.skipped += 1,
                Ok(value) => match self.set(&key, &value, options) {
                    Ok(()) => report.loaded += 1,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to store warmup entry");
                        report.failed += 1;
                    }
                },
                Err(e) => {
                    warn!(key = %key, error = %e, "Warmup fetch failed");
                    report.failed += 1;
                }
            }
        }

        debug!(loaded = report.loaded, skipped = report.skipped, failed = report.failed, "Cache warmup finished");
        report
    }

    pub fn get_stats(&self) -> CacheStats {
        let inner = self.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            hits: inner.hits,
            misses: inner.misses,
            stale_reads: inner.stale_reads,
            evictions: inner.evictions,
            expirations: inner.expirations,
            corrupt: inner.corrupt,
            hit_rate: if lookups == 0 { 0.0 } else { inner.hits as f64 / lookups as f64 },
        }
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.bytes = 0;
        Self::publish_size(&inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn cache_with(max_entries: usize) -> IntelligentCache {
        IntelligentCache::new(CacheConfig {
            max_entries,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache_with(10);
        cache
            .set("k", &"v", CacheOptions::new().ttl(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(cache.get::<String>("k"), Some("v".to_string()));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.get::<String>("k"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.get_stats().expirations, 1);
    }

    #[test]
    fn test_stale_read_ignores_ttl() {
        let cache = cache_with(10);
        cache
            .set("k", &42u32, CacheOptions::new().ttl(Duration::from_millis(10)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let stale = cache.get_stale::<u32>("k").unwrap();
        assert_eq!(stale.data, 42);
        assert!(stale.expired);
        assert!(stale.age >= Duration::from_millis(10));
    }

    #[test]
    fn test_lru_eviction_respects_recent_reads() {
        let cache = cache_with(3);
        cache.set("a", &1, CacheOptions::new()).unwrap();
        cache.set("b", &2, CacheOptions::new()).unwrap();
        cache.set("c", &3, CacheOptions::new()).unwrap();

        assert_eq!(cache.get::<i32>("a"), Some(1));
        cache.set("d", &4, CacheOptions::new()).unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c") && cache.contains("d"));
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_byte_bound_eviction() {
        let cache = IntelligentCache::new(CacheConfig {
            max_entries: 100,
            max_bytes: 64,
            compression_threshold_bytes: 10_000,
            ..CacheConfig::default()
        });
        cache.set("a", &"x".repeat(20), CacheOptions::new()).unwrap();
        cache.set("b", &"y".repeat(20), CacheOptions::new()).unwrap();
        cache.set("c", &"z".repeat(20), CacheOptions::new()).unwrap();

        let stats = cache.get_stats();
        assert!(stats.bytes <= 64);
        assert!(!cache.contains("a"));
        assert!(cache.contains("c"));

        assert!(cache.set("huge", &"q".repeat(200), CacheOptions::new()).is_err());
    }

    #[test]
    fn test_invalidate_by_tags_only_touches_tagged() {
        let cache = cache_with(10);
        cache.set("p", &1, CacheOptions::new().tags(["profile"])).unwrap();
        cache.set("n", &2, CacheOptions::new().tags(["nft"])).unwrap();
        cache.set("pn", &3, CacheOptions::new().tags(["nft", "profile"])).unwrap();
        cache.set("untagged", &4, CacheOptions::new()).unwrap();

        assert_eq!(cache.invalidate_by_tags(&["profile"]), 2);
        assert!(!cache.contains("p") && !cache.contains("pn"));
        assert!(cache.contains("n") && cache.contains("untagged"));
    }

    #[test]
    fn test_invalidate_by_event_rules() {
        let cache = cache_with(10);
        cache.set("w1", &1, CacheOptions::new().tags(["wallet:0xabc", "profile"])).unwrap();
        cache.set("w2", &2, CacheOptions::new().tags(["wallet:0xdef"])).unwrap();
        cache.set("s", &3, CacheOptions::new().tags(["stats"])).unwrap();

        let removed = cache.invalidate_by_event(&CacheEvent::WalletDisconnected {
            address: "0xabc".to_string(),
        });
        assert_eq!(removed, 1);
        assert!(cache.contains("w2"));

        assert_eq!(
            cache.invalidate_by_event(&CacheEvent::StatsChanged { address: "0xdef".into() }),
            1
        );

        assert_eq!(cache.invalidate_by_event(&CacheEvent::WalletReconnected), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_custom_event_rule() {
        let cache = cache_with(10);
        cache.set("lb", &1, CacheOptions::new().tags(["leaderboard"])).unwrap();

        let event = CacheEvent::Custom {
            name: "week_closed".to_string(),
            address: None,
        };
        assert_eq!(cache.invalidate_by_event(&event), 0);

        cache.register_event_rule("week_closed", InvalidationRule::Tags(vec!["leaderboard".into()]));
        assert_eq!(cache.invalidate_by_event(&event), 1);
    }

    #[test]
    fn test_older_version_is_ignored() {
        let cache = cache_with(10);
        cache.set("k", &"v2", CacheOptions::new().version(2)).unwrap();
        cache.set("k", &"v1", CacheOptions::new().version(1)).unwrap();
        assert_eq!(cache.get::<String>("k"), Some("v2".to_string()));

        cache.set("k", &"v3", CacheOptions::new().version(3)).unwrap();
        assert_eq!(cache.get::<String>("k"), Some("v3".to_string()));
    }

    #[test]
    fn test_large_values_are_compressed() {
        let cache = IntelligentCache::new(CacheConfig {
            compression_threshold_bytes: 64,
            ..CacheConfig::default()
        });
        let big: Vec<String> = (0..200).map(|i| format!("moment-{}", i % 7)).collect();
        cache.set("big", &big, CacheOptions::new()).unwrap();

        assert!(cache.get_stats().bytes < serde_json::to_vec(&big).unwrap().len());
        assert_eq!(cache.get::<Vec<String>>("big"), Some(big));
    }

    #[test]
    fn test_corrupt_compressed_entry_is_a_miss() {
        let cache = cache_with(10);
        cache
            .set_raw("bad", vec![0x28, 0xB5, 0x2F, 0xFD, 0, 1, 2], true, CacheOptions::new())
            .unwrap();
        assert_eq!(cache.get::<Value>("bad"), None);
        assert!(!cache.contains("bad"));
        assert_eq!(cache.get_stats().corrupt, 1);

        cache.set_raw("plain", b"\x00\x01".to_vec(), true, CacheOptions::new()).unwrap();
        assert!(cache.get_stale::<Value>("plain").is_none());
    }

    #[test]
    fn test_type_mismatch_is_a_miss() {
        let cache = cache_with(10);
        cache.set("k", &json!({"a": 1}), CacheOptions::new()).unwrap();
        assert_eq!(cache.get::<u32>("k"), None);
        assert!(!cache.contains("k"));
    }

    #[test]
    fn test_stats_hit_rate() {
        let cache = cache_with(10);
        cache.set("k", &1, CacheOptions::new()).unwrap();
        cache.get::<i32>("k");
        cache.get::<i32>("missing");
        let stats = cache.get_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_warmup_skips_existing_and_isolates_failures() {
        let cache = cache_with(10);
        cache.set("existing", &"keep", CacheOptions::new()).unwrap();

        let entries = vec![
            WarmupEntry {
                key: "existing".to_string(),
                options: CacheOptions::new(),
                fetch: Box::pin(async { Ok("clobbered".to_string()) }),
            },
            WarmupEntry {
                key: "fresh".to_string(),
                options: CacheOptions::new().tags(["nft"]),
                fetch: Box::pin(async { Ok("loaded".to_string()) }),
            },
            WarmupEntry {
                key: "broken".to_string(),
                options: CacheOptions::new(),
                fetch: Box::pin(async { Err(SyncError::server("warmup", "500")) }),
            },
        ];

        let report = cache.warmup_cache(entries, 2).await;
        assert_eq!(
            report,
            WarmupReport {
                loaded: 1,
                skipped: 1,
                failed: 1
            }
        );
        assert_eq!(cache.get::<String>("existing"), Some("keep".to_string()));
        assert_eq!(cache.get::<String>("fresh"), Some("loaded".to_string()));
        assert!(!cache.contains("broken"));
    }

    #[test]
    fn test_maybe_decompress_passthrough() {
        assert_eq!(maybe_decompress(b"plain").unwrap(), b"plain".to_vec());
        let compressed = zstd::encode_all(&b"hello"[..], 3).unwrap();
        assert_eq!(maybe_decompress(&compressed).unwrap(), b"hello".to_vec());
        assert!(maybe_decompress(&[0x28, 0xB5, 0x2F, 0xFD, 0xFF]).is_err());
    }
}
