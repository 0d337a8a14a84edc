//! Artifact cache keyed by task fingerprint.
//!
//! The cache is the only state shared between concurrent stage agents. It
//! stores validated artifacts together with the summary of the execution that
//! proved them, and it owns the per-fingerprint production guard that keeps
//! artifact production at-most-once.
//!
//! # Expiry
//!
//! Entries expire when they have not been used for the configured TTL
//! (default 15 minutes). Capacity overflow evicts the least recently used
//! entry.
//!
//! # Usage
//!
//! ```ignore
//! use sciforge::cache::{ArtifactCache, CacheConfig};
//!
//! let cache = ArtifactCache::new(CacheConfig::default());
//! if cache.lookup(&fingerprint).await.is_none() {
//!     let _guard = cache.acquire_production(&fingerprint).await;
//!     if cache.recheck(&fingerprint).await.is_none() {
//!         // produce, validate, execute...
//!         cache.insert(fingerprint.clone(), artifact, result).await;
//!     }
//! }
//! ```

pub mod clock;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

pub use clock::{Clock, ManualClock, SystemClock};

use crate::artifact::Artifact;
use crate::data::SharedBlobStore;
use crate::task::{ExecutionResult, Fingerprint};
use clock::elapsed_between;

/// Default time-to-live measured from last use.
pub const DEFAULT_TTL: Duration = Duration::from_secs(900);

/// Configuration for the artifact cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held in memory.
    pub max_entries: usize,
    /// Entries unused for this long are dropped.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Key prefix used when persisting entries to a blob store.
    pub persist_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            ttl: DEFAULT_TTL,
            persist_prefix: "cache".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Serde helper storing durations as whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Serde helper storing durations as milliseconds.
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// A cached artifact and the result that validated it.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub artifact: Arc<Artifact>,
    pub result: ExecutionResult,
    pub hit_count: u64,
    pub inserted_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// On-disk form of a [`CacheEntry`].
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    fingerprint: Fingerprint,
    artifact: Artifact,
    result: ExecutionResult,
    hit_count: u64,
    inserted_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

impl From<&CacheEntry> for PersistedEntry {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            fingerprint: entry.fingerprint.clone(),
            artifact: (*entry.artifact).clone(),
            result: entry.result.clone(),
            hit_count: entry.hit_count,
            inserted_at: entry.inserted_at,
            last_used: entry.last_used,
        }
    }
}

impl From<PersistedEntry> for CacheEntry {
    fn from(p: PersistedEntry) -> Self {
        Self {
            fingerprint: p.fingerprint,
            artifact: Arc::new(p.artifact),
            result: p.result,
            hit_count: p.hit_count,
            inserted_at: p.inserted_at,
            last_used: p.last_used,
        }
    }
}

/// Cache statistics for monitoring and debugging.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    /// Entries removed to make room.
    pub evictions: u64,
    /// Entries removed because their TTL elapsed.
    pub expirations: u64,
    /// Production requests that had to wait behind another producer.
    pub joins: u64,
}

impl CacheStats {
    /// Hit rate between 0.0 and 1.0, or 0.0 if no lookups happened.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Per-fingerprint production slot. The protected value is the failure
/// published by the last holder, if its production failed.
type Slot = Arc<tokio::sync::Mutex<Option<Vec<String>>>>;

type InFlight = Arc<Mutex<HashMap<Fingerprint, Slot>>>;

/// Exclusive right to produce the artifact for one fingerprint.
///
/// Holders should re-check the cache after acquiring: a previous holder may
/// already have inserted the entry, or published why it could not. The slot
/// and any published failure live only while some caller holds or waits for
/// it, so a later, unrelated request starts fresh.
pub struct ProductionGuard {
    fingerprint: Fingerprint,
    in_flight: InFlight,
    lock: Option<OwnedMutexGuard<Option<Vec<String>>>>,
}

impl ProductionGuard {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Failure reasons published by an earlier holder this caller queued behind.
    pub fn published_failure(&self) -> Option<&[String]> {
        self.lock.as_ref().and_then(|slot| slot.as_deref())
    }

    /// Hand a failed production's reasons to every caller still queued.
    pub fn publish_failure(&mut self, reasons: Vec<String>) {
        if let Some(slot) = self.lock.as_mut() {
            **slot = Some(reasons);
        }
    }
}

impl Drop for ProductionGuard {
    fn drop(&mut self) {
        let lock = self.lock.take();
        let mut map = self.in_flight.lock().expect("in-flight lock poisoned");
        if let Some(mutex) = map.get(&self.fingerprint) {
            // One reference in the map, one in our guard: nobody is waiting.
            if Arc::strong_count(mutex) <= 2 {
                map.remove(&self.fingerprint);
            }
        }
        drop(lock);
    }
}

/// Fingerprint-keyed store of validated artifacts.
pub struct ArtifactCache {
    entries: RwLock<HashMap<Fingerprint, CacheEntry>>,
    in_flight: InFlight,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    stats: RwLock<CacheStats>,
    store: Option<SharedBlobStore>,
}

impl ArtifactCache {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock,
            stats: RwLock::new(CacheStats::default()),
            store: None,
        }
    }

    /// Write entries through to `store` and rehydrate from it on local misses.
    pub fn with_store(mut self, store: SharedBlobStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn is_expired(&self, last_used: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        elapsed_between(last_used, now) >= self.config.ttl
    }

    fn persist_key(&self, fingerprint: &Fingerprint) -> String {
        format!("{}/{}", self.config.persist_prefix, fingerprint)
    }

    /// Look up a fingerprint. A miss is `None`, never an error.
    ///
    /// A hit refreshes the entry's last-use time and hit count.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.lookup_counted(fingerprint, true).await
    }

    /// Second lookup made after [`acquire_production`](Self::acquire_production).
    ///
    /// The caller's first lookup already counted the miss, so a miss here is
    /// not counted again; a hit counts as usual.
    pub async fn recheck(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.lookup_counted(fingerprint, false).await
    }

    async fn lookup_counted(&self, fingerprint: &Fingerprint, count_miss: bool) -> Option<CacheEntry> {
        let now = self.clock.now();
        let mut expired = false;
        {
            let mut entries = self.entries.write().expect("cache write lock poisoned");
            if let Some(entry) = entries.get_mut(fingerprint) {
                if self.is_expired(entry.last_used, now) {
                    entries.remove(fingerprint);
                    expired = true;
                } else {
                    entry.hit_count += 1;
                    entry.last_used = now;
                    let hit = entry.clone();
                    self.stats.write().expect("stats write lock poisoned").hits += 1;
                    return Some(hit);
                }
            }
        }

        if expired {
            self.stats
                .write()
                .expect("stats write lock poisoned")
                .expirations += 1;
            debug!(fingerprint = %fingerprint.short(), "Cache entry expired");
            self.delete_persisted(fingerprint).await;
        } else if let Some(entry) = self.rehydrate(fingerprint, now).await {
            self.stats.write().expect("stats write lock poisoned").hits += 1;
            return Some(entry);
        }

        if count_miss {
            self.stats.write().expect("stats write lock poisoned").misses += 1;
        }
        None
    }

    /// Insert the artifact that produced `result` for `fingerprint`.
    ///
    /// Idempotent: if a live entry already exists its artifact and result are
    /// kept, and the insert counts as a use of it (last-use time and hit
    /// count both advance). That original entry is returned.
    pub async fn insert(
        &self,
        fingerprint: Fingerprint,
        artifact: Artifact,
        result: ExecutionResult,
    ) -> CacheEntry {
        let now = self.clock.now();
        let entry = {
            let mut entries = self.entries.write().expect("cache write lock poisoned");
            if let Some(existing) = entries.get_mut(&fingerprint) {
                if !self.is_expired(existing.last_used, now) {
                    existing.last_used = now;
                    existing.hit_count += 1;
                    return existing.clone();
                }
            }

            if !entries.contains_key(&fingerprint) && entries.len() >= self.config.max_entries {
                self.evict_lru(&mut entries);
            }

            let entry = CacheEntry {
                fingerprint: fingerprint.clone(),
                artifact: Arc::new(artifact),
                result,
                hit_count: 0,
                inserted_at: now,
                last_used: now,
            };
            entries.insert(fingerprint.clone(), entry.clone());
            entry
        };
        self.stats.write().expect("stats write lock poisoned").inserts += 1;
        debug!(fingerprint = %fingerprint.short(), source = %entry.artifact.source, "Cached artifact");

        self.persist(&entry).await;
        entry
    }

    /// Drop the entry for `fingerprint`. Returns whether one was present.
    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> bool {
        let removed = self
            .entries
            .write()
            .expect("cache write lock poisoned")
            .remove(fingerprint)
            .is_some();
        self.delete_persisted(fingerprint).await;
        if removed {
            debug!(fingerprint = %fingerprint.short(), "Invalidated cache entry");
        }
        removed
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().expect("cache write lock poisoned");
        let before = entries.len();
        entries.retain(|_, e| !self.is_expired(e.last_used, now));
        let removed = before - entries.len();
        if removed > 0 {
            self.stats
                .write()
                .expect("stats write lock poisoned")
                .expirations += removed as u64;
        }
        removed
    }

    /// Wait for exclusive production rights on `fingerprint`.
    ///
    /// Concurrent callers for the same fingerprint queue behind the current
    /// holder; each should re-check the cache once it gets the guard.
    pub async fn acquire_production(&self, fingerprint: &Fingerprint) -> ProductionGuard {
        let mutex = {
            let mut map = self.in_flight.lock().expect("in-flight lock poisoned");
            match map.get(fingerprint) {
                Some(existing) => {
                    self.stats.write().expect("stats write lock poisoned").joins += 1;
                    existing.clone()
                }
                None => {
                    let fresh: Slot = Arc::new(tokio::sync::Mutex::new(None));
                    map.insert(fingerprint.clone(), fresh.clone());
                    fresh
                }
            }
        };
        let lock = mutex.lock_owned().await;
        ProductionGuard {
            fingerprint: fingerprint.clone(),
            in_flight: self.in_flight.clone(),
            lock: Some(lock),
        }
    }

    /// Number of fingerprints with an active or queued producer.
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.read().expect("stats read lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache read lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all in-memory entries. Persisted copies are left alone.
    pub fn clear(&self) {
        self.entries.write().expect("cache write lock poisoned").clear();
    }

    fn evict_lru(&self, entries: &mut HashMap<Fingerprint, CacheEntry>) {
        let oldest = entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(fp, _)| fp.clone());
        if let Some(fp) = oldest {
            entries.remove(&fp);
            self.stats.write().expect("stats write lock poisoned").evictions += 1;
        }
    }

    async fn persist(&self, entry: &CacheEntry) {
        let Some(store) = &self.store else {
            return;
        };
        let record = PersistedEntry::from(entry);
        let blob = match serde_json::to_vec(&record) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = store.put(&self.persist_key(&entry.fingerprint), blob).await {
            warn!(fingerprint = %entry.fingerprint.short(), error = %e, "Cache write-through failed");
        }
    }

    async fn delete_persisted(&self, fingerprint: &Fingerprint) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.delete(&self.persist_key(fingerprint)).await {
            warn!(fingerprint = %fingerprint.short(), error = %e, "Failed to delete persisted cache entry");
        }
    }

    /// Load a persisted entry into memory if it is still live.
    async fn rehydrate(&self, fingerprint: &Fingerprint, now: DateTime<Utc>) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        let blob = match store.get(&self.persist_key(fingerprint)).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "Cache store read failed");
                return None;
            }
        };
        let record: PersistedEntry = match serde_json::from_slice(&blob) {
            Ok(r) => r,
            Err(e) => {
                warn!(fingerprint = %fingerprint.short(), error = %e, "Discarding corrupt cache record");
                self.delete_persisted(fingerprint).await;
                return None;
            }
        };
        if self.is_expired(record.last_used, now) {
            self.delete_persisted(fingerprint).await;
            return None;
        }

        let mut entry = CacheEntry::from(record);
        entry.hit_count += 1;
        entry.last_used = now;
        {
            let mut entries = self.entries.write().expect("cache write lock poisoned");
            if entries.len() >= self.config.max_entries {
                self.evict_lru(&mut entries);
            }
            entries.insert(fingerprint.clone(), entry.clone());
        }
        debug!(fingerprint = %fingerprint.short(), "Rehydrated cache entry from store");
        Some(entry)
    }
}
