//! Three-tier result cache.
//!
//! Tiers are probed fastest first. A hit in a slower tier is copied into
//! every faster tier before it is returned, whatever priority it was written
//! with. Writes reach the tiers selected by their [`Priority`] and remove any
//! older copy from the tiers they skip, so a `get` straight after a
//! successful `set` always sees the new value.
//!
//! Mutations of one key are serialised by a striped async lock; different
//! keys proceed concurrently.
//!
//! Stored payloads carry their entry metadata, so [`MultiTierCache::open`]
//! over an existing store picks up where an earlier process left off.
//! Recency after a restart follows write time.

pub mod entry;
pub mod key;
pub mod store;
mod tier;

pub use entry::{EntryMeta, Priority, SetOptions, TierId};
pub use key::{archive_tag, derive_key};
pub use store::{BackingStore, DirStore, MemoryStore, StoreError};
pub use tier::TierStats;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use ppt_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::memory::{BufferPool, PressureListener, PressureReading};
use tier::{frame, payload_address, unframe, Lookup, RemovalReason, Removed, SlotHeader, Tier};

/// Share of each tier dropped when memory pressure is sustained.
const PRESSURE_SHRINK: f64 = 0.25;

/// Aggregate and per-tier counters. `hits`/`misses` count `get` calls;
/// the per-tier figures count probes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub tiers: Vec<TierStats>,
}

impl CacheStats {
    pub fn entry_count(&self) -> usize {
        self.tiers.iter().map(|t| t.entry_count).sum()
    }

    pub fn bytes(&self) -> u64 {
        self.tiers.iter().map(|t| t.bytes).sum()
    }

    pub fn evictions(&self) -> u64 {
        self.tiers.iter().map(|t| t.evictions).sum()
    }

    pub fn tier(&self, id: TierId) -> Option<&TierStats> {
        self.tiers.iter().find(|t| t.tier == id)
    }
}

pub struct MultiTierCache<T> {
    tiers: [Tier<T>; 3],
    stripes: Vec<Mutex<()>>,
    clock: Arc<dyn Clock>,
    buffers: BufferPool,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<T> MultiTierCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// A cache whose fast tier lives in memory and whose slower tiers
    /// persist through the given stores.
    pub fn new(config: CacheConfig, mid: Arc<dyn BackingStore>, durable: Arc<dyn BackingStore>) -> Self {
        let [fast, mid_limits, durable_limits] = config.tiers();
        let stripes = (0..config.lock_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            tiers: [
                Tier::in_memory(TierId::Fast, fast),
                Tier::backed(TierId::Mid, mid_limits, mid),
                Tier::backed(TierId::Durable, durable_limits, durable),
            ],
            stripes,
            clock: Arc::new(SystemClock),
            buffers: BufferPool::new(16, 4 * 1024, 1024 * 1024),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// [`Self::new`] followed by [`Self::restore`].
    pub async fn open(config: CacheConfig, mid: Arc<dyn BackingStore>, durable: Arc<dyn BackingStore>) -> Result<Self> {
        let cache = Self::new(config, mid, durable);
        let restored = cache.restore().await?;
        log::debug!("cache opened with {} persisted entries", restored);
        Ok(cache)
    }

    /// Rebuild the index of every backed tier from its store. Expired,
    /// superseded and unreadable payloads are deleted, and entries beyond the
    /// tier limits are evicted oldest first. Returns the entries indexed.
    pub async fn restore(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut restored = 0;
        for tier in &self.tiers {
            let Some(store) = &tier.store else { continue };
            restored += self.restore_tier(tier, store.as_ref(), now).await?;
        }
        Ok(restored)
    }

    async fn restore_tier(&self, tier: &Tier<T>, store: &dyn BackingStore, now: DateTime<Utc>) -> Result<usize> {
        let mut latest: HashMap<String, SlotHeader> = HashMap::new();
        let mut stale = Vec::new();

        for address in store.keys().await? {
            let Some(bytes) = store.get(&address).await? else { continue };
            let header = unframe(&bytes)
                .map(|(header, _)| header)
                .filter(|h| payload_address(&h.meta.key, h.generation) == address);
            let Some(header) = header else {
                log::warn!("dropping unreadable cache payload '{}' from {} tier", address, tier.id.name());
                stale.push(address);
                continue;
            };
            tier.observe_generation(header.generation);
            if header.meta.is_expired(now) {
                stale.push(address);
                continue;
            }
            let superseded = latest
                .get(&header.meta.key)
                .is_some_and(|current| current.generation > header.generation);
            if superseded {
                stale.push(address);
            } else if let Some(older) = latest.insert(header.meta.key.clone(), header) {
                stale.push(payload_address(&older.meta.key, older.generation));
            }
        }

        let mut headers: Vec<SlotHeader> = latest.into_values().collect();
        headers.sort_by(|a, b| {
            a.meta
                .last_accessed
                .cmp(&b.meta.last_accessed)
                .then(a.generation.cmp(&b.generation))
        });
        for header in headers {
            let address = payload_address(&header.meta.key, header.generation);
            match tier.insert(header.meta, None, header.generation, now) {
                Some(mut displaced) => {
                    displaced.retain(|r| r.address != address);
                    self.discard(tier, displaced).await;
                }
                None => stale.push(address),
            }
        }

        let dropped = stale.len();
        for address in stale {
            if let Err(e) = store.delete(&address).await {
                log::warn!("failed to delete stale cache payload '{}': {}", address, e);
            }
        }
        let indexed = tier.stats(now).entry_count;
        log::debug!(
            "restored {} entries into {} tier from {} store, {} stale payloads dropped",
            indexed,
            tier.id.name(),
            store.name(),
            dropped
        );
        Ok(indexed)
    }

    /// All tiers in process memory.
    pub fn in_memory(config: CacheConfig) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()), Arc::new(MemoryStore::new()))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Serialise payloads through a shared buffer pool.
    pub fn with_buffers(mut self, buffers: BufferPool) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    async fn lock_key(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[stripe].lock().await
    }

    fn encode(&self, value: &T) -> Result<Bytes> {
        let mut buffer = self.buffers.acquire();
        serde_json::to_writer(&mut *buffer, value)?;
        Ok(Bytes::copy_from_slice(&buffer))
    }

    /// Look `key` up, promoting a slower-tier hit into the faster tiers.
    pub async fn get(&self, key: &str) -> Option<Arc<T>> {
        let _guard = self.lock_key(key).await;
        let now = self.clock.now();

        for (level, tier) in self.tiers.iter().enumerate() {
            let found = match tier.lookup(key, now) {
                Lookup::Miss => None,
                Lookup::Expired(removed) => {
                    log::debug!("cache entry '{}' expired in {} tier", key, tier.id.name());
                    self.discard(tier, vec![removed]).await;
                    None
                }
                Lookup::Hit { meta, address, value } => match value {
                    Some(value) => Some((meta, value, None)),
                    None => self
                        .load(tier, key, &address)
                        .await
                        .map(|(value, bytes)| (meta, value, Some(bytes))),
                },
            };

            let Some((meta, value, bytes)) = found else {
                tier.record_miss();
                continue;
            };
            tier.record_hit();
            self.hits.fetch_add(1, Ordering::Relaxed);
            for slower in &self.tiers[level + 1..] {
                slower.touch(key, now);
            }
            if level > 0 {
                self.promote(level, meta, &value, bytes, now).await;
            }
            return Some(value);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Read and decode a payload, returning it without its frame. A payload
    /// that is missing or undecodable drops the slot and counts as a miss.
    async fn load(&self, tier: &Tier<T>, key: &str, address: &str) -> Option<(Arc<T>, Bytes)> {
        let store = tier.store.as_ref()?;
        let bytes = match store.get(address).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                log::warn!("cache payload for '{}' missing from {} tier", key, tier.id.name());
                tier.forget(key, address);
                return None;
            }
            Err(e) => {
                log::warn!("cache read from {} tier failed: {}", tier.id.name(), e);
                return None;
            }
        };
        let decoded = match unframe(&bytes) {
            Some((_, payload)) => serde_json::from_slice::<T>(&payload)
                .map(|value| (Arc::new(value), payload))
                .map_err(|e| e.to_string()),
            None => Err("missing entry header".to_string()),
        };
        match decoded {
            Ok(found) => Some(found),
            Err(e) => {
                log::warn!("dropping undecodable cache payload for '{}': {}", key, e);
                if let Some(removed) = tier.forget(key, address) {
                    self.discard(tier, vec![removed]).await;
                }
                None
            }
        }
    }

    async fn promote(&self, level: usize, meta: EntryMeta, value: &Arc<T>, bytes: Option<Bytes>, now: DateTime<Utc>) {
        let bytes = match bytes {
            Some(bytes) => bytes,
            None => match self.encode(value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("cannot promote '{}': {}", meta.key, e);
                    return;
                }
            },
        };
        for tier in &self.tiers[..level] {
            if let Err(e) = self.write_tier(tier, meta.clone(), value, &bytes, now).await {
                log::warn!("promotion of '{}' into {} tier failed: {}", meta.key, tier.id.name(), e);
            }
        }
    }

    /// Write one copy into `tier`. `Ok(false)` when the tier can never hold
    /// it; any older copy is removed in that case.
    async fn write_tier(
        &self,
        tier: &Tier<T>,
        meta: EntryMeta,
        value: &Arc<T>,
        bytes: &Bytes,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let key = meta.key.clone();
        if !tier.accepts(meta.byte_size) {
            self.drop_copy(tier, &key).await;
            return Ok(false);
        }

        let generation = tier.next_generation();
        let address = payload_address(&key, generation);
        let resident = match &tier.store {
            Some(store) => {
                let framed = frame(&meta, generation, bytes)?;
                if let Err(e) = store.set(&address, framed).await {
                    self.drop_copy(tier, &key).await;
                    return Err(e.into());
                }
                None
            }
            None => Some(Arc::clone(value)),
        };

        match tier.insert(meta, resident, generation, now) {
            Some(displaced) => {
                self.discard(tier, displaced).await;
                Ok(true)
            }
            None => {
                self.discard(
                    tier,
                    vec![Removed {
                        key: key.clone(),
                        address,
                        reason: RemovalReason::Deleted,
                    }],
                )
                .await;
                self.drop_copy(tier, &key).await;
                Ok(false)
            }
        }
    }

    async fn drop_copy(&self, tier: &Tier<T>, key: &str) {
        if let Some(removed) = tier.remove(key) {
            self.discard(tier, vec![removed]).await;
        }
    }

    /// Delete the payloads of slots that left `tier`'s index.
    async fn discard(&self, tier: &Tier<T>, removed: Vec<Removed>) {
        let evicted = removed.iter().filter(|r| r.reason == RemovalReason::Evicted).count();
        if evicted > 0 {
            log::debug!("evicted {} entries from {} tier", evicted, tier.id.name());
        }
        let Some(store) = &tier.store else { return };
        for r in removed {
            if let Err(e) = store.delete(&r.address).await {
                log::warn!("failed to delete cache payload for '{}': {}", r.key, e);
            }
        }
    }

    /// Store `value` under `key` in the tiers chosen by `options.priority`.
    /// Fails only when no target tier accepted the entry.
    pub async fn set(&self, key: &str, value: T, options: SetOptions) -> Result<()> {
        let bytes = self.encode(&value)?;
        let _guard = self.lock_key(key).await;
        let now = self.clock.now();
        let first = options.priority.first_tier();

        let meta = EntryMeta {
            key: key.to_string(),
            byte_size: bytes.len() as u64,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl_ms: options
                .ttl
                .or_else(|| self.config.default_ttl())
                .map(|ttl| ttl.as_millis() as u64),
            tags: options.tags,
            origin: first,
        };
        let value = Arc::new(value);

        for tier in &self.tiers[..first.level()] {
            self.drop_copy(tier, key).await;
        }

        let mut written = 0;
        let mut last_error = None;
        for tier in &self.tiers[first.level()..] {
            match self.write_tier(tier, meta.clone(), &value, &bytes, now).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    log::warn!("cache write to {} tier failed: {}", tier.id.name(), e);
                    last_error = Some(e);
                }
            }
        }

        if written == 0 {
            return Err(last_error.unwrap_or_else(|| {
                Error::CacheError(format!(
                    "entry '{}' ({} bytes) fits no tier from {} down",
                    key,
                    bytes.len(),
                    first.name()
                ))
            }));
        }
        log::debug!("cached '{}' in {} tiers", key, written);
        Ok(())
    }

    /// Remove `key` from every tier.
    pub async fn delete(&self, key: &str) -> bool {
        let _guard = self.lock_key(key).await;
        let mut found = false;
        for tier in &self.tiers {
            if let Some(removed) = tier.remove(key) {
                found = true;
                self.discard(tier, vec![removed]).await;
            }
        }
        found
    }

    /// Remove every entry whose tags intersect `tags`. Returns the number of
    /// distinct keys removed.
    pub async fn delete_by_tags<S: AsRef<str>>(&self, tags: &[S]) -> usize {
        let keys: BTreeSet<String> = self.tiers.iter().flat_map(|t| t.keys_tagged(tags)).collect();
        let mut count = 0;
        for key in keys {
            let _guard = self.lock_key(&key).await;
            let mut found = false;
            for tier in &self.tiers {
                if let Some(removed) = tier.remove_tagged(&key, tags) {
                    found = true;
                    self.discard(tier, vec![removed]).await;
                }
            }
            if found {
                count += 1;
            }
        }
        count
    }

    /// Empty every tier and its backing store.
    pub async fn clear(&self) -> Result<()> {
        for tier in &self.tiers {
            tier.clear();
            if let Some(store) = &tier.store {
                store.clear().await?;
            }
        }
        Ok(())
    }

    /// Whether any tier holds a live entry for `key`. Does not count as an
    /// access.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.tiers.iter().any(|t| t.contains(key, now))
    }

    /// Keys held by `tier`, least recently used first.
    pub fn tier_keys(&self, tier: TierId) -> Vec<String> {
        self.tiers[tier.level()].keys_by_recency()
    }

    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            tiers: self.tiers.iter().map(|t| t.stats(now)).collect(),
        }
    }

    /// Evict the least recently used `fraction` of every tier.
    pub async fn shrink(&self, fraction: f64) -> usize {
        let mut total = 0;
        for tier in &self.tiers {
            let removed = tier.evict_fraction(fraction);
            total += removed.len();
            self.discard(tier, removed).await;
        }
        total
    }

    /// Remove up to one slice of expired entries from each tier.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut total = 0;
        for tier in &self.tiers {
            let removed = tier.purge_expired(now, self.config.sweep_slice.max(1));
            total += removed.len();
            self.discard(tier, removed).await;
        }
        if total > 0 {
            log::debug!("cache sweep removed {} expired entries", total);
        }
        total
    }

    /// Sweep on the configured interval until `shutdown` flips to true.
    pub fn spawn_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let every = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.sweep().await;
                    }
                }
            }
            log::debug!("cache sweeper stopped");
        })
    }
}

#[async_trait]
impl<T> PressureListener for MultiTierCache<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn on_pressure(&self, reading: &PressureReading) {
        let evicted = self.shrink(PRESSURE_SHRINK).await;
        log::debug!(
            "cache shrank by {} entries at {:.1}% memory usage",
            evicted,
            reading.sample.usage_ratio() * 100.0
        );
    }
}

impl<T> fmt::Debug for MultiTierCache<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiTierCache")
            .field("config", &self.config)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::TierConfig;
    use crate::memory::{HeapSample, Trend};
    use proptest::prelude::*;
    use std::time::Duration;

    fn config() -> CacheConfig {
        CacheConfig::default().with_default_ttl(None)
    }

    struct Fixture {
        cache: MultiTierCache<String>,
        clock: Arc<ManualClock>,
        mid: Arc<MemoryStore>,
        durable: Arc<MemoryStore>,
    }

    fn fixture(config: CacheConfig) -> Fixture {
        let clock = Arc::new(ManualClock::starting_now());
        let mid = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryStore::new());
        let cache = MultiTierCache::new(config, mid.clone(), durable.clone()).with_clock(clock.clone());
        Fixture {
            cache,
            clock,
            mid,
            durable,
        }
    }

    fn value(s: &str) -> Option<String> {
        Some(s.to_string())
    }

    #[tokio::test]
    async fn test_get_after_set_for_every_priority() {
        let f = fixture(config());
        for (i, priority) in [Priority::High, Priority::Medium, Priority::Low].into_iter().enumerate() {
            let key = format!("k{}", i);
            f.cache
                .set(&key, format!("v{}", i), SetOptions::new().with_priority(priority))
                .await
                .unwrap();
            assert_eq!(f.cache.get(&key).await.as_deref().cloned(), Some(format!("v{}", i)));
        }
        assert!(f.cache.get("absent").await.is_none());
    }

    #[tokio::test]
    async fn test_priority_selects_tiers() {
        let f = fixture(config());
        f.cache
            .set("low", "x".into(), SetOptions::new().with_priority(Priority::Low))
            .await
            .unwrap();
        assert!(f.cache.tier_keys(TierId::Fast).is_empty());
        assert!(f.cache.tier_keys(TierId::Mid).is_empty());
        assert_eq!(f.cache.tier_keys(TierId::Durable), vec!["low"]);
        assert!(f.mid.is_empty());
        assert_eq!(f.durable.len(), 1);

        f.cache.set("med", "y".into(), SetOptions::new()).await.unwrap();
        assert_eq!(f.cache.tier_keys(TierId::Mid), vec!["med"]);
        assert!(f.cache.tier_keys(TierId::Fast).is_empty());
    }

    #[tokio::test]
    async fn test_read_promotes_into_faster_tiers() {
        let f = fixture(config());
        f.cache
            .set("doc", "payload".into(), SetOptions::new().with_priority(Priority::Low))
            .await
            .unwrap();

        assert_eq!(f.cache.get("doc").await.as_deref().cloned(), value("payload"));
        for tier in TierId::ALL {
            assert_eq!(f.cache.tier_keys(tier), vec!["doc"]);
        }
        assert_eq!(f.mid.len(), 1);

        let stats = f.cache.stats();
        assert_eq!(stats.tier(TierId::Durable).unwrap().hits, 1);
        assert_eq!(stats.tier(TierId::Fast).unwrap().misses, 1);

        f.cache.get("doc").await;
        assert_eq!(f.cache.stats().tier(TierId::Fast).unwrap().hits, 1);
        assert_eq!(f.cache.stats().hit_rate, 1.0);
    }

    #[tokio::test]
    async fn test_lower_priority_rewrite_hides_old_copy() {
        let f = fixture(config());
        f.cache
            .set("k", "old".into(), SetOptions::new().with_priority(Priority::High))
            .await
            .unwrap();
        f.cache
            .set("k", "new".into(), SetOptions::new().with_priority(Priority::Low))
            .await
            .unwrap();
        assert!(f.cache.tier_keys(TierId::Fast).is_empty());
        assert_eq!(f.cache.get("k").await.as_deref().cloned(), value("new"));
        assert_eq!(f.durable.len(), 1);
        assert_eq!(f.mid.len(), 1);
    }

    #[tokio::test]
    async fn test_ttl_expiry_is_a_miss_and_frees_occupancy() {
        let f = fixture(config());
        f.cache
            .set(
                "short",
                "v".into(),
                SetOptions::new().with_ttl(Duration::from_secs(1)).with_priority(Priority::High),
            )
            .await
            .unwrap();
        f.cache
            .set("long", "w".into(), SetOptions::new().with_priority(Priority::High))
            .await
            .unwrap();

        f.clock.advance(Duration::from_millis(1000));
        assert!(f.cache.contains("short"));
        f.clock.advance(Duration::from_millis(1));
        assert!(!f.cache.contains("short"));
        assert_eq!(f.cache.stats().entry_count(), 3);

        assert!(f.cache.get("short").await.is_none());
        assert_eq!(f.mid.len(), 1);
        assert_eq!(f.cache.get("long").await.as_deref().cloned(), value("w"));
    }

    #[tokio::test]
    async fn test_default_ttl_applies() {
        let f = fixture(CacheConfig::default().with_default_ttl(Some(Duration::from_secs(60))));
        f.cache.set("k", "v".into(), SetOptions::new()).await.unwrap();
        f.clock.advance(Duration::from_secs(61));
        assert!(f.cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_payloads() {
        let f = fixture(config());
        for i in 0..5 {
            f.cache
                .set(
                    &format!("k{}", i),
                    "v".into(),
                    SetOptions::new().with_ttl(Duration::from_secs(1)),
                )
                .await
                .unwrap();
        }
        f.cache.set("keep", "v".into(), SetOptions::new()).await.unwrap();
        assert_eq!(f.mid.len(), 6);

        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.cache.sweep().await, 10);
        assert_eq!(f.mid.len(), 1);
        assert_eq!(f.durable.len(), 1);
        assert_eq!(f.cache.stats().tier(TierId::Mid).unwrap().expirations, 5);
    }

    #[tokio::test]
    async fn test_sweep_is_sliced() {
        let f = fixture(CacheConfig {
            sweep_slice: 2,
            ..config()
        });
        for i in 0..5 {
            f.cache
                .set(
                    &format!("k{}", i),
                    "v".into(),
                    SetOptions::new()
                        .with_ttl(Duration::from_secs(1))
                        .with_priority(Priority::Low),
                )
                .await
                .unwrap();
        }
        f.clock.advance(Duration::from_secs(2));
        assert_eq!(f.cache.sweep().await, 2);
        assert_eq!(f.cache.sweep().await, 2);
        assert_eq!(f.cache.sweep().await, 1);
        assert!(f.durable.is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_tags() {
        let f = fixture(config());
        let tagged = |tag: &str| SetOptions::new().with_tag(tag).with_priority(Priority::High);
        f.cache.set("a", "1".into(), tagged("deck:1")).await.unwrap();
        f.cache.set("b", "2".into(), tagged("deck:2")).await.unwrap();
        f.cache
            .set("c", "3".into(), tagged("deck:1").with_tag("user:9"))
            .await
            .unwrap();

        assert_eq!(f.cache.delete_by_tags(&["deck:1", "nope"]).await, 2);
        assert!(f.cache.get("a").await.is_none());
        assert!(f.cache.get("c").await.is_none());
        assert!(f.cache.get("b").await.is_some());
        assert_eq!(f.mid.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_and_clear() {
        let f = fixture(config());
        f.cache
            .set("a", "1".into(), SetOptions::new().with_priority(Priority::High))
            .await
            .unwrap();
        f.cache.set("b", "2".into(), SetOptions::new()).await.unwrap();
        assert!(f.cache.delete("a").await);
        assert!(!f.cache.delete("a").await);
        assert!(!f.cache.contains("a"));

        f.cache.clear().await.unwrap();
        assert_eq!(f.cache.stats().entry_count(), 0);
        assert!(f.durable.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_entries() {
        let tiny = TierConfig::new(10, 8);
        let f = fixture(config().with_fast(tiny).with_mid(tiny));

        // fits only the durable tier
        f.cache
            .set("big", "x".repeat(32), SetOptions::new().with_priority(Priority::High))
            .await
            .unwrap();
        assert_eq!(f.cache.tier_keys(TierId::Durable), vec!["big"]);
        assert!(f.cache.get("big").await.is_some());
        assert!(f.cache.tier_keys(TierId::Fast).is_empty());

        let none = fixture(config().with_durable(tiny));
        let err = none
            .cache
            .set("big", "x".repeat(32), SetOptions::new().with_priority(Priority::Low))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CacheError(_)));
    }

    #[tokio::test]
    async fn test_shrink_on_pressure() {
        let f = fixture(config());
        for i in 0..8 {
            f.cache
                .set(&format!("k{}", i), "v".into(), SetOptions::new().with_priority(Priority::High))
                .await
                .unwrap();
        }
        let reading = PressureReading {
            sample: HeapSample {
                used: 95,
                total: 100,
                limit: 100,
            },
            pressure: true,
            trend: Trend::Increasing,
        };
        f.cache.on_pressure(&reading).await;
        assert_eq!(f.cache.tier_keys(TierId::Fast).len(), 6);
        assert_eq!(f.mid.len(), 6);
        assert_eq!(f.cache.stats().evictions(), 6);
    }

    #[tokio::test]
    async fn test_dir_store_backed_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let mid = Arc::new(DirStore::open(dir.path().join("mid")).unwrap());
        let durable = Arc::new(DirStore::open(dir.path().join("durable")).unwrap());
        let cache: MultiTierCache<Vec<u32>> = MultiTierCache::new(config(), mid, durable);

        cache.set("nums", vec![1, 2, 3], SetOptions::new()).await.unwrap();
        assert_eq!(cache.get("nums").await.as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(std::fs::read_dir(dir.path().join("durable")).unwrap().count(), 1);

        cache.clear().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path().join("durable")).unwrap().count(), 0);
    }

    async fn reopen(root: &std::path::Path, config: CacheConfig, clock: Arc<ManualClock>) -> MultiTierCache<Vec<u32>> {
        let mid = Arc::new(DirStore::open(root.join("mid")).unwrap());
        let durable = Arc::new(DirStore::open(root.join("durable")).unwrap());
        let cache = MultiTierCache::new(config, mid, durable).with_clock(clock);
        cache.restore().await.unwrap();
        cache
    }

    fn entry_files(root: &std::path::Path) -> usize {
        std::fs::read_dir(root.join("durable")).unwrap().count()
    }

    #[tokio::test]
    async fn test_entries_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let low = SetOptions::new().with_priority(Priority::Low);
        {
            let cache = reopen(dir.path(), config(), clock.clone()).await;
            cache.set("nums", vec![1, 2, 3], low.clone()).await.unwrap();
            cache.set("tagged", vec![4], SetOptions::new().with_tag("deck")).await.unwrap();
        }

        let cache = reopen(dir.path(), config(), clock.clone()).await;
        assert_eq!(cache.tier_keys(TierId::Mid), vec!["tagged"]);
        assert_eq!(cache.get("nums").await.as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(cache.delete_by_tags(&["deck"]).await, 1);
        assert_eq!(entry_files(dir.path()), 1);

        cache.set("nums", vec![9], low).await.unwrap();
        assert_eq!(entry_files(dir.path()), 1);
        drop(cache);

        let cache = reopen(dir.path(), config(), clock).await;
        assert_eq!(cache.get("nums").await.as_deref(), Some(&vec![9]));
    }

    #[tokio::test]
    async fn test_restart_drops_stale_payloads_and_enforces_limits() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::starting_now());
        let low = SetOptions::new().with_priority(Priority::Low);
        {
            let cache = reopen(dir.path(), config(), clock.clone()).await;
            cache
                .set("short", vec![0], low.clone().with_ttl(Duration::from_millis(100)))
                .await
                .unwrap();
            for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
                clock.advance(Duration::from_secs(1));
                cache.set(key, vec![i as u32], low.clone()).await.unwrap();
            }
        }
        let junk = format!("{}.entry", hex::encode("junk#1"));
        std::fs::write(dir.path().join("durable").join(junk), "not framed").unwrap();
        assert_eq!(entry_files(dir.path()), 5);

        let smaller = config().with_durable(TierConfig::new(2, 1 << 20));
        let cache = reopen(dir.path(), smaller, clock).await;
        assert_eq!(cache.tier_keys(TierId::Durable), vec!["b", "c"]);
        assert_eq!(entry_files(dir.path()), 2);
        assert!(cache.get("short").await.is_none());
        assert!(cache.get("a").await.is_none());
        assert_eq!(cache.get("c").await.as_deref(), Some(&vec![2]));
    }

    #[tokio::test]
    async fn test_open_restores_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = || -> Arc<dyn BackingStore> { Arc::new(DirStore::open(dir.path()).unwrap()) };
        let first: MultiTierCache<Vec<u32>> = MultiTierCache::open(config(), Arc::new(MemoryStore::new()), store())
            .await
            .unwrap();
        first
            .set("deck", vec![7], SetOptions::new().with_priority(Priority::Low))
            .await
            .unwrap();
        drop(first);

        let second: MultiTierCache<Vec<u32>> = MultiTierCache::open(config(), Arc::new(MemoryStore::new()), store())
            .await
            .unwrap();
        assert!(second.contains("deck"));
        assert_eq!(second.get("deck").await.as_deref(), Some(&vec![7]));
    }

    #[tokio::test]
    async fn test_fast_hit_refreshes_slower_tiers() {
        let f = fixture(config().with_mid(TierConfig::new(2, 1 << 20)));
        let high = SetOptions::new().with_priority(Priority::High);
        f.cache.set("a", "a".into(), high.clone()).await.unwrap();
        f.cache.set("b", "b".into(), high.clone()).await.unwrap();
        assert_eq!(f.cache.get("a").await.as_deref().cloned(), value("a"));

        f.cache.set("c", "c".into(), high).await.unwrap();
        assert_eq!(f.cache.tier_keys(TierId::Mid), vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let cache = Arc::new(MultiTierCache::<u64>::in_memory(config()));
        let tasks: Vec<_> = (0..32u64)
            .map(|i| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move {
                    cache
                        .set(&format!("k{}", i % 4), i, SetOptions::new().with_priority(Priority::High))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        for k in 0..4u64 {
            let v = cache.get(&format!("k{}", k)).await.unwrap();
            assert_eq!(*v % 4, k);
        }
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let cache = Arc::new(MultiTierCache::<u64>::in_memory(CacheConfig {
            sweep_interval_ms: 10,
            ..config()
        }));
        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&cache).spawn_sweeper(rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Set(u8),
        Get(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..6).prop_map(Op::Set), (0u8..6).prop_map(Op::Get)]
    }

    proptest! {
        #[test]
        fn prop_fast_tier_is_lru(ops in proptest::collection::vec(op(), 1..60)) {
            const CAP: usize = 3;
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let cache = MultiTierCache::<u8>::in_memory(
                config().with_fast(TierConfig::new(CAP, u64::MAX)),
            );
            let mut lru: Vec<String> = Vec::new();
            let mut stored = BTreeSet::new();

            for op in ops {
                let (key, touch) = match op {
                    Op::Set(k) => {
                        runtime
                            .block_on(cache.set(&k.to_string(), k, SetOptions::new().with_priority(Priority::High)))
                            .unwrap();
                        stored.insert(k);
                        (k.to_string(), true)
                    }
                    Op::Get(k) => {
                        let got = runtime.block_on(cache.get(&k.to_string()));
                        prop_assert_eq!(got.as_deref().copied(), stored.contains(&k).then_some(k));
                        (k.to_string(), stored.contains(&k))
                    }
                };
                if touch {
                    lru.retain(|existing| existing != &key);
                    lru.push(key);
                    if lru.len() > CAP {
                        lru.remove(0);
                    }
                }
                prop_assert_eq!(cache.tier_keys(TierId::Fast), lru.clone());
            }
        }

        #[test]
        fn prop_get_after_set_returns_value(
            writes in proptest::collection::vec((0u8..8, any::<u32>(), 0usize..3), 1..40)
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let cache = MultiTierCache::<u32>::in_memory(config());
            let priorities = [Priority::High, Priority::Medium, Priority::Low];
            for (k, v, p) in writes {
                let key = format!("k{}", k);
                runtime
                    .block_on(cache.set(&key, v, SetOptions::new().with_priority(priorities[p])))
                    .unwrap();
                prop_assert_eq!(runtime.block_on(cache.get(&key)).as_deref().copied(), Some(v));
            }
        }
    }
}
