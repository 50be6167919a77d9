//! Per-tier index: LRU ordering, capacity limits and expiry bookkeeping.
//!
//! The index is authoritative for what a tier holds. Payloads of the backed
//! tiers live in a [`BackingStore`] under a per-slot address, so removing an
//! old slot can never clobber a payload written for a newer one. Each stored
//! payload is framed with its [`SlotHeader`] so a reopened store can rebuild
//! the index.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::entry::{EntryMeta, TierId};
use super::store::BackingStore;
use crate::config::TierConfig;

/// Why a slot left the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RemovalReason {
    Evicted,
    Expired,
    Replaced,
    Deleted,
}

/// A slot dropped from the index; its payload (if any) still has to be
/// deleted from the store.
#[derive(Debug, Clone)]
pub(crate) struct Removed {
    pub key: String,
    pub address: String,
    pub reason: RemovalReason,
}

pub(crate) enum Lookup<T> {
    Miss,
    Expired(Removed),
    Hit {
        meta: EntryMeta,
        address: String,
        value: Option<Arc<T>>,
    },
}

struct Slot<T> {
    meta: EntryMeta,
    value: Option<Arc<T>>,
    tick: u64,
    generation: u64,
}

impl<T> Slot<T> {
    fn address(&self) -> String {
        payload_address(&self.meta.key, self.generation)
    }
}

pub(crate) fn payload_address(key: &str, generation: u64) -> String {
    format!("{}#{}", key, generation)
}

/// Index state persisted in front of every stored payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SlotHeader {
    pub generation: u64,
    pub meta: EntryMeta,
}

/// `header json \n payload`. Compact JSON never contains a raw newline.
pub(crate) fn frame(meta: &EntryMeta, generation: u64, payload: &[u8]) -> Result<Bytes, serde_json::Error> {
    let header = serde_json::to_vec(&SlotHeader {
        generation,
        meta: meta.clone(),
    })?;
    let mut out = BytesMut::with_capacity(header.len() + 1 + payload.len());
    out.put_slice(&header);
    out.put_u8(b'\n');
    out.put_slice(payload);
    Ok(out.freeze())
}

pub(crate) fn unframe(bytes: &Bytes) -> Option<(SlotHeader, Bytes)> {
    let split = bytes.iter().position(|&b| b == b'\n')?;
    let header = serde_json::from_slice(&bytes[..split]).ok()?;
    Some((header, bytes.slice(split + 1..)))
}

struct TierIndex<T> {
    slots: HashMap<String, Slot<T>>,
    /// tick -> key, oldest access first
    order: BTreeMap<u64, String>,
    next_tick: u64,
    next_generation: u64,
    bytes: u64,
}

impl<T> TierIndex<T> {
    fn new() -> Self {
        Self {
            slots: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            next_generation: 0,
            bytes: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn take(&mut self, key: &str, reason: RemovalReason) -> Option<Removed> {
        let slot = self.slots.remove(key)?;
        self.order.remove(&slot.tick);
        self.bytes = self.bytes.saturating_sub(slot.meta.byte_size);
        Some(Removed {
            key: key.to_string(),
            address: slot.address(),
            reason,
        })
    }

    fn bump(&mut self, key: &str) {
        let tick = self.tick();
        if let Some(slot) = self.slots.get_mut(key) {
            self.order.remove(&slot.tick);
            slot.tick = tick;
            self.order.insert(tick, key.to_string());
        }
    }

    fn oldest(&self) -> Option<String> {
        self.order.values().next().cloned()
    }
}

#[derive(Debug, Default)]
struct TierCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Counters and occupancy of one tier. Expired entries not yet swept are
/// excluded from the counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierStats {
    pub tier: TierId,
    pub entry_count: usize,
    pub bytes: u64,
    pub max_items: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

pub(crate) struct Tier<T> {
    pub id: TierId,
    pub limits: TierConfig,
    pub store: Option<Arc<dyn BackingStore>>,
    index: Mutex<TierIndex<T>>,
    counters: TierCounters,
}

impl<T> Tier<T> {
    pub fn in_memory(id: TierId, limits: TierConfig) -> Self {
        Self::build(id, limits, None)
    }

    pub fn backed(id: TierId, limits: TierConfig, store: Arc<dyn BackingStore>) -> Self {
        Self::build(id, limits, Some(store))
    }

    fn build(id: TierId, limits: TierConfig, store: Option<Arc<dyn BackingStore>>) -> Self {
        Self {
            id,
            limits,
            store,
            index: Mutex::new(TierIndex::new()),
            counters: TierCounters::default(),
        }
    }

    fn index(&self) -> MutexGuard<'_, TierIndex<T>> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `size` bytes could ever fit in this tier.
    pub fn accepts(&self, size: u64) -> bool {
        self.limits.max_items > 0 && size <= self.limits.max_bytes
    }

    /// Look up `key`, touching it on a hit. An expired slot is removed and
    /// reported so the caller can drop its payload.
    pub fn lookup(&self, key: &str, now: DateTime<Utc>) -> Lookup<T> {
        let mut index = self.index();
        let expired = match index.slots.get(key) {
            None => return Lookup::Miss,
            Some(slot) => slot.meta.is_expired(now),
        };
        if expired {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            return match index.take(key, RemovalReason::Expired) {
                Some(removed) => Lookup::Expired(removed),
                None => Lookup::Miss,
            };
        }

        index.bump(key);
        match index.slots.get_mut(key) {
            Some(slot) => {
                slot.meta.touch(now);
                Lookup::Hit {
                    meta: slot.meta.clone(),
                    address: slot.address(),
                    value: slot.value.clone(),
                }
            }
            None => Lookup::Miss,
        }
    }

    /// Whether a live slot exists, without touching it.
    pub fn contains(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.index()
            .slots
            .get(key)
            .map(|slot| !slot.meta.is_expired(now))
            .unwrap_or(false)
    }

    /// A fresh generation for the next payload written to this tier.
    pub fn next_generation(&self) -> u64 {
        let mut index = self.index();
        index.next_generation += 1;
        index.next_generation
    }

    /// Keep future generations above one found in the store.
    pub fn observe_generation(&self, generation: u64) {
        let mut index = self.index();
        index.next_generation = index.next_generation.max(generation);
    }

    /// Mark a live slot as recently used without reading it.
    pub fn touch(&self, key: &str, now: DateTime<Utc>) {
        let mut index = self.index();
        let live = index.slots.get(key).is_some_and(|slot| !slot.meta.is_expired(now));
        if live {
            index.bump(key);
        }
    }

    /// Index `meta` under `generation` and return everything displaced to
    /// make room. Expired slots go before any live entry is evicted. `None`
    /// when the entry can never fit.
    pub fn insert(
        &self,
        meta: EntryMeta,
        value: Option<Arc<T>>,
        generation: u64,
        now: DateTime<Utc>,
    ) -> Option<Vec<Removed>> {
        if !self.accepts(meta.byte_size) {
            return None;
        }
        let mut index = self.index();
        let mut removed = Vec::new();
        removed.extend(index.take(&meta.key, RemovalReason::Replaced));

        let full = |index: &TierIndex<T>| {
            index.slots.len() + 1 > self.limits.max_items || index.bytes + meta.byte_size > self.limits.max_bytes
        };

        if full(&*index) {
            let expired: Vec<String> = index
                .slots
                .values()
                .filter(|slot| slot.meta.is_expired(now))
                .map(|slot| slot.meta.key.clone())
                .collect();
            for key in expired {
                removed.extend(index.take(&key, RemovalReason::Expired));
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            }
        }

        while full(&*index) {
            let Some(victim) = index.oldest() else { break };
            removed.extend(index.take(&victim, RemovalReason::Evicted));
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let tick = index.tick();
        let key = meta.key.clone();
        index.bytes += meta.byte_size;
        index.order.insert(tick, key.clone());
        let slot = Slot {
            meta,
            value,
            tick,
            generation,
        };
        index.slots.insert(key, slot);
        Some(removed)
    }

    /// Drop the slot for `key` only if it still points at `address`.
    pub fn forget(&self, key: &str, address: &str) -> Option<Removed> {
        let mut index = self.index();
        let current = index.slots.get(key).map(|slot| slot.address())?;
        if current != address {
            return None;
        }
        index.take(key, RemovalReason::Deleted)
    }

    pub fn remove(&self, key: &str) -> Option<Removed> {
        self.index().take(key, RemovalReason::Deleted)
    }

    /// Remove `key` only while its tag set intersects `tags`.
    pub fn remove_tagged<S: AsRef<str>>(&self, key: &str, tags: &[S]) -> Option<Removed> {
        let mut index = self.index();
        let tagged = index
            .slots
            .get(key)
            .map(|slot| slot.meta.has_any_tag(tags))
            .unwrap_or(false);
        if tagged {
            index.take(key, RemovalReason::Deleted)
        } else {
            None
        }
    }

    /// Remove up to `limit` expired slots.
    pub fn purge_expired(&self, now: DateTime<Utc>, limit: usize) -> Vec<Removed> {
        let mut index = self.index();
        let keys: Vec<String> = index
            .slots
            .values()
            .filter(|slot| slot.meta.is_expired(now))
            .take(limit)
            .map(|slot| slot.meta.key.clone())
            .collect();
        let removed: Vec<Removed> = keys
            .iter()
            .filter_map(|key| index.take(key, RemovalReason::Expired))
            .collect();
        self.counters
            .expirations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Evict the least recently used `fraction` of slots.
    pub fn evict_fraction(&self, fraction: f64) -> Vec<Removed> {
        let mut index = self.index();
        let count = ((index.slots.len() as f64) * fraction.clamp(0.0, 1.0)).ceil() as usize;
        let victims: Vec<String> = index.order.values().take(count).cloned().collect();
        let removed: Vec<Removed> = victims
            .iter()
            .filter_map(|key| index.take(key, RemovalReason::Evicted))
            .collect();
        self.counters
            .evictions
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    pub fn keys_tagged<S: AsRef<str>>(&self, tags: &[S]) -> Vec<String> {
        self.index()
            .slots
            .values()
            .filter(|slot| slot.meta.has_any_tag(tags))
            .map(|slot| slot.meta.key.clone())
            .collect()
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<String> {
        self.index().order.values().cloned().collect()
    }

    pub fn clear(&self) -> Vec<Removed> {
        let mut index = self.index();
        let keys: Vec<String> = index.slots.keys().cloned().collect();
        keys.iter()
            .filter_map(|key| index.take(key, RemovalReason::Deleted))
            .collect()
    }

    pub fn record_hit(&self) {
        self.counters.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self, now: DateTime<Utc>) -> TierStats {
        let (entry_count, bytes) = {
            let index = self.index();
            index
                .slots
                .values()
                .filter(|slot| !slot.meta.is_expired(now))
                .fold((0usize, 0u64), |(n, b), slot| (n + 1, b + slot.meta.byte_size))
        };
        TierStats {
            tier: self.id,
            entry_count,
            bytes,
            max_items: self.limits.max_items,
            max_bytes: self.limits.max_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(key: &str, size: u64, now: DateTime<Utc>, ttl_ms: Option<u64>) -> EntryMeta {
        EntryMeta {
            key: key.into(),
            byte_size: size,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            ttl_ms,
            tags: Default::default(),
            origin: TierId::Fast,
        }
    }

    fn tier(max_items: usize, max_bytes: u64) -> Tier<u32> {
        Tier::in_memory(TierId::Fast, TierConfig { max_items, max_bytes })
    }

    fn put(t: &Tier<u32>, meta: EntryMeta, now: DateTime<Utc>) -> Option<(String, Vec<Removed>)> {
        let generation = t.next_generation();
        let address = payload_address(&meta.key, generation);
        t.insert(meta, None, generation, now).map(|removed| (address, removed))
    }

    #[test]
    fn test_lru_eviction_order() {
        let now = Utc::now();
        let t = tier(2, 1000);
        t.insert(meta("a", 1, now, None), Some(Arc::new(1)), t.next_generation(), now).unwrap();
        t.insert(meta("b", 1, now, None), Some(Arc::new(2)), t.next_generation(), now).unwrap();
        assert!(matches!(t.lookup("a", now), Lookup::Hit { .. }));

        let (_, removed) = put(&t, meta("c", 1, now, None), now).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "b");
        assert_eq!(removed[0].reason, RemovalReason::Evicted);
        assert_eq!(t.keys_by_recency(), vec!["a", "c"]);
        assert_eq!(t.stats(now).evictions, 1);
    }

    #[test]
    fn test_byte_limit_and_oversize() {
        let now = Utc::now();
        let t = tier(10, 100);
        assert!(put(&t, meta("huge", 101, now, None), now).is_none());
        put(&t, meta("a", 60, now, None), now).unwrap();
        let (_, removed) = put(&t, meta("b", 60, now, None), now).unwrap();
        assert_eq!(removed[0].key, "a");
        assert_eq!(t.stats(now).bytes, 60);
    }

    #[test]
    fn test_expired_slots_go_before_live_ones() {
        let now = Utc::now();
        let later = now + chrono::Duration::seconds(10);
        let t = tier(2, 1000);
        put(&t, meta("live", 1, now, None), now).unwrap();
        put(&t, meta("stale", 1, now, Some(1000)), now).unwrap();

        let (_, removed) = put(&t, meta("new", 1, later, None), later).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].key, "stale");
        assert_eq!(removed[0].reason, RemovalReason::Expired);
        assert!(t.contains("live", later));
    }

    #[test]
    fn test_replace_changes_address() {
        let now = Utc::now();
        let t = tier(4, 1000);
        let (first, _) = put(&t, meta("k", 1, now, None), now).unwrap();
        let (second, removed) = put(&t, meta("k", 1, now, None), now).unwrap();
        assert_ne!(first, second);
        assert_eq!(removed[0].address, first);
        assert_eq!(removed[0].reason, RemovalReason::Replaced);

        assert!(t.forget("k", &first).is_none());
        assert!(t.forget("k", &second).is_some());
    }

    #[test]
    fn test_stats_exclude_expired() {
        let now = Utc::now();
        let t = tier(4, 1000);
        put(&t, meta("a", 5, now, Some(10)), now).unwrap();
        put(&t, meta("b", 7, now, None), now).unwrap();
        let later = now + chrono::Duration::seconds(1);
        let stats = t.stats(later);
        assert_eq!((stats.entry_count, stats.bytes), (1, 7));

        assert_eq!(t.purge_expired(later, 10).len(), 1);
        assert_eq!(t.stats(later).expirations, 1);
    }

    #[test]
    fn test_evict_fraction_takes_oldest() {
        let now = Utc::now();
        let t = tier(10, 1000);
        for key in ["a", "b", "c", "d"] {
            put(&t, meta(key, 1, now, None), now).unwrap();
        }
        let removed: Vec<String> = t.evict_fraction(0.5).into_iter().map(|r| r.key).collect();
        assert_eq!(removed, vec!["a", "b"]);
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let now = Utc::now();
        let t = tier(10, 1000);
        for key in ["a", "b", "c"] {
            put(&t, meta(key, 1, now, None), now).unwrap();
        }
        t.touch("a", now);
        t.touch("missing", now);
        assert_eq!(t.keys_by_recency(), vec!["b", "c", "a"]);
    }

    #[test]
    fn test_frame_carries_header() {
        let now = Utc::now();
        let mut m = meta("k", 3, now, Some(500));
        m.tags.insert("deck".into());
        let framed = frame(&m, 7, b"a\nb").unwrap();

        let (header, payload) = unframe(&framed).unwrap();
        assert_eq!(header.generation, 7);
        assert_eq!(header.meta.key, "k");
        assert_eq!(header.meta.ttl_ms, Some(500));
        assert!(header.meta.tags.contains("deck"));
        assert_eq!(&payload[..], b"a\nb");

        assert!(unframe(&Bytes::from_static(b"not framed")).is_none());
    }

    #[test]
    fn test_observed_generations_are_never_reused() {
        let t = tier(4, 1000);
        t.observe_generation(41);
        t.observe_generation(3);
        assert_eq!(t.next_generation(), 42);
    }
}
