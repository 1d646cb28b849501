//! Bounded decoded-image cache with hit/miss accounting
//!
//! Keyed by item id. Limits are a maximum entry count and a maximum total
//! cost in bytes; inserting past either limit evicts existing entries
//! (never the one being inserted).
//!
//! All state sits behind one mutex: cost accounting stays exact when
//! decode completions race each other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexSet;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::entities::{DecodedImage, ItemId};

/// Which entry goes first when the cache must shrink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EvictionOrder {
    /// Least recently used (inserted or read) first
    #[default]
    Lru,
    /// Smallest identifier first. Legacy behaviour, kept for parity runs;
    /// unrelated to access recency.
    IdentifierSort,
}

/// Hit/miss counters, lock-free
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheStats {
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Snapshot returned by `statistics()`
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStatistics {
    pub hits: u64,
    pub misses: u64,
    pub current_count: usize,
    pub count_limit: usize,
    pub total_cost: usize,
    pub cost_limit: usize,
}

impl CacheStatistics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 { 0.0 } else { self.hits as f64 / total as f64 }
    }
}

#[derive(Debug)]
struct CacheEntry {
    image: Arc<DecodedImage>,
    cost: usize,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<ItemId, CacheEntry>,
    /// Front = least recently used
    lru: IndexSet<ItemId>,
    total_cost: usize,
    count_limit: usize,
    cost_limit: usize,
    order: EvictionOrder,
}

impl Inner {
    fn touch(&mut self, id: ItemId) {
        // shift_remove keeps insertion order, which is the recency order
        self.lru.shift_remove(&id);
        self.lru.insert(id);
    }

    fn remove(&mut self, id: &ItemId) -> Option<CacheEntry> {
        let entry = self.entries.remove(id)?;
        self.lru.shift_remove(id);
        self.total_cost = self.total_cost.saturating_sub(entry.cost);
        Some(entry)
    }

    /// Next eviction victim, skipping `protect`
    fn victim(&self, protect: Option<ItemId>) -> Option<ItemId> {
        match self.order {
            EvictionOrder::Lru => self.lru.iter().find(|id| Some(**id) != protect).copied(),
            EvictionOrder::IdentifierSort => self
                .entries
                .keys()
                .filter(|id| Some(**id) != protect)
                .min()
                .copied(),
        }
    }

    fn over_limits(&self) -> bool {
        self.entries.len() > self.count_limit || self.total_cost > self.cost_limit
    }

    /// Evict in policy order until total cost is at most `target`
    fn shrink(&mut self, target: usize, protect: Option<ItemId>) -> Vec<ItemId> {
        let mut evicted = Vec::new();
        while self.total_cost > target {
            let Some(id) = self.victim(protect) else { break };
            self.remove(&id);
            evicted.push(id);
        }
        evicted
    }

    fn insert(&mut self, id: ItemId, image: Arc<DecodedImage>, cost: usize) {
        if let Some(old) = self.remove(&id) {
            trace!("Replaced {} (freed {} bytes)", id, old.cost);
        }
        self.entries.insert(id, CacheEntry { image, cost });
        self.lru.insert(id);
        self.total_cost += cost;
    }

    /// Evict until both limits hold
    fn enforce(&mut self, protect: Option<ItemId>) -> Vec<ItemId> {
        let mut evicted = Vec::new();
        while self.over_limits() {
            let Some(id) = self.victim(protect) else { break };
            if let Some(entry) = self.remove(&id) {
                trace!("Evicted {} ({} bytes)", id, entry.cost);
                evicted.push(id);
            }
        }
        evicted
    }
}

/// Count- and cost-limited image store.
#[derive(Debug)]
pub struct ImageCache {
    inner: Mutex<Inner>,
    stats: CacheStats,
}

impl ImageCache {
    /// Create cache
    ///
    /// # Arguments
    /// * `count_limit` - Maximum resident entries (min 1)
    /// * `cost_limit` - Maximum total cost in bytes
    pub fn new(count_limit: usize, cost_limit: usize) -> Self {
        let count_limit = count_limit.max(1);
        debug!(
            "ImageCache created: count_limit={}, cost_limit={} MB",
            count_limit,
            cost_limit / 1024 / 1024
        );
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                lru: IndexSet::new(),
                total_cost: 0,
                count_limit,
                cost_limit,
                order: EvictionOrder::default(),
            }),
            stats: CacheStats::default(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Get image, counting a hit or a miss. Hits refresh recency.
    pub fn get(&self, id: &ItemId) -> Option<Arc<DecodedImage>> {
        let mut inner = self.lock();
        match inner.entries.get(id).map(|e| Arc::clone(&e.image)) {
            Some(image) => {
                inner.touch(*id);
                self.stats.record_hit();
                Some(image)
            }
            None => {
                self.stats.record_miss();
                None
            }
        }
    }

    /// Get image without touching statistics or recency
    pub fn peek(&self, id: &ItemId) -> Option<Arc<DecodedImage>> {
        self.lock().entries.get(id).map(|e| Arc::clone(&e.image))
    }

    pub fn contains(&self, id: &ItemId) -> bool {
        self.lock().entries.contains_key(id)
    }

    /// Insert or replace an image.
    ///
    /// `cost` defaults to `width * height * 4`. Returns ids evicted to make room.
    pub fn set(&self, id: ItemId, image: Arc<DecodedImage>, cost: Option<usize>) -> Vec<ItemId> {
        let cost = cost.unwrap_or_else(|| image.cost());
        let mut inner = self.lock();
        inner.insert(id, image, cost);

        let evicted = inner.enforce(Some(id));
        if !evicted.is_empty() {
            debug!(
                "Cache over limit: evicted {} entries ({} resident, {} MB)",
                evicted.len(),
                inner.entries.len(),
                inner.total_cost / 1024 / 1024
            );
        }
        evicted
    }

    /// Insert like `set`, except an insert that pushes total cost past
    /// `ceiling` evicts down to `target` rather than just under the limit.
    ///
    /// The new entry is never the victim. Returns evicted ids and whether
    /// the ceiling was crossed.
    pub fn set_with_pressure(
        &self,
        id: ItemId,
        image: Arc<DecodedImage>,
        ceiling: usize,
        target: usize,
    ) -> (Vec<ItemId>, bool) {
        let cost = image.cost();
        let mut inner = self.lock();
        inner.insert(id, image, cost);

        let pressured = inner.total_cost > ceiling;
        let mut evicted = if pressured { inner.shrink(target, Some(id)) } else { Vec::new() };
        evicted.extend(inner.enforce(Some(id)));
        (evicted, pressured)
    }

    pub fn remove(&self, id: &ItemId) -> Option<Arc<DecodedImage>> {
        self.lock().remove(id).map(|e| e.image)
    }

    /// Keep only entries for which `keep` returns true; returns removed ids
    pub fn retain<F>(&self, mut keep: F) -> Vec<ItemId>
    where
        F: FnMut(&ItemId) -> bool,
    {
        let mut inner = self.lock();
        let doomed: Vec<ItemId> = inner.entries.keys().filter(|id| !keep(id)).copied().collect();
        for id in &doomed {
            inner.remove(id);
        }
        doomed
    }

    /// Evict in policy order until total cost is at most `target`
    pub fn shrink_to_cost(&self, target: usize) -> Vec<ItemId> {
        self.lock().shrink(target, None)
    }

    /// Drop every entry. Statistics are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.lru.clear();
        inner.total_cost = 0;
        debug!("Cleared image cache");
    }

    /// Change limits at runtime; returns ids evicted to satisfy them
    pub fn set_limits(&self, count_limit: usize, cost_limit: usize) -> Vec<ItemId> {
        let mut inner = self.lock();
        inner.count_limit = count_limit.max(1);
        inner.cost_limit = cost_limit;
        inner.enforce(None)
    }

    pub fn set_eviction_order(&self, order: EvictionOrder) {
        let mut inner = self.lock();
        if inner.order != order {
            debug!("Eviction order: {:?} -> {:?}", inner.order, order);
            inner.order = order;
        }
    }

    pub fn eviction_order(&self) -> EvictionOrder {
        self.lock().order
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Sum of resident costs in bytes
    pub fn total_cost(&self) -> usize {
        self.lock().total_cost
    }

    /// Resident ids, least recently used first
    pub fn ids(&self) -> Vec<ItemId> {
        self.lock().lru.iter().copied().collect()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn statistics(&self) -> CacheStatistics {
        let inner = self.lock();
        CacheStatistics {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            current_count: inner.entries.len(),
            count_limit: inner.count_limit,
            total_cost: inner.total_cost,
            cost_limit: inner.cost_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn img(w: u32, h: u32) -> Arc<DecodedImage> {
        Arc::new(DecodedImage::filled(w, h, [0, 0, 0, 255]))
    }

    #[test]
    fn test_get_counts_hits_and_misses() {
        let cache = ImageCache::new(10, usize::MAX);
        let id = Uuid::new_v4();
        cache.set(id, img(4, 4), None);

        assert!(cache.get(&id).is_some());
        assert!(cache.get(&Uuid::new_v4()).is_none());

        let stats = cache.statistics();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);

        // peek/contains don't count
        cache.peek(&id);
        cache.contains(&id);
        assert_eq!(cache.statistics().hits, 1);
    }

    #[test]
    fn test_count_limit_51_into_50() {
        let cache = ImageCache::new(50, usize::MAX);
        for _ in 0..51 {
            cache.set(Uuid::new_v4(), img(2, 2), None);
        }
        assert_eq!(cache.len(), 50);
        assert!(cache.statistics().current_count <= 50);
    }

    #[test]
    fn test_cost_defaults_to_rgba_size() {
        let cache = ImageCache::new(10, usize::MAX);
        cache.set(Uuid::new_v4(), img(10, 10), None);
        assert_eq!(cache.total_cost(), 400);

        cache.set(Uuid::new_v4(), img(10, 10), Some(7));
        assert_eq!(cache.total_cost(), 407);
    }

    #[test]
    fn test_cost_limit_evicts_lru() {
        // Room for exactly two 4x4 images
        let cache = ImageCache::new(100, 128);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        cache.set(a, img(4, 4), None);
        cache.set(b, img(4, 4), None);

        // Touch a so b becomes least recent
        cache.get(&a);
        let evicted = cache.set(c, img(4, 4), None);

        assert_eq!(evicted, vec![b]);
        assert!(cache.contains(&a));
        assert!(cache.contains(&c));
        assert_eq!(cache.total_cost(), 128);
    }

    #[test]
    fn test_oversized_insert_is_kept() {
        let cache = ImageCache::new(10, 16);
        let small = Uuid::new_v4();
        let big = Uuid::new_v4();
        cache.set(small, img(1, 1), None);
        let evicted = cache.set(big, img(8, 8), None);
        assert_eq!(evicted, vec![small]);
        assert!(cache.contains(&big));
    }

    #[test]
    fn test_replace_keeps_cost_exact() {
        let cache = ImageCache::new(10, usize::MAX);
        let id = Uuid::new_v4();
        cache.set(id, img(4, 4), None);
        cache.set(id, img(2, 2), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 16);
    }

    #[test]
    fn test_identifier_sort_order() {
        let cache = ImageCache::new(2, usize::MAX);
        cache.set_eviction_order(EvictionOrder::IdentifierSort);

        let mut ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        ids.sort();
        // Insert largest first so LRU and identifier order disagree
        cache.set(ids[2], img(1, 1), None);
        cache.set(ids[0], img(1, 1), None);
        let evicted = cache.set(ids[1], img(1, 1), None);
        assert_eq!(evicted, vec![ids[0]]);
    }

    #[test]
    fn test_shrink_and_retain() {
        let cache = ImageCache::new(100, usize::MAX);
        let ids: Vec<_> = (0..10).map(|_| Uuid::new_v4()).collect();
        for id in &ids {
            cache.set(*id, img(4, 4), None); // 64 bytes each
        }

        let evicted = cache.shrink_to_cost(64 * 6);
        assert_eq!(evicted, ids[..4].to_vec());
        assert_eq!(cache.total_cost(), 64 * 6);

        let removed = cache.retain(|id| *id == ids[9]);
        assert_eq!(removed.len(), 5);
        assert_eq!(cache.ids(), vec![ids[9]]);
    }

    #[test]
    fn test_pressure_insert_drops_to_target() {
        // Hard limit equals the ceiling, as when the cache follows the memory budget
        let cache = ImageCache::new(100, 64 * 4);
        let ids: Vec<_> = (0..5).map(|_| Uuid::new_v4()).collect();
        for id in &ids[..4] {
            let (evicted, pressured) = cache.set_with_pressure(*id, img(4, 4), 64 * 4, 64 * 2);
            assert!(evicted.is_empty());
            assert!(!pressured);
        }

        let (evicted, pressured) = cache.set_with_pressure(ids[4], img(4, 4), 64 * 4, 64 * 2);
        assert!(pressured);
        assert_eq!(evicted, ids[..3].to_vec());
        assert_eq!(cache.total_cost(), 64 * 2);
        assert!(cache.contains(&ids[4]));
    }

    #[test]
    fn test_set_limits_shrinks() {
        let cache = ImageCache::new(10, usize::MAX);
        for _ in 0..10 {
            cache.set(Uuid::new_v4(), img(1, 1), None);
        }
        let evicted = cache.set_limits(3, usize::MAX);
        assert_eq!(evicted.len(), 7);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_clear_keeps_stats() {
        let cache = ImageCache::new(10, usize::MAX);
        let id = Uuid::new_v4();
        cache.set(id, img(1, 1), None);
        cache.get(&id);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.total_cost(), 0);
        assert_eq!(cache.statistics().hits, 1);
    }
}
