//! Priority-queue background preloader
//!
//! Items near the current position are ranked by a quadratic distance decay
//! and decoded through a max-heap with a bounded number of concurrent loads.
//! Every completion immediately pulls the next entry (continuous refill).

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace, warn};
use serde::Serialize;

use super::cancel::CancelToken;
use super::event_bus::{EventBus, LoadEvent, LoadSource};
use super::image_cache::ImageCache;
use super::memory::{store_decoded, MemoryBudget};
use super::registry::{DecodeOwner, DecodeRegistry};
use super::window_loader::window_bounds;
use super::workers::{Lane, Workers};
use crate::entities::{ImageDecoder, Item, ItemId, LoadError};

/// Collections above this size get a fixed preload radius
pub const LARGE_COLLECTION: usize = 10_000;
/// Preload radius for large collections
pub const LARGE_COLLECTION_RADIUS: usize = 100;

/// `max(0, 100 - d^2 / 10)`: near neighbours dominate, far items fade fast
pub fn preload_priority(distance: usize) -> u32 {
    let d = distance as u64;
    100u64.saturating_sub(d.saturating_mul(d) / 10) as u32
}

/// Radius actually scheduled for `n` items
pub fn preload_radius(n: usize, window: usize) -> usize {
    if n > LARGE_COLLECTION {
        window.min(LARGE_COLLECTION_RADIUS)
    } else {
        window
    }
}

/// Queued preload
///
/// Ordered by priority, then nearer first, then lower index, so equal
/// priorities still drain in distance order.
#[derive(Debug, Clone)]
pub struct PreloadTask {
    pub priority: u32,
    pub distance: usize,
    pub index: usize,
    pub item: Item,
    token: CancelToken,
}

impl PartialEq for PreloadTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PreloadTask {}

impl PartialOrd for PreloadTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PreloadTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap: reverse the "smaller is better" keys
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.distance.cmp(&self.distance))
            .then_with(|| other.index.cmp(&self.index))
    }
}

/// Counters for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PreloadStatistics {
    /// Finished loads (successful + failed); cancellations excluded
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub active_loads: usize,
}

#[derive(Debug)]
struct PreloaderState {
    heap: BinaryHeap<PreloadTask>,
    queued: HashMap<ItemId, CancelToken>,
    running: HashMap<ItemId, CancelToken>,
    /// Decodes occupying a slot, including cancelled ones not yet returned
    active: usize,
    max_concurrent: usize,
    window_size: usize,
    center: usize,
    successful: u64,
    failed: u64,
}

struct Shared {
    cache: Arc<ImageCache>,
    budget: Arc<MemoryBudget>,
    registry: Arc<DecodeRegistry>,
    decoder: Arc<dyn ImageDecoder>,
    workers: Arc<Workers>,
    bus: EventBus,
    state: Mutex<PreloaderState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PreloaderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Background preloader. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Preloader {
    shared: Arc<Shared>,
}

impl Preloader {
    pub fn new(
        window_size: usize,
        max_concurrent: usize,
        cache: Arc<ImageCache>,
        budget: Arc<MemoryBudget>,
        registry: Arc<DecodeRegistry>,
        decoder: Arc<dyn ImageDecoder>,
        workers: Arc<Workers>,
        bus: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cache,
                budget,
                registry,
                decoder,
                workers,
                bus,
                state: Mutex::new(PreloaderState {
                    heap: BinaryHeap::new(),
                    queued: HashMap::new(),
                    running: HashMap::new(),
                    active: 0,
                    max_concurrent: max_concurrent.max(1),
                    window_size,
                    center: 0,
                    successful: 0,
                    failed: 0,
                }),
            }),
        }
    }

    /// Replace the queue with every not-yet-loaded item around `current`.
    ///
    /// Pending and running preloads from the previous schedule are cancelled.
    pub fn schedule(&self, items: &[Item], current: usize, window_size: Option<usize>) {
        let shared = &self.shared;
        let mut state = shared.state();
        cancel_everything(shared, &mut state);

        let radius = preload_radius(items.len(), window_size.unwrap_or(state.window_size));
        state.center = current;
        let Some((start, end)) = window_bounds(current, radius, items.len()) else {
            return;
        };

        for (index, item) in items.iter().enumerate().take(end + 1).skip(start) {
            if shared.cache.contains(&item.id) {
                continue;
            }
            let token = CancelToken::new();
            if !shared.registry.try_claim(item.id, DecodeOwner::PreloadQueued, &token) {
                continue;
            }
            if shared.cache.contains(&item.id) {
                shared.registry.release(item.id, &token);
                continue;
            }
            let distance = index.abs_diff(current);
            state.queued.insert(item.id, token.clone());
            state.heap.push(PreloadTask {
                priority: preload_priority(distance),
                distance,
                index,
                item: item.clone(),
                token,
            });
        }

        debug!(
            "Preload scheduled around {}: radius {}, {} queued",
            current,
            radius,
            state.heap.len()
        );
        drain(shared, &mut state);
    }

    /// Re-rank queued items against `new_index`. Running loads are untouched.
    pub fn reprioritize(&self, items: &[Item], new_index: usize) {
        let shared = &self.shared;
        let mut state = shared.state();
        state.center = new_index;

        let old = std::mem::take(&mut state.heap);
        for mut task in old.into_vec() {
            if task.token.is_cancelled() {
                state.queued.remove(&task.item.id);
                continue;
            }
            // Positions come from the caller's current list; drop entries it no longer has
            if items.get(task.index).map(|it| it.id) != Some(task.item.id) {
                task.token.cancel();
                shared.registry.release(task.item.id, &task.token);
                state.queued.remove(&task.item.id);
                continue;
            }
            task.distance = task.index.abs_diff(new_index);
            task.priority = preload_priority(task.distance);
            state.heap.push(task);
        }
        trace!("Preload reprioritized around {}: {} queued", new_index, state.heap.len());
        drain(shared, &mut state);
    }

    /// Cancel queued and running preloads
    pub fn cancel_all(&self) {
        let mut state = self.shared.state();
        cancel_everything(&self.shared, &mut state);
    }

    /// Drop one queued entry (an emergency load is taking it over)
    pub fn withdraw(&self, id: &ItemId) -> bool {
        let mut state = self.shared.state();
        match state.queued.remove(id) {
            Some(token) => {
                token.cancel();
                self.shared.registry.release(*id, &token);
                true
            }
            None => false,
        }
    }

    /// Change the concurrency bound; raising it starts more loads at once
    pub fn set_max_concurrent(&self, max: usize) {
        let mut state = self.shared.state();
        state.max_concurrent = max.max(1);
        drain(&self.shared, &mut state);
    }

    pub fn max_concurrent(&self) -> usize {
        self.shared.state().max_concurrent
    }

    pub fn set_window_size(&self, window_size: usize) {
        self.shared.state().window_size = window_size;
    }

    /// Ids still waiting in the heap
    pub fn queued_ids(&self) -> Vec<ItemId> {
        self.shared
            .state()
            .queued
            .iter()
            .filter(|(_, t)| !t.is_cancelled())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Ids currently decoding
    pub fn running_ids(&self) -> Vec<ItemId> {
        self.shared
            .state()
            .running
            .iter()
            .filter(|(_, t)| !t.is_cancelled())
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state();
        state.active == 0 && state.queued.values().all(|t| t.is_cancelled())
    }

    pub fn statistics(&self) -> PreloadStatistics {
        let state = self.shared.state();
        let total = state.successful + state.failed;
        PreloadStatistics {
            total,
            successful: state.successful,
            failed: state.failed,
            success_rate: if total == 0 { 0.0 } else { state.successful as f64 / total as f64 },
            active_loads: state.active,
        }
    }
}

fn cancel_everything(shared: &Shared, state: &mut PreloaderState) {
    for (id, token) in state.queued.drain() {
        token.cancel();
        shared.registry.release(id, &token);
    }
    for (id, token) in state.running.drain() {
        token.cancel();
        shared.registry.release(id, &token);
    }
    state.heap.clear();
}

/// Launch queued tasks until the concurrency bound is reached
fn drain(shared: &Arc<Shared>, state: &mut PreloaderState) {
    while state.active < state.max_concurrent {
        let Some(task) = state.heap.pop() else { break };
        state.queued.remove(&task.item.id);
        if task.token.is_cancelled()
            || !shared.registry.promote(task.item.id, &task.token, DecodeOwner::Preload)
        {
            continue;
        }

        state.active += 1;
        state.running.insert(task.item.id, task.token.clone());
        trace!("Preload start #{} (priority {})", task.index, task.priority);

        let worker_shared = Arc::clone(shared);
        shared.workers.execute(Lane::Normal, move || {
            run_preload(&worker_shared, task);
        });
    }
}

fn run_preload(shared: &Arc<Shared>, task: PreloadTask) {
    let PreloadTask { index, item, token, .. } = task;
    let result = shared.decoder.decode(&item.locator, &token);

    let mut state = shared.state();
    state.active = state.active.saturating_sub(1);
    if state.running.get(&item.id).is_some_and(|t| t.same_task(&token)) {
        state.running.remove(&item.id);
    }

    let mut events = Vec::new();
    if token.is_cancelled() {
        shared.registry.release(item.id, &token);
    } else {
        match result {
            Ok(image) => {
                let evicted = store_decoded(&shared.cache, &shared.budget, item.id, Arc::new(image));
                shared.registry.release(item.id, &token);
                state.successful += 1;
                events.extend(evicted.into_iter().map(|id| LoadEvent::Evicted { id }));
                events.push(LoadEvent::Loaded { id: item.id, index, source: LoadSource::Preload });
            }
            Err(LoadError::Cancelled) => {
                shared.registry.release(item.id, &token);
            }
            Err(e) => {
                warn!("Preload failed for #{}: {}", index, e);
                shared.registry.release(item.id, &token);
                state.failed += 1;
                events.push(LoadEvent::Failed { id: item.id, index, reason: e.to_string() });
            }
        }
    }

    drain(shared, &mut state);
    drop(state);

    for event in events {
        shared.bus.emit(event);
    }
}
