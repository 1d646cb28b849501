//! Sliding window of decoded images around the current position
//!
//! **Why**: collections of 100k+ images can't be resident at once. The loader
//! keeps a window `[center - half, center + half]` decoded, where `half`
//! shrinks relative to collection size, and drops everything outside a wider
//! buffer zone so small back-and-forth moves don't thrash.
//!
//! **Used by**: `Navigator` on sequential moves; the UI reads images via
//! `image()` and listens for `LoadEvent`s.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, trace, warn};
use serde::Serialize;

use super::cancel::CancelToken;
use super::event_bus::{EventBus, LoadEvent, LoadSource};
use super::image_cache::ImageCache;
use super::memory::{bytes_to_mb, store_decoded, MemoryBudget};
use super::registry::{DecodeOwner, DecodeRegistry};
use super::workers::{Lane, Workers};
use crate::entities::{DecodedImage, ImageDecoder, Item, ItemId, LoadError, Locator};

/// Self-tuning runs after this many completed decodes
pub const TUNE_EVERY: u64 = 50;
/// Hit rate below which the window grows
pub const TUNE_HIT_RATE: f64 = 0.70;
/// Growth per tuning step, normal and with plenty of free memory
pub const TUNE_STEP: usize = 10;
pub const TUNE_STEP_COMFORTABLE: usize = 20;

/// Half-window for a collection of `n` items and base window `base`.
///
/// | n | half |
/// |---|---|
/// | 0-100 | `min(W, n)` |
/// | 101-1000 | `min(W, max(50, n/10))` |
/// | 1001-10000 | `min(W, max(100, n/50))` |
/// | >10000 | `max(200, min(W, n/100))` |
pub fn adaptive_half_window(n: usize, base: usize) -> usize {
    match n {
        0..=100 => base.min(n),
        101..=1_000 => base.min((n / 10).max(50)),
        1_001..=10_000 => base.min((n / 50).max(100)),
        _ => base.min(n / 100).max(200),
    }
}

/// `[center - half, center + half]` clamped to `[0, n - 1]`; None when empty
pub fn window_bounds(center: usize, half: usize, n: usize) -> Option<(usize, usize)> {
    if n == 0 {
        return None;
    }
    let center = center.min(n - 1);
    Some((center.saturating_sub(half), center.saturating_add(half).min(n - 1)))
}

/// Diagnostics for the UI
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStatistics {
    pub hit_rate: f64,
    pub loaded_count: usize,
    pub memory_usage_mb: f64,
}

#[derive(Debug)]
struct InFlight {
    index: usize,
    token: CancelToken,
}

#[derive(Debug)]
struct WindowState {
    /// Configured base window W
    base: usize,
    /// Growth granted by self-tuning, applied while the table gives less than W
    boost: usize,
    /// Effective half-window from the last recompute or tuning step
    half: usize,
    center: usize,
    bounds: Option<(usize, usize)>,
    in_flight: HashMap<ItemId, InFlight>,
    completed: u64,
    /// Cache counters at the last tuning check
    tune_hits: u64,
    tune_misses: u64,
}

impl WindowState {
    fn effective_half(&self, n: usize) -> usize {
        let table = adaptive_half_window(n, self.base);
        if table < self.base {
            (table + self.boost).min(self.base)
        } else {
            table
        }
    }

    /// Retention radius around the center
    fn buffer_radius(&self) -> usize {
        self.base.max(self.half).saturating_mul(2)
    }
}

struct Shared {
    cache: Arc<ImageCache>,
    budget: Arc<MemoryBudget>,
    registry: Arc<DecodeRegistry>,
    decoder: Arc<dyn ImageDecoder>,
    workers: Arc<Workers>,
    bus: EventBus,
    state: Mutex<WindowState>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, WindowState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit_evicted(&self, ids: Vec<ItemId>) {
        for id in ids {
            self.bus.emit(LoadEvent::Evicted { id });
        }
    }
}

/// Virtual window loader. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WindowLoader {
    shared: Arc<Shared>,
}

impl WindowLoader {
    pub fn new(
        base_window: usize,
        cache: Arc<ImageCache>,
        budget: Arc<MemoryBudget>,
        registry: Arc<DecodeRegistry>,
        decoder: Arc<dyn ImageDecoder>,
        workers: Arc<Workers>,
        bus: EventBus,
    ) -> Self {
        let base = base_window.max(1);
        Self {
            shared: Arc::new(Shared {
                cache,
                budget,
                registry,
                decoder,
                workers,
                bus,
                state: Mutex::new(WindowState {
                    base,
                    boost: 0,
                    half: base,
                    center: 0,
                    bounds: None,
                    in_flight: HashMap::new(),
                    completed: 0,
                    tune_hits: 0,
                    tune_misses: 0,
                }),
            }),
        }
    }

    /// Move the window to `index` and start decoding what's missing.
    pub fn set_window_center(&self, index: usize, items: &[Item]) {
        let n = items.len();
        let shared = &self.shared;
        let mut state = shared.state();

        let half = state.effective_half(n);
        state.half = half;
        state.center = index;
        state.bounds = window_bounds(index, half, n);

        let Some((start, end)) = state.bounds else {
            self.cancel_all_locked(&mut state);
            let evicted = shared.cache.retain(|_| false);
            shared.emit_evicted(evicted);
            return;
        };
        trace!("Window center={} half={} -> [{}, {}] of {}", index, half, start, end, n);

        // 1. Cancel decodes that fell out of the window
        let outside: Vec<ItemId> = state
            .in_flight
            .iter()
            .filter(|(_, f)| f.index < start || f.index > end)
            .map(|(id, _)| *id)
            .collect();
        for id in outside {
            if let Some(f) = state.in_flight.remove(&id) {
                f.token.cancel();
                shared.registry.release(id, &f.token);
            }
        }

        // 2. Evict everything outside the buffer zone
        let radius = state.buffer_radius();
        let center = index.min(n - 1);
        let keep_start = center.saturating_sub(radius);
        let keep_end = center.saturating_add(radius).min(n - 1);
        let keep: HashSet<ItemId> = items[keep_start..=keep_end].iter().map(|it| it.id).collect();
        let evicted = shared.cache.retain(|id| keep.contains(id));
        if !evicted.is_empty() {
            debug!(
                "Buffer zone [{}, {}]: evicted {} entries",
                keep_start,
                keep_end,
                evicted.len()
            );
        }
        shared.emit_evicted(evicted);

        // 3. Launch decodes for missing items, nearest first
        let mut launched = 0usize;
        for idx in spiral(center, start, end) {
            let item = &items[idx];
            if shared.cache.contains(&item.id) {
                continue;
            }
            match state.in_flight.get(&item.id) {
                Some(f) if !f.token.is_cancelled() => continue,
                // Preempted by another owner that has since let go
                Some(_) => {
                    state.in_flight.remove(&item.id);
                }
                None => {}
            }
            let token = CancelToken::new();
            // Queued preloads are only a plan; take them over
            if !shared.registry.claim_or_take_queued(item.id, DecodeOwner::Window, &token) {
                continue;
            }
            // Loaders store before releasing, so a decode that just finished is visible here
            if shared.cache.contains(&item.id) {
                shared.registry.release(item.id, &token);
                continue;
            }

            state.in_flight.insert(item.id, InFlight { index: idx, token: token.clone() });
            let shared = Arc::clone(shared);
            let id = item.id;
            let locator = item.locator.clone();
            self.shared.workers.execute(Lane::Normal, move || {
                run_decode(&shared, id, idx, &locator, &token);
            });
            launched += 1;
        }

        if launched > 0 {
            trace!("Window launched {} decodes", launched);
        }
    }

    /// Resident image for `id`; counts a cache hit or miss
    pub fn image(&self, id: &ItemId) -> Option<Arc<DecodedImage>> {
        self.shared.cache.get(id)
    }

    pub fn is_loading(&self, id: &ItemId) -> bool {
        self.shared
            .state()
            .in_flight
            .get(id)
            .map(|f| !f.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Cancel all decodes and drop every resident image
    pub fn clear(&self) {
        let mut state = self.shared.state();
        self.cancel_all_locked(&mut state);
        state.bounds = None;
        self.shared.cache.clear();
        info!("Window loader cleared");
    }

    fn cancel_all_locked(&self, state: &mut WindowState) {
        for (id, f) in state.in_flight.drain() {
            f.token.cancel();
            self.shared.registry.release(id, &f.token);
        }
    }

    /// Sum of resident image costs in bytes
    pub fn memory_usage_estimate(&self) -> usize {
        self.shared.cache.total_cost()
    }

    pub fn cache_statistics(&self) -> WindowStatistics {
        let stats = self.shared.cache.statistics();
        WindowStatistics {
            hit_rate: stats.hit_rate(),
            loaded_count: stats.current_count,
            memory_usage_mb: bytes_to_mb(stats.total_cost),
        }
    }

    /// Evict until usage drops to the pressure target, if over the limit
    pub fn handle_memory_pressure(&self) -> usize {
        handle_memory_pressure(&self.shared)
    }

    /// Change base window W. Takes effect on the next recenter.
    pub fn set_base_window(&self, base: usize) {
        let mut state = self.shared.state();
        let base = base.max(1);
        if state.base != base {
            info!("Window base size: {} -> {}", state.base, base);
            state.base = base;
            state.boost = 0;
        }
    }

    pub fn base_window(&self) -> usize {
        self.shared.state().base
    }

    /// Effective half-window
    pub fn window_half(&self) -> usize {
        self.shared.state().half
    }

    /// Active window `[start, end]` from the last recenter
    pub fn window_bounds(&self) -> Option<(usize, usize)> {
        self.shared.state().bounds
    }

    pub fn center(&self) -> usize {
        self.shared.state().center
    }

    /// Ids with a live decode
    pub fn in_flight(&self) -> Vec<(ItemId, usize)> {
        self.shared
            .state()
            .in_flight
            .iter()
            .filter(|(_, f)| !f.token.is_cancelled())
            .map(|(id, f)| (*id, f.index))
            .collect()
    }

    pub fn completed_decodes(&self) -> u64 {
        self.shared.state().completed
    }
}

/// Indices from `center` outward: c, c+1, c-1, c+2, c-2, ... within [start, end]
fn spiral(center: usize, start: usize, end: usize) -> impl Iterator<Item = usize> {
    let reach = (end - center).max(center - start);
    std::iter::once(center).chain((1..=reach).flat_map(move |d| {
        let after = (center + d <= end).then_some(center + d);
        let before = center.checked_sub(d).filter(|i| *i >= start);
        after.into_iter().chain(before)
    }))
}

fn run_decode(shared: &Arc<Shared>, id: ItemId, index: usize, locator: &Locator, token: &CancelToken) {
    let result = shared.decoder.decode(locator, token);

    let mut state = shared.state();
    if state.in_flight.get(&id).is_some_and(|f| f.token.same_task(token)) {
        state.in_flight.remove(&id);
    }

    // Cancelled tasks never store, even if the decode finished
    if token.is_cancelled() {
        trace!("Discarded cancelled decode {} (#{})", id, index);
        shared.registry.release(id, token);
        return;
    }

    match result {
        Ok(image) => {
            let evicted = store_decoded(&shared.cache, &shared.budget, id, Arc::new(image));
            shared.registry.release(id, token);
            state.completed += 1;
            let tune = state.completed % TUNE_EVERY == 0;
            if tune {
                self_tune(shared, &mut state);
            }
            drop(state);

            shared.emit_evicted(evicted);
            shared.bus.emit(LoadEvent::Loaded { id, index, source: LoadSource::Window });
        }
        Err(LoadError::Cancelled) => {
            shared.registry.release(id, token);
        }
        Err(e) => {
            warn!("Window decode failed for #{}: {}", index, e);
            shared.registry.release(id, token);
            state.completed += 1;
            if state.completed % TUNE_EVERY == 0 {
                self_tune(shared, &mut state);
            }
            drop(state);
            shared.bus.emit(LoadEvent::Failed { id, index, reason: e.to_string() });
        }
    }
}

/// Grow the window when the recent hit rate is poor and there's room below W
fn self_tune(shared: &Shared, state: &mut WindowState) {
    let hits = shared.cache.stats().hits();
    let misses = shared.cache.stats().misses();
    let period_hits = hits.saturating_sub(state.tune_hits);
    let period_total = period_hits + misses.saturating_sub(state.tune_misses);
    state.tune_hits = hits;
    state.tune_misses = misses;

    if period_total == 0 {
        return;
    }
    let hit_rate = period_hits as f64 / period_total as f64;
    if hit_rate >= TUNE_HIT_RATE || state.half >= state.base {
        return;
    }

    let step = if shared.budget.is_comfortable(shared.cache.total_cost()) {
        TUNE_STEP_COMFORTABLE
    } else {
        TUNE_STEP
    };
    let grown = state.half.saturating_add(step).min(state.base);
    state.boost += grown - state.half;
    info!(
        "Window self-tune: hit rate {:.2} < {:.2}, half {} -> {}",
        hit_rate, TUNE_HIT_RATE, state.half, grown
    );
    state.half = grown;
}

fn handle_memory_pressure(shared: &Shared) -> usize {
    let usage = shared.cache.total_cost();
    if !shared.budget.is_over(usage) {
        return 0;
    }
    let target = shared.budget.pressure_target();
    let evicted = shared.cache.shrink_to_cost(target);
    let count = evicted.len();
    debug!(
        "Memory pressure: {:.1} MB > {:.1} MB, evicted {} to reach {:.1} MB",
        bytes_to_mb(usage),
        bytes_to_mb(shared.budget.limit_bytes()),
        count,
        bytes_to_mb(target)
    );
    shared.emit_evicted(evicted);
    count
}
