//! Navigator - routes navigation events to the loaders
//!
//! Owns the shared pieces (worker pool, cache, registry, memory budget,
//! event bus) and the three loaders built on them:
//! - sequential movement recenters the window and re-ranks the preload queue
//! - a jump goes straight to the emergency loader, bypassing both
//!
//! Lock order is component state first, then cache/registry. The registry
//! and cache never call back out, so no cycle exists.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use serde::Serialize;

use super::emergency::{EmergencyLoader, EmergencyResult, EmergencyStatistics};
use super::event_bus::{EventBus, LoadEvent};
use super::image_cache::{CacheStatistics, ImageCache};
use super::memory::{bytes_to_mb, MemoryBudget};
use super::preloader::{preload_radius, PreloadStatistics, Preloader};
use super::registry::{DecodeOwner, DecodeRegistry};
use super::window_loader::{WindowLoader, WindowStatistics};
use super::workers::Workers;
use crate::config::LoaderConfig;
use crate::entities::{DecodedImage, ImageDecoder, Item, ItemId, LoadState};

/// Everything a diagnostics surface shows
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NavigatorStatistics {
    pub cache: CacheStatistics,
    pub window: WindowStatistics,
    pub preload: PreloadStatistics,
    pub emergency: EmergencyStatistics,
    pub window_half: usize,
    pub window_bounds: Option<(usize, usize)>,
    pub memory_limit_mb: f64,
    pub pending_tasks: usize,
}

#[derive(Debug, Default)]
struct Position {
    current: Option<usize>,
    /// Center of the last full preload schedule
    scheduled_at: Option<usize>,
    /// Collection size at that schedule
    scheduled_len: usize,
}

pub struct Navigator {
    config: Mutex<LoaderConfig>,
    workers: Arc<Workers>,
    bus: EventBus,
    cache: Arc<ImageCache>,
    budget: Arc<MemoryBudget>,
    registry: Arc<DecodeRegistry>,
    window: WindowLoader,
    preloader: Preloader,
    emergency: EmergencyLoader,
    position: Mutex<Position>,
    /// Own subscription, feeds `failures`
    events: Receiver<LoadEvent>,
    failures: Mutex<HashMap<ItemId, String>>,
}

impl Navigator {
    pub fn new(config: LoaderConfig, decoder: Arc<dyn ImageDecoder>) -> Self {
        let workers = Arc::new(Workers::new(config.effective_worker_threads()));
        let bus = EventBus::new();
        let budget = Arc::new(MemoryBudget::new(
            config.max_memory_mb,
            config.aggressive_memory_management,
        ));
        let cache = Arc::new(ImageCache::new(
            config.cache_count_limit,
            cache_cost_limit(&config, &budget),
        ));
        cache.set_eviction_order(config.eviction_order);
        let registry = Arc::new(DecodeRegistry::new());

        let window = WindowLoader::new(
            config.window_size,
            Arc::clone(&cache),
            Arc::clone(&budget),
            Arc::clone(&registry),
            Arc::clone(&decoder),
            Arc::clone(&workers),
            bus.clone(),
        );
        let preloader = Preloader::new(
            config.window_size,
            config.effective_max_concurrent(),
            Arc::clone(&cache),
            Arc::clone(&budget),
            Arc::clone(&registry),
            Arc::clone(&decoder),
            Arc::clone(&workers),
            bus.clone(),
        );
        let emergency = EmergencyLoader::new(
            Arc::clone(&cache),
            Arc::clone(&budget),
            Arc::clone(&registry),
            decoder,
            Arc::clone(&workers),
            bus.clone(),
        );
        let events = bus.subscribe();

        info!(
            "Navigator ready: W={}, {} workers, {} concurrent preloads, memory limit {:.0} MB",
            config.window_size,
            workers.threads(),
            preloader.max_concurrent(),
            bytes_to_mb(budget.limit_bytes())
        );

        Self {
            config: Mutex::new(config),
            workers,
            bus,
            cache,
            budget,
            registry,
            window,
            preloader,
            emergency,
            position: Mutex::new(Position::default()),
            events,
            failures: Mutex::new(HashMap::new()),
        }
    }

    fn position(&self) -> MutexGuard<'_, Position> {
        self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sequential movement to `index`.
    ///
    /// Recenters the window. The preload queue is re-ranked for small moves
    /// and rebuilt once the position drifts a quarter radius away from the
    /// last schedule.
    pub fn on_position_changed(&self, index: usize, items: &[Item]) {
        self.absorb_events();
        if items.is_empty() {
            return;
        }
        let index = index.min(items.len() - 1);
        let radius = preload_radius(items.len(), self.window.base_window());

        let mut pos = self.position();
        pos.current = Some(index);
        let reschedule = match pos.scheduled_at {
            Some(at) => pos.scheduled_len != items.len() || at.abs_diff(index) > (radius / 4).max(1),
            None => true,
        };

        // Preloader first so the nearest items start in priority order;
        // the window then covers whatever remains unclaimed.
        if reschedule {
            self.preloader.schedule(items, index, None);
            pos.scheduled_at = Some(index);
            pos.scheduled_len = items.len();
        } else {
            self.preloader.reprioritize(items, index);
        }
        drop(pos);

        self.window.set_window_center(index, items);
    }

    /// Discontinuous jump to `index` (progress-bar scrub).
    ///
    /// Queued preloads are dropped and the target is decoded on the urgent
    /// lane. `completion` runs from `run_ui_tasks()`. The window is left
    /// alone; report the settled position through `on_position_changed`.
    /// Returns false when `index` is out of range.
    pub fn on_jump<F>(&self, index: usize, items: &[Item], completion: F) -> bool
    where
        F: FnOnce(EmergencyResult) + Send + 'static,
    {
        self.absorb_events();
        let Some(item) = items.get(index) else {
            warn!("Jump to #{} outside collection of {}", index, items.len());
            return false;
        };

        self.preloader.cancel_all();
        {
            let mut pos = self.position();
            pos.current = Some(index);
            pos.scheduled_at = None;
        }
        debug!("Jump to #{}", index);
        self.emergency.load_emergency(item, index, completion);
        true
    }

    /// Jump that also pulls `neighbours` items on each side, waiting for all.
    ///
    /// Blocks; meant for background callers such as thumbnail strips.
    pub fn jump_with_neighbours(
        &self,
        index: usize,
        items: &[Item],
        neighbours: usize,
    ) -> HashMap<ItemId, Arc<DecodedImage>> {
        let Some(primary) = items.get(index) else {
            return HashMap::new();
        };
        let start = index.saturating_sub(neighbours);
        let end = index.saturating_add(neighbours).min(items.len() - 1);
        let targets: Vec<(usize, Item)> = (start..=end).map(|i| (i, items[i].clone())).collect();

        self.preloader.cancel_all();
        {
            let mut pos = self.position();
            pos.current = Some(index);
            pos.scheduled_at = None;
        }
        self.emergency.load_multiple_emergency(&targets, primary.id)
    }

    /// Resident image at `index`; counts a cache hit or miss
    pub fn image(&self, index: usize, items: &[Item]) -> Option<Arc<DecodedImage>> {
        items.get(index).and_then(|item| self.window.image(&item.id))
    }

    /// Load state of the item at `index`, derived from residency, active
    /// decodes and the last failure seen for it
    pub fn load_state(&self, index: usize, items: &[Item]) -> LoadState {
        self.absorb_events();
        let Some(item) = items.get(index) else {
            return LoadState::NotLoaded;
        };
        if let Some(image) = self.cache.peek(&item.id) {
            return LoadState::Loaded(image);
        }
        // A queued preload is only a plan, not a running decode
        match self.registry.owner(&item.id) {
            Some(DecodeOwner::PreloadQueued) | None => {}
            Some(_) => return LoadState::Loading,
        }
        let failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        match failures.get(&item.id) {
            Some(reason) => LoadState::Failed(reason.clone()),
            None => LoadState::NotLoaded,
        }
    }

    /// Fold pending events into the failure record
    fn absorb_events(&self) {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        for event in self.events.try_iter() {
            match event {
                LoadEvent::Failed { id, reason, .. } => {
                    failures.insert(id, reason);
                }
                LoadEvent::Loaded { id, .. } => {
                    failures.remove(&id);
                }
                LoadEvent::Evicted { .. } => {}
            }
        }
    }

    /// Apply a new configuration at runtime.
    ///
    /// Memory limits take effect immediately, including a pressure pass.
    /// `worker_threads` only applies to a new navigator.
    pub fn apply_config(&self, config: LoaderConfig) {
        let mut current = self.config.lock().unwrap_or_else(|e| e.into_inner());
        if config.worker_threads != current.worker_threads {
            info!("worker_threads change applies on restart");
        }

        self.budget.set_limit_mb(config.max_memory_mb);
        self.budget.set_aggressive(config.aggressive_memory_management);
        self.cache.set_eviction_order(config.eviction_order);
        // Pressure pass before the new hard limit clamps usage to 100%
        let mut freed = self.window.handle_memory_pressure();
        let evicted = self
            .cache
            .set_limits(config.cache_count_limit, cache_cost_limit(&config, &self.budget));
        freed += evicted.len();
        for id in evicted {
            self.bus.emit(LoadEvent::Evicted { id });
        }

        self.window.set_base_window(config.window_size);
        self.preloader.set_window_size(config.window_size);
        self.preloader.set_max_concurrent(config.effective_max_concurrent());

        info!(
            "Config applied: W={}, limit {:.0} MB, aggressive={}, freed {} entries",
            config.window_size,
            bytes_to_mb(self.budget.limit_bytes()),
            config.aggressive_memory_management,
            freed
        );
        *current = config;
    }

    pub fn config(&self) -> LoaderConfig {
        self.config.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Current position as last reported
    pub fn current(&self) -> Option<usize> {
        self.position().current
    }

    /// Drop every resident image and all pending work
    pub fn clear(&self) {
        self.preloader.cancel_all();
        if let Some(target) = self.emergency.current_target() {
            self.emergency.cancel_emergency(&target);
        }
        self.window.clear();
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).clear();
        *self.position() = Position::default();
    }

    pub fn statistics(&self) -> NavigatorStatistics {
        NavigatorStatistics {
            cache: self.cache.statistics(),
            window: self.window.cache_statistics(),
            preload: self.preloader.statistics(),
            emergency: self.emergency.statistics(),
            window_half: self.window.window_half(),
            window_bounds: self.window.window_bounds(),
            memory_limit_mb: bytes_to_mb(self.budget.limit_bytes()),
            pending_tasks: self.workers.pending(),
        }
    }

    /// New receiver for load events
    pub fn subscribe(&self) -> Receiver<LoadEvent> {
        self.bus.subscribe()
    }

    /// Run completions queued for the UI context; call from the UI loop
    pub fn run_ui_tasks(&self) -> usize {
        self.bus.run_ui_tasks()
    }

    /// Block until no background work is pending
    pub fn wait_idle(&self, timeout: std::time::Duration) -> bool {
        self.workers.wait_idle(timeout)
    }

    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<DecodeRegistry> {
        &self.registry
    }

    pub fn window(&self) -> &WindowLoader {
        &self.window
    }

    pub fn preloader(&self) -> &Preloader {
        &self.preloader
    }

    pub fn emergency(&self) -> &EmergencyLoader {
        &self.emergency
    }
}

/// Cache cost limit in bytes; 0 MB follows the memory budget
fn cache_cost_limit(config: &LoaderConfig, budget: &MemoryBudget) -> usize {
    match config.cache_cost_limit_mb {
        0 => budget.limit_bytes(),
        mb => mb.saturating_mul(1024 * 1024),
    }
}
