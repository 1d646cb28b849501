//! Emergency loader for discontinuous jumps
//!
//! A progress-bar scrub needs the requested frame *now*, regardless of
//! window membership or preload priority. This loader decodes exactly one
//! target on the urgent worker lane. A new request always cancels the
//! previous one: the most recent jump wins.
//!
//! State: Idle -> Loading(target) -> Delivered | Cancelled | Failed -> Idle
//! The slot is released when the completion runs on the UI context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::unbounded;
use log::{debug, info, trace, warn};
use serde::Serialize;

use super::cancel::CancelToken;
use super::event_bus::{EventBus, LoadEvent, LoadSource};
use super::image_cache::ImageCache;
use super::memory::{store_decoded, MemoryBudget};
use super::registry::{DecodeOwner, DecodeRegistry};
use super::workers::{Lane, Workers};
use crate::entities::{DecodedImage, ImageDecoder, Item, ItemId, LoadError};

/// Result handed to an emergency completion
pub type EmergencyResult = Result<Arc<DecodedImage>, LoadError>;

/// Completion callback; always invoked from `EventBus::run_ui_tasks()`
pub type EmergencyCompletion = Box<dyn FnOnce(EmergencyResult) + Send + 'static>;

#[derive(Debug)]
struct Slot {
    target: ItemId,
    token: CancelToken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EmergencyStatistics {
    pub requests: u64,
    pub delivered: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    delivered: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

struct Shared {
    cache: Arc<ImageCache>,
    budget: Arc<MemoryBudget>,
    registry: Arc<DecodeRegistry>,
    decoder: Arc<dyn ImageDecoder>,
    workers: Arc<Workers>,
    bus: EventBus,
    slot: Mutex<Option<Slot>>,
    counters: Counters,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Option<Slot>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cancel whatever occupies the slot
    fn supersede(&self, slot: &mut Option<Slot>) {
        if let Some(prev) = slot.take() {
            prev.token.cancel();
            self.registry.release(prev.target, &prev.token);
            debug!("Emergency load for {} superseded", prev.target);
        }
    }

    /// Back to Idle if `token` still owns the slot
    fn finish(&self, token: &CancelToken) {
        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|s| s.token.same_task(token)) {
            *slot = None;
        }
    }

    /// Store a fresh result and announce it
    fn store(&self, id: ItemId, index: usize, image: &Arc<DecodedImage>) {
        let evicted = store_decoded(&self.cache, &self.budget, id, Arc::clone(image));
        for evicted_id in evicted {
            self.bus.emit(LoadEvent::Evicted { id: evicted_id });
        }
        self.bus.emit(LoadEvent::Loaded { id, index, source: LoadSource::Emergency });
    }
}

/// Single-slot preemptive loader. Cheap to clone; clones share the slot.
#[derive(Clone)]
pub struct EmergencyLoader {
    shared: Arc<Shared>,
}

impl EmergencyLoader {
    pub fn new(
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
                slot: Mutex::new(None),
                counters: Counters::default(),
            }),
        }
    }

    /// Decode `item` (at `index`) immediately, cancelling any earlier request.
    ///
    /// `completion` runs on the UI context exactly once: with the image, with
    /// the decode error, or with `LoadError::Cancelled` if a newer request
    /// (or `cancel_emergency`) got there first.
    pub fn load_emergency<F>(&self, item: &Item, index: usize, completion: F)
    where
        F: FnOnce(EmergencyResult) + Send + 'static,
    {
        let shared = &self.shared;
        shared.counters.requests.fetch_add(1, Ordering::Relaxed);
        let token = CancelToken::new();
        {
            let mut slot = shared.slot();
            shared.supersede(&mut slot);

            *slot = Some(Slot { target: item.id, token: token.clone() });

            // Already resident: deliver without decoding
            if let Some(image) = shared.cache.peek(&item.id) {
                trace!("Emergency target {} already resident", item.id);
                drop(slot);
                self.deliver(token, Ok(image), Box::new(completion));
                return;
            }

            if let Some(prev) = shared.registry.preempt(item.id, DecodeOwner::Emergency, &token) {
                debug!("Emergency took {} over from {:?}", item.id, prev);
            }
        }
        info!("Emergency load #{} ({})", index, item.locator);

        let worker_shared = Arc::clone(shared);
        let id = item.id;
        let locator = item.locator.clone();
        let this = self.clone();
        shared.workers.execute(Lane::Urgent, move || {
            let result = worker_shared.decoder.decode(&locator, &token);
            let result = match result {
                Ok(image) if !token.is_cancelled() => {
                    let image = Arc::new(image);
                    worker_shared.store(id, index, &image);
                    Ok(image)
                }
                Ok(_) => Err(LoadError::Cancelled),
                Err(e) => Err(e),
            };
            if let Err(ref e) = result {
                if !e.is_cancelled() {
                    warn!("Emergency decode failed for #{}: {}", index, e);
                }
            }
            worker_shared.registry.release(id, &token);
            this.deliver(token, result, Box::new(completion));
        });
    }

    /// Hop to the UI context; a token cancelled in the meantime turns the
    /// result into `Cancelled`. The slot stays occupied until delivery.
    fn deliver(&self, token: CancelToken, result: EmergencyResult, completion: EmergencyCompletion) {
        let shared = Arc::clone(&self.shared);
        self.shared.bus.post_ui(move || {
            shared.finish(&token);
            let result = if token.is_cancelled() { Err(LoadError::Cancelled) } else { result };
            let counter = match &result {
                Ok(_) => &shared.counters.delivered,
                Err(LoadError::Cancelled) => &shared.counters.cancelled,
                Err(_) => &shared.counters.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            completion(result);
        });
    }

    /// Cancel the outstanding request if it targets `id`
    pub fn cancel_emergency(&self, id: &ItemId) -> bool {
        let mut slot = self.shared.slot();
        if slot.as_ref().is_some_and(|s| s.target == *id) {
            self.shared.supersede(&mut slot);
            true
        } else {
            false
        }
    }

    pub fn is_emergency_loading(&self, id: &ItemId) -> bool {
        self.shared
            .slot()
            .as_ref()
            .is_some_and(|s| s.target == *id && !s.token.is_cancelled())
    }

    /// Target of the outstanding request, if any
    pub fn current_target(&self) -> Option<ItemId> {
        self.shared.slot().as_ref().map(|s| s.target)
    }

    /// Decode a primary target on the urgent lane plus secondary targets
    /// (e.g. its neighbours) on the normal lane, and wait for all of them.
    ///
    /// Blocks the caller; don't call from the UI thread. Best effort: failed
    /// or skipped secondaries are simply missing from the map. The batch
    /// occupies the emergency slot, so a later `load_emergency` cancels it
    /// and whatever finished so far is returned.
    pub fn load_multiple_emergency(
        &self,
        targets: &[(usize, Item)],
        primary: ItemId,
    ) -> HashMap<ItemId, Arc<DecodedImage>> {
        let shared = &self.shared;
        shared.counters.requests.fetch_add(1, Ordering::Relaxed);
        let token = CancelToken::new();
        let mut images = HashMap::new();
        let (tx, rx) = unbounded();
        let mut launched = 0usize;

        {
            let mut slot = shared.slot();
            shared.supersede(&mut slot);
            *slot = Some(Slot { target: primary, token: token.clone() });

            for (index, item) in targets {
                if let Some(image) = shared.cache.peek(&item.id) {
                    images.insert(item.id, image);
                    continue;
                }
                let is_primary = item.id == primary;
                let claimed = if is_primary {
                    shared.registry.preempt(item.id, DecodeOwner::Emergency, &token);
                    true
                } else {
                    // Already decoding elsewhere; it'll land in the cache anyway
                    shared.registry.claim_or_take_queued(item.id, DecodeOwner::Emergency, &token)
                };
                if !claimed {
                    continue;
                }

                let lane = if is_primary { Lane::Urgent } else { Lane::Normal };
                let worker_shared = Arc::clone(shared);
                let token = token.clone();
                let tx = tx.clone();
                let id = item.id;
                let index = *index;
                let locator = item.locator.clone();
                shared.workers.execute(lane, move || {
                    let result = worker_shared.decoder.decode(&locator, &token);
                    let result = match result {
                        Ok(image) if !token.is_cancelled() => {
                            let image = Arc::new(image);
                            worker_shared.store(id, index, &image);
                            Ok(image)
                        }
                        Ok(_) => Err(LoadError::Cancelled),
                        Err(e) => Err(e),
                    };
                    worker_shared.registry.release(id, &token);
                    let _ = tx.send((id, index, result));
                });
                launched += 1;
            }
        }
        drop(tx);

        for _ in 0..launched {
            let Ok((id, index, result)) = rx.recv() else { break };
            match result {
                Ok(image) => {
                    images.insert(id, image);
                }
                Err(LoadError::Cancelled) => {}
                Err(e) if id == primary => warn!("Emergency primary #{} failed: {}", index, e),
                Err(e) => debug!("Emergency secondary #{} skipped: {}", index, e),
            }
        }

        shared.finish(&token);
        let counter = if token.is_cancelled() {
            &shared.counters.cancelled
        } else if images.contains_key(&primary) {
            &shared.counters.delivered
        } else {
            &shared.counters.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        images
    }

    pub fn statistics(&self) -> EmergencyStatistics {
        let c = &self.shared.counters;
        EmergencyStatistics {
            requests: c.requests.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::SyntheticDecoder;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    struct Rig {
        loader: EmergencyLoader,
        cache: Arc<ImageCache>,
        registry: Arc<DecodeRegistry>,
        decoder: Arc<SyntheticDecoder>,
        workers: Arc<Workers>,
        bus: EventBus,
    }

    fn rig() -> Rig {
        let cache = Arc::new(ImageCache::new(1_000, usize::MAX));
        let registry = Arc::new(DecodeRegistry::new());
        let decoder = Arc::new(SyntheticDecoder::default());
        let workers = Arc::new(Workers::new(4));
        let bus = EventBus::new();
        let loader = EmergencyLoader::new(
            Arc::clone(&cache),
            Arc::new(MemoryBudget::new(1024, false)),
            Arc::clone(&registry),
            decoder.clone(),
            Arc::clone(&workers),
            bus.clone(),
        );
        Rig { loader, cache, registry, decoder, workers, bus }
    }

    fn item(name: &str) -> Item {
        Item::from_path(PathBuf::from(name))
    }

    /// Pump the UI queue until `done` or timeout
    fn pump(bus: &EventBus, done: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() && Instant::now() < deadline {
            bus.run_ui_tasks();
            std::thread::sleep(Duration::from_millis(1));
        }
        bus.run_ui_tasks();
    }

    type Outcomes = Arc<Mutex<Vec<(&'static str, Result<(), LoadError>)>>>;

    fn recorder(outcomes: &Outcomes, name: &'static str) -> impl FnOnce(EmergencyResult) + Send + 'static {
        let outcomes = Arc::clone(outcomes);
        move |result| outcomes.lock().unwrap().push((name, result.map(|_| ())))
    }

    #[test]
    fn test_delivers_on_ui_context() {
        let r = rig();
        let a = item("a");
        let outcomes: Outcomes = Arc::default();

        r.loader.load_emergency(&a, 7, recorder(&outcomes, "a"));
        assert!(r.workers.wait_idle(Duration::from_secs(5)));
        // Decoded, but not delivered until the UI loop runs
        assert!(outcomes.lock().unwrap().is_empty());
        assert!(r.cache.contains(&a.id));

        pump(&r.bus, || !outcomes.lock().unwrap().is_empty());
        assert_eq!(*outcomes.lock().unwrap(), vec![("a", Ok(()))]);
        assert!(!r.loader.is_emergency_loading(&a.id));
        assert!(r.registry.is_empty());
    }

    #[test]
    fn test_newer_request_preempts() {
        let r = rig();
        let a = item("a");
        let b = item("b");
        r.decoder.set_latency(&a.locator, Duration::from_millis(300));
        let outcomes: Outcomes = Arc::default();

        r.loader.load_emergency(&a, 1, recorder(&outcomes, "a"));
        assert!(r.loader.is_emergency_loading(&a.id));
        r.loader.load_emergency(&b, 2, recorder(&outcomes, "b"));
        assert!(!r.loader.is_emergency_loading(&a.id));
        assert!(r.loader.is_emergency_loading(&b.id));

        pump(&r.bus, || outcomes.lock().unwrap().len() == 2);
        assert!(r.workers.wait_idle(Duration::from_secs(5)));
        r.bus.run_ui_tasks();

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.iter().filter(|o| o.0 == "b" && o.1.is_ok()).count(), 1);
        assert!(!outcomes.iter().any(|o| o.0 == "a" && o.1.is_ok()));
        assert!(!r.cache.contains(&a.id));
        assert_eq!(r.loader.statistics().cancelled, 1);
    }

    #[test]
    fn test_cancel_emergency() {
        let r = rig();
        let a = item("a");
        r.decoder.set_latency(&a.locator, Duration::from_millis(200));
        let outcomes: Outcomes = Arc::default();

        r.loader.load_emergency(&a, 0, recorder(&outcomes, "a"));
        assert!(!r.loader.cancel_emergency(&item("other").id));
        assert!(r.loader.cancel_emergency(&a.id));
        assert_eq!(r.loader.current_target(), None);
        // Safe to repeat
        assert!(!r.loader.cancel_emergency(&a.id));

        pump(&r.bus, || !outcomes.lock().unwrap().is_empty());
        assert_eq!(*outcomes.lock().unwrap(), vec![("a", Err(LoadError::Cancelled))]);
    }

    #[test]
    fn test_failure_reported() {
        let r = rig();
        let a = item("broken");
        r.decoder.fail_on(&a.locator);
        let outcomes: Outcomes = Arc::default();

        r.loader.load_emergency(&a, 0, recorder(&outcomes, "a"));
        pump(&r.bus, || !outcomes.lock().unwrap().is_empty());
        let outcomes = outcomes.lock().unwrap();
        assert!(matches!(outcomes[0].1, Err(LoadError::DecodeFailure { .. })));
        assert_eq!(r.loader.statistics().failed, 1);
    }

    #[test]
    fn test_resident_target_skips_decode() {
        let r = rig();
        let a = item("a");
        r.cache.set(a.id, Arc::new(DecodedImage::filled(2, 2, [0; 4])), None);
        let outcomes: Outcomes = Arc::default();

        r.loader.load_emergency(&a, 0, recorder(&outcomes, "a"));
        pump(&r.bus, || !outcomes.lock().unwrap().is_empty());
        assert_eq!(r.decoder.call_count(), 0);
        assert_eq!(*outcomes.lock().unwrap(), vec![("a", Ok(()))]);
    }

    #[test]
    fn test_preempts_queued_preload() {
        let r = rig();
        let a = item("a");
        let queued = CancelToken::new();
        r.registry.try_claim(a.id, DecodeOwner::PreloadQueued, &queued);

        r.loader.load_emergency(&a, 0, |_| {});
        assert!(queued.is_cancelled());
        assert!(r.workers.wait_idle(Duration::from_secs(5)));
        assert!(r.cache.contains(&a.id));
    }

    #[test]
    fn test_batch_partial_results() {
        let r = rig();
        let targets: Vec<(usize, Item)> = (0..5).map(|i| (i, item(&format!("n{}", i)))).collect();
        let primary = targets[2].1.id;
        r.decoder.fail_on(&targets[4].1.locator);

        let images = r.loader.load_multiple_emergency(&targets, primary);
        assert_eq!(images.len(), 4);
        assert!(images.contains_key(&primary));
        assert!(!images.contains_key(&targets[4].1.id));
        assert_eq!(r.loader.current_target(), None);
        assert_eq!(r.loader.statistics().delivered, 1);
    }

    #[test]
    fn test_batch_cancelled_by_new_jump() {
        let r = rig();
        let targets: Vec<(usize, Item)> = (0..3).map(|i| (i, item(&format!("s{}", i)))).collect();
        for (_, it) in &targets {
            r.decoder.set_latency(&it.locator, Duration::from_millis(300));
        }
        let primary = targets[1].1.id;

        let batch_loader = r.loader.clone();
        let batch_targets = targets.clone();
        let handle = std::thread::spawn(move || batch_loader.load_multiple_emergency(&batch_targets, primary));

        std::thread::sleep(Duration::from_millis(30));
        r.loader.load_emergency(&item("jump"), 99, |_| {});

        let images = handle.join().unwrap();
        assert!(images.is_empty());
        assert!(r.workers.wait_idle(Duration::from_secs(5)));
        assert!(!r.cache.contains(&primary));
    }
}
