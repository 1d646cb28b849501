//! End-to-end navigation scenarios across all loaders

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use imgwin::config::LoaderConfig;
use imgwin::core::window_loader::{adaptive_half_window, TUNE_STEP};
use imgwin::core::{
    DecodeRegistry, EventBus, ImageCache, LoadEvent, MemoryBudget, Navigator, Preloader, WindowLoader, Workers,
};
use imgwin::entities::{synthetic_items, DecodedImage, Item, ItemId, LoadError, SyntheticDecoder};

fn file_items(n: usize) -> Vec<Item> {
    (0..n).map(|i| Item::from_path(format!("{}.png", i))).collect()
}

fn index_of(items: &[Item]) -> HashMap<ItemId, usize> {
    items.iter().enumerate().map(|(i, it)| (it.id, i)).collect()
}

fn config(window: usize, max_memory_mb: usize) -> LoaderConfig {
    LoaderConfig {
        window_size: window,
        max_concurrent_loads: 4,
        max_memory_mb,
        worker_threads: 4,
        ..LoaderConfig::default()
    }
}

fn pump_until(nav: &Navigator, done: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !done() && Instant::now() < deadline {
        nav.run_ui_tasks();
        std::thread::sleep(Duration::from_millis(1));
    }
    nav.run_ui_tasks();
}

#[test]
fn window_bound_holds_across_moves() {
    let decoder = Arc::new(SyntheticDecoder::new(Duration::from_millis(1)));
    let nav = Navigator::new(config(10, 256), decoder);
    let items = file_items(1_000);
    let positions = index_of(&items);

    for center in [100usize, 105, 140, 600, 598, 990] {
        nav.on_position_changed(center, &items);

        let (start, end) = nav.window().window_bounds().unwrap();
        for (_, index) in nav.window().in_flight() {
            assert!(index >= start && index <= end, "in-flight #{} outside [{}, {}]", index, start, end);
        }

        assert!(nav.wait_idle(Duration::from_secs(10)));
        let radius = 2 * nav.window().base_window().max(nav.window().window_half());
        for id in nav.cache().ids() {
            let index = positions[&id];
            assert!(
                index + radius >= center && index <= center + radius,
                "resident #{} outside buffer zone of {}",
                index,
                center
            );
        }
    }
}

#[test]
fn no_item_has_two_active_decodes() {
    let decoder = Arc::new(SyntheticDecoder::new(Duration::from_millis(300)));
    let nav = Navigator::new(config(20, 256), decoder);
    let items = file_items(2_000);
    let positions = index_of(&items);

    let check = |nav: &Navigator| {
        let queued: HashSet<ItemId> = nav.preloader().queued_ids().into_iter().collect();
        let running: HashSet<ItemId> = nav.preloader().running_ids().into_iter().collect();
        let window: HashSet<ItemId> = nav.window().in_flight().into_iter().map(|(id, _)| id).collect();
        assert!(queued.is_disjoint(&running));
        assert!(window.is_disjoint(&queued));
        assert!(window.is_disjoint(&running));
        if let Some(target) = nav.emergency().current_target() {
            assert!(!queued.contains(&target));
            assert!(!running.contains(&target));
            assert!(!window.contains(&target));
        }
    };

    nav.on_position_changed(500, &items);
    check(&nav);
    nav.on_position_changed(503, &items);
    check(&nav);

    // Take over an item the preloader is decoding right now
    let running = nav.preloader().running_ids();
    assert!(!running.is_empty());
    let stolen = positions[&running[0]];
    nav.emergency().load_emergency(&items[stolen], stolen, |_| {});
    check(&nav);
    assert!(nav.emergency().is_emergency_loading(&items[stolen].id));

    nav.on_jump(1_500, &items, |_| {});
    check(&nav);

    nav.clear();
    assert!(nav.wait_idle(Duration::from_secs(10)));
    nav.run_ui_tasks();
    assert!(nav.registry().is_empty());
}

#[test]
fn only_the_latest_jump_succeeds() {
    let decoder = Arc::new(SyntheticDecoder::default());
    let nav = Navigator::new(config(10, 256), decoder);
    let items = synthetic_items(10_000, 4, 4);
    let outcomes: Arc<Mutex<Vec<(usize, Result<(), LoadError>)>>> = Arc::default();

    // No UI pumping in between: every earlier jump is superseded before delivery
    for (n, target) in [10usize, 5_000, 77, 9_999, 4_242].into_iter().enumerate() {
        let outcomes = Arc::clone(&outcomes);
        nav.on_jump(target, &items, move |r| outcomes.lock().unwrap().push((n, r.map(|_| ()))));
    }
    assert!(nav.wait_idle(Duration::from_secs(10)));
    pump_until(&nav, || outcomes.lock().unwrap().len() == 5);

    let outcomes = outcomes.lock().unwrap();
    assert_eq!(outcomes.len(), 5);
    let succeeded: Vec<usize> = outcomes.iter().filter(|o| o.1.is_ok()).map(|o| o.0).collect();
    assert_eq!(succeeded, vec![4]);
    assert!(outcomes.iter().filter(|o| o.0 != 4).all(|o| o.1 == Err(LoadError::Cancelled)));
}

#[test]
fn slow_jump_is_preempted_by_fast_one() {
    let decoder = Arc::new(SyntheticDecoder::default());
    let items = file_items(100);
    decoder.set_latency(&items[10].locator, Duration::from_millis(500));
    let nav = Navigator::new(config(5, 256), decoder.clone());
    let (tx, rx) = crossbeam_channel::unbounded();

    let a = tx.clone();
    nav.on_jump(10, &items, move |r| a.send(("a", r.is_ok())).unwrap());
    let b = tx;
    nav.on_jump(90, &items, move |r| b.send(("b", r.is_ok())).unwrap());

    pump_until(&nav, || rx.len() == 2);
    let got: Vec<_> = rx.try_iter().collect();
    assert_eq!(got.iter().filter(|g| g.0 == "b" && g.1).count(), 1);
    assert!(!got.iter().any(|g| g.0 == "a" && g.1));
    assert!(!nav.cache().contains(&items[10].id));
}

#[test]
fn memory_stays_under_ceiling() {
    let decoder = Arc::new(SyntheticDecoder::default());
    let nav = Navigator::new(config(50, 1), decoder);
    // 100x100 RGBA = 40 000 bytes; the window alone wants ~4 MB
    let items = synthetic_items(200, 100, 100);
    let limit = 1024 * 1024;

    for center in [100usize, 110, 120] {
        nav.on_position_changed(center, &items);
        assert!(nav.wait_idle(Duration::from_secs(10)));
        assert!(nav.window().memory_usage_estimate() <= limit);
    }

    nav.window().handle_memory_pressure();
    assert!(nav.window().memory_usage_estimate() <= limit);
}

#[test]
fn aggressive_pressure_targets_half() {
    let cache = Arc::new(ImageCache::new(10_000, usize::MAX));
    let budget = Arc::new(MemoryBudget::new(1, true));
    let loader = WindowLoader::new(
        50,
        Arc::clone(&cache),
        Arc::clone(&budget),
        Arc::new(DecodeRegistry::new()),
        Arc::new(SyntheticDecoder::default()),
        Arc::new(Workers::new(4)),
        EventBus::new(),
    );
    let items = synthetic_items(100, 100, 100);
    for it in &items[..40] {
        cache.set(it.id, Arc::new(DecodedImage::filled(100, 100, [0; 4])), None);
    }
    assert!(loader.memory_usage_estimate() > budget.limit_bytes());

    loader.handle_memory_pressure();
    assert!(loader.memory_usage_estimate() <= budget.limit_bytes() / 2);
}

#[test]
fn preloader_drains_by_distance() {
    let cache = Arc::new(ImageCache::new(1_000, usize::MAX));
    let decoder = Arc::new(SyntheticDecoder::new(Duration::from_millis(5)));
    let workers = Arc::new(Workers::new(2));
    let preloader = Preloader::new(
        5,
        1,
        Arc::clone(&cache),
        Arc::new(MemoryBudget::new(256, false)),
        Arc::new(DecodeRegistry::new()),
        decoder.clone(),
        Arc::clone(&workers),
        EventBus::new(),
    );
    let items = file_items(11);
    // Only distances 0, 1, 2 and 5 from center 5 are missing
    let missing = [5usize, 6, 7, 10];
    for (i, it) in items.iter().enumerate() {
        if !missing.contains(&i) {
            cache.set(it.id, Arc::new(DecodedImage::filled(1, 1, [0; 4])), None);
        }
    }

    preloader.schedule(&items, 5, None);
    assert!(workers.wait_idle(Duration::from_secs(10)));
    assert_eq!(decoder.calls(), vec!["5.png", "6.png", "7.png", "10.png"]);
}

#[test]
fn twelve_thousand_items_window() {
    assert_eq!(adaptive_half_window(12_000, 50), 200);

    let decoder = Arc::new(SyntheticDecoder::default());
    let nav = Navigator::new(config(50, 256), decoder);
    let items = synthetic_items(12_000, 1, 1);
    nav.on_position_changed(6_000, &items);

    assert_eq!(nav.window().window_bounds(), Some((5_800, 6_200)));
    assert!(nav.wait_idle(Duration::from_secs(10)));
    assert!(nav.load_state(5_800, &items).is_loaded());
    assert!(nav.load_state(6_200, &items).is_loaded());
    assert!(!nav.load_state(6_201, &items).is_loaded());
}

#[test]
fn count_limit_keeps_fifty() {
    let cache = ImageCache::new(50, usize::MAX);
    let items = synthetic_items(51, 2, 2);
    for it in &items {
        cache.set(it.id, Arc::new(DecodedImage::filled(2, 2, [0; 4])), None);
    }
    assert_eq!(cache.len(), 50);
    assert!(cache.statistics().current_count <= 50);
    assert!(!cache.contains(&items[0].id));
    assert!(cache.contains(&items[50].id));
}

#[test]
fn self_tune_grows_by_ten_when_memory_is_tight() {
    let cache = Arc::new(ImageCache::new(10_000, usize::MAX));
    let budget = Arc::new(MemoryBudget::new(1, false));
    // File locators decode to 8x8 = 256 bytes; 50 of them exceed half of this
    budget.set_limit_bytes(20_000);
    let bus = EventBus::new();
    let events = bus.subscribe();
    let loader = WindowLoader::new(
        100,
        Arc::clone(&cache),
        Arc::clone(&budget),
        Arc::new(DecodeRegistry::new()),
        Arc::new(SyntheticDecoder::default()),
        Arc::new(Workers::new(4)),
        bus,
    );
    let items = file_items(60);

    // One hit, one miss: 50% hit rate
    let warm = Item::from_path("warm.png");
    cache.set(warm.id, Arc::new(DecodedImage::filled(1, 1, [0; 4])), None);
    assert!(loader.image(&warm.id).is_some());
    assert!(loader.image(&items[0].id).is_none());

    loader.set_window_center(30, &items);
    assert_eq!(loader.window_half(), 60);

    let mut loaded = 0;
    while loaded < 60 {
        if let LoadEvent::Loaded { .. } = events.recv_timeout(Duration::from_secs(10)).unwrap() {
            loaded += 1;
        }
    }
    assert_eq!(loader.window_half(), 60 + TUNE_STEP);
}
