use imgwin::cli::Args;
use imgwin::config::LoaderConfig;
use imgwin::core::{LoadEvent, LoadSource, Navigator};
use imgwin::entities::{synthetic_items, FileDecoder, ImageDecoder, Item, SyntheticDecoder};
use imgwin::paths::{self, PathConfig};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Give up on a jump after this long
const JUMP_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    // Parse command-line arguments first (needed for log setup)
    let args = Args::parse();

    if args.pattern.is_none() && args.synthetic.is_none() {
        use clap::CommandFactory;
        let mut cmd = Args::command();
        let _ = cmd.print_help();
        println!();
        return Ok(());
    }

    let path_config = PathConfig::from_env_and_cli(args.config_dir.clone());
    if let Err(e) = paths::ensure_config_dir(&path_config) {
        eprintln!("Warning: Failed to create config directory: {}", e);
    }

    init_logging(&args, &path_config)?;
    info!("imgwin {} starting...", env!("CARGO_PKG_VERSION"));
    debug!("Command-line args: {:?}", args);

    let config_path = LoaderConfig::default_path(&path_config);
    info!("Config path: {}", config_path.display());
    let mut config = LoaderConfig::load_or_default(&config_path)?;
    apply_overrides(&mut config, &args);
    if args.save_config {
        config.save(&config_path)?;
    }

    let (items, decoder) = build_collection(&args)?;
    if items.is_empty() {
        bail!("No images matched");
    }
    info!("Collection: {} items", items.len());

    let navigator = Navigator::new(config, decoder);
    let events = navigator.subscribe();

    let started = Instant::now();
    simulate_sequential(&navigator, &items, &args);
    let jump_times = simulate_jumps(&navigator, &items, &args);

    if !navigator.wait_idle(Duration::from_secs(60)) {
        warn!("Background work still pending at exit");
    }
    navigator.run_ui_tasks();
    let tally = EventTally::drain(&events);

    let stats = navigator.statistics();
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Items:          {}", items.len());
    println!("Elapsed:        {:.2?}", started.elapsed());
    println!(
        "Cache:          {} / {} entries, {:.1} MB, hit rate {:.1}%",
        stats.cache.current_count,
        stats.cache.count_limit,
        stats.window.memory_usage_mb,
        stats.window.hit_rate * 100.0
    );
    println!(
        "Window:         half {} bounds {:?}, limit {:.0} MB",
        stats.window_half, stats.window_bounds, stats.memory_limit_mb
    );
    println!(
        "Preload:        {} ok, {} failed ({:.1}% success)",
        stats.preload.successful,
        stats.preload.failed,
        stats.preload.success_rate * 100.0
    );
    println!(
        "Emergency:      {} requests, {} delivered, {} cancelled, {} failed",
        stats.emergency.requests, stats.emergency.delivered, stats.emergency.cancelled, stats.emergency.failed
    );
    println!(
        "Events:         {} window, {} preload, {} emergency, {} failed, {} evicted",
        tally.window, tally.preload, tally.emergency, tally.failed, tally.evicted
    );
    if !jump_times.is_empty() {
        let total: Duration = jump_times.iter().sum();
        let worst = jump_times.iter().max().copied().unwrap_or_default();
        println!(
            "Jump latency:   avg {:.2?}, worst {:.2?}",
            total / jump_times.len() as u32,
            worst
        );
    }
    Ok(())
}

/// 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
fn init_logging(args: &Args, path_config: &PathConfig) -> Result<()> {
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| paths::data_file("imgwin.log", path_config));
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();

        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Console logging (respects RUST_LOG if set)
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn apply_overrides(config: &mut LoaderConfig, args: &Args) {
    if let Some(window) = args.window {
        config.window_size = window;
    }
    if let Some(mb) = args.max_mem {
        config.max_memory_mb = mb;
    }
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(concurrent) = args.concurrent {
        config.max_concurrent_loads = concurrent;
    }
    if args.aggressive {
        config.aggressive_memory_management = true;
    }
}

fn build_collection(args: &Args) -> Result<(Vec<Item>, Arc<dyn ImageDecoder>)> {
    if let Some(count) = args.synthetic {
        let (w, h) = (args.size[0], args.size[1]);
        let decoder: Arc<dyn ImageDecoder> =
            Arc::new(SyntheticDecoder::new(Duration::from_millis(args.latency_ms)));
        return Ok((synthetic_items(count, w, h), decoder));
    }

    let pattern = args.pattern.as_deref().unwrap_or_default();
    let mut files: Vec<_> = glob::glob(pattern)
        .with_context(|| format!("Invalid pattern: {}", pattern))?
        .filter_map(|entry| match entry {
            Ok(path) if path.is_file() => Some(path),
            Ok(_) => None,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                None
            }
        })
        .collect();
    files.sort();
    let items = files.into_iter().map(Item::from_path).collect();
    let decoder: Arc<dyn ImageDecoder> = Arc::new(FileDecoder);
    Ok((items, decoder))
}

/// Walk forward one item at a time, the way a held arrow key does
fn simulate_sequential(navigator: &Navigator, items: &[Item], args: &Args) {
    let step_delay = Duration::from_millis(args.step_ms);
    let mut shown = 0usize;
    for step in 0..args.steps {
        let index = step % items.len();
        navigator.on_position_changed(index, items);
        if navigator.image(index, items).is_some() {
            shown += 1;
        }
        navigator.run_ui_tasks();
        std::thread::sleep(step_delay);
    }
    info!("Sequential: {} of {} steps found their image resident", shown, args.steps);
}

/// Random scrubs; returns time to delivery for each completed jump
fn simulate_jumps(navigator: &Navigator, items: &[Item], args: &Args) -> Vec<Duration> {
    let mut rng = match args.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut times = Vec::with_capacity(args.jumps);

    for _ in 0..args.jumps {
        let target = rng.gen_range(0..items.len());
        let (tx, rx) = unbounded();
        let started = Instant::now();
        navigator.on_jump(target, items, move |result| {
            let _ = tx.send(result.map(|_| started.elapsed()));
        });

        let deadline = Instant::now() + JUMP_TIMEOUT;
        let outcome = loop {
            navigator.run_ui_tasks();
            if let Ok(outcome) = rx.try_recv() {
                break Some(outcome);
            }
            if Instant::now() > deadline {
                break None;
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        match outcome {
            Some(Ok(elapsed)) => {
                debug!("Jump to #{} delivered in {:.2?}", target, elapsed);
                times.push(elapsed);
            }
            Some(Err(e)) => warn!("Jump to #{} failed: {}", target, e),
            None => warn!("Jump to #{} timed out", target),
        }
        // Settle the window around the new position
        navigator.on_position_changed(target, items);
    }
    times
}

#[derive(Debug, Default)]
struct EventTally {
    window: usize,
    preload: usize,
    emergency: usize,
    failed: usize,
    evicted: usize,
}

impl EventTally {
    fn drain(events: &Receiver<LoadEvent>) -> Self {
        let mut tally = Self::default();
        for event in events.try_iter() {
            match event {
                LoadEvent::Loaded { source: LoadSource::Window, .. } => tally.window += 1,
                LoadEvent::Loaded { source: LoadSource::Preload, .. } => tally.preload += 1,
                LoadEvent::Loaded { source: LoadSource::Emergency, .. } => tally.emergency += 1,
                LoadEvent::Failed { .. } => tally.failed += 1,
                LoadEvent::Evicted { .. } => tally.evicted += 1,
            }
        }
        tally
    }
}
