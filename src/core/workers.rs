//! Background thread pool for decode tasks
//!
//! Two global queues:
//! - urgent lane: emergency decodes, always drained first
//! - normal lane: window and preload decodes
//!
//! Workers keep a local FIFO deque and steal from each other when idle.
//! Cancellation is per task (see `CancelToken`), not per pool.

use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use log::trace;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Scheduling lane for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Urgent,
    Normal,
}

/// Shared worker pool used by every loader.
///
/// # Example
/// ```ignore
/// let workers = Workers::new(4);
/// workers.execute(Lane::Normal, move || {
///     let _ = decoder.decode(&locator, &token);
/// });
/// ```
pub struct Workers {
    urgent: Arc<Injector<Job>>,
    normal: Arc<Injector<Job>>,
    handles: Vec<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl Workers {
    /// Create worker pool.
    ///
    /// Recommended: `num_cpus::get() * 3 / 4` (leave 25% for the UI thread).
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let urgent: Arc<Injector<Job>> = Arc::new(Injector::new());
        let normal: Arc<Injector<Job>> = Arc::new(Injector::new());
        let shutdown = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let mut locals: Vec<Worker<Job>> = Vec::new();
        let mut stealers: Vec<Stealer<Job>> = Vec::new();
        for _ in 0..num_threads {
            let worker: Worker<Job> = Worker::new_fifo();
            stealers.push(worker.stealer());
            locals.push(worker);
        }

        let mut handles = Vec::new();
        for (worker_id, local) in locals.into_iter().enumerate() {
            let urgent = Arc::clone(&urgent);
            let normal = Arc::clone(&normal);
            let shutdown = Arc::clone(&shutdown);
            let pending = Arc::clone(&pending);
            let stealers = stealers.clone();

            let spawned = thread::Builder::new()
                .name(format!("imgwin-worker-{}", worker_id))
                .spawn(move || {
                    trace!("Worker {} started", worker_id);
                    loop {
                        if let Some(job) = next_job(&local, &urgent, &normal, &stealers) {
                            job();
                            pending.fetch_sub(1, Ordering::AcqRel);
                            continue;
                        }
                        if shutdown.load(Ordering::Relaxed) {
                            break;
                        }
                        // No work - short sleep to avoid CPU spin
                        thread::sleep(Duration::from_millis(1));
                    }
                    trace!("Worker {} stopped", worker_id);
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => log::error!("Failed to spawn worker thread {}: {}", worker_id, e),
            }
        }

        trace!("Workers initialized: {} threads", handles.len());

        Self {
            urgent,
            normal,
            handles,
            shutdown,
            pending,
        }
    }

    /// Queue a job on the given lane. Runs asynchronously, no return value.
    pub fn execute<F>(&self, lane: Lane, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.pending.fetch_add(1, Ordering::AcqRel);
        match lane {
            Lane::Urgent => self.urgent.push(Box::new(f)),
            Lane::Normal => self.normal.push(Box::new(f)),
        }
    }

    /// Number of threads actually running
    pub fn threads(&self) -> usize {
        self.handles.len()
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Block until no job is queued or running, or until `timeout`.
    ///
    /// Returns true if the pool went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

/// Pick the next job: urgent lane, own deque, normal lane, then steal.
fn next_job(
    local: &Worker<Job>,
    urgent: &Injector<Job>,
    normal: &Injector<Job>,
    stealers: &[Stealer<Job>],
) -> Option<Job> {
    loop {
        match urgent.steal() {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }

    if let Some(job) = local.pop() {
        return Some(job);
    }

    loop {
        match normal.steal_batch_and_pop(local) {
            Steal::Success(job) => return Some(job),
            Steal::Retry => continue,
            Steal::Empty => break,
        }
    }

    stealers.iter().find_map(|s| s.steal().success())
}

impl Drop for Workers {
    fn drop(&mut self) {
        let num_threads = self.handles.len();
        trace!("Workers shutting down ({} threads)...", num_threads);

        self.shutdown.store(true, Ordering::SeqCst);

        // Cancelled tasks return quickly; the timeout is a safety net
        let deadline = Instant::now() + Duration::from_millis(500);

        let handles = std::mem::take(&mut self.handles);
        for handle in handles {
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    trace!("Shutdown timeout reached, exiting anyway");
                    return;
                }
                thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }

        trace!("All {} workers stopped", num_threads);
    }
}
