//! Load notifications and UI-context delivery.
//!
//! Architecture:
//! - Loaders `emit()` a `LoadEvent` from worker threads
//! - Each subscriber owns a channel receiver and drains it at its own pace
//! - Completion closures that must run on the UI thread are `post_ui()`ed
//!   and executed when the UI loop calls `run_ui_tasks()`
//!
//! Subscribers hold plain receivers, so a dropped consumer simply stops
//! receiving; there are no callbacks into possibly-dead UI objects.

use std::fmt;
use std::sync::{Arc, RwLock};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;

use crate::entities::ItemId;

/// Which component produced an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadSource {
    Window,
    Preload,
    Emergency,
}

/// Events observed by the UI collaborator
#[derive(Debug, Clone, PartialEq)]
pub enum LoadEvent {
    /// Image decoded and stored; read it with `image(id)`
    Loaded { id: ItemId, index: usize, source: LoadSource },
    /// Decode failed; the item's state becomes `Failed`
    Failed { id: ItemId, index: usize, reason: String },
    /// Entry left the cache (buffer zone or memory pressure)
    Evicted { id: ItemId },
}

impl LoadEvent {
    pub fn id(&self) -> ItemId {
        match self {
            LoadEvent::Loaded { id, .. } | LoadEvent::Failed { id, .. } | LoadEvent::Evicted { id } => *id,
        }
    }
}

type UiTask = Box<dyn FnOnce() + Send + 'static>;

/// Fan-out event channel plus the UI task queue.
///
/// Cheap to clone; all clones share subscribers and the UI queue.
#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<Vec<Sender<LoadEvent>>>>,
    ui_tx: Sender<UiTask>,
    ui_rx: Receiver<UiTask>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("ui_queue_len", &self.ui_rx.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (ui_tx, ui_rx) = unbounded();
        Self {
            subscribers: Arc::new(RwLock::new(Vec::new())),
            ui_tx,
            ui_rx,
        }
    }

    // ========== Load events ==========

    /// Register a new consumer. Events emitted from now on are delivered to it.
    pub fn subscribe(&self) -> Receiver<LoadEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    /// Send event to every live subscriber; disconnected ones are dropped.
    pub fn emit(&self, event: LoadEvent) {
        trace!("emit {:?}", event);
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }

    // ========== UI context ==========

    /// Queue a closure for the UI thread
    pub fn post_ui<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        // The receiver lives in self, so the channel cannot be disconnected
        let _ = self.ui_tx.send(Box::new(task));
    }

    /// Run every queued UI closure on the calling thread.
    ///
    /// Call once per frame from the UI loop. Returns how many ran.
    pub fn run_ui_tasks(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.ui_rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    pub fn ui_queue_len(&self) -> usize {
        self.ui_rx.len()
    }
}
