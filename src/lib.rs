//! IMGWIN - virtual windowed image cache and preloader
//!
//! Keeps a bounded set of decoded images resident around the current
//! position of a large ordered collection, prefetches neighbours and
//! serves random jumps without blocking the UI thread.

// Core engine (cache, loaders, workers, events)
pub mod core;

// App modules
pub mod cli;
pub mod config;
pub mod entities;
pub mod paths;

// Re-export commonly used types from core
pub use self::core::{EmergencyLoader, EventBus, ImageCache, LoadEvent, Navigator, Preloader, WindowLoader};

// Re-export entities
pub use entities::{DecodedImage, FileDecoder, ImageDecoder, Item, ItemId, LoadError, LoadState};
