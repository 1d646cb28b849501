//! Core engine modules - cache, loaders, workers, events
//!
//! Everything that schedules or stores decoded images, independent of UI.

pub mod cancel;
pub mod emergency;
pub mod event_bus;
pub mod image_cache;
pub mod memory;
pub mod navigator;
pub mod preloader;
pub mod registry;
pub mod window_loader;
pub mod workers;

// Re-exports for convenience
pub use cancel::CancelToken;
pub use emergency::{EmergencyLoader, EmergencyResult, EmergencyStatistics};
pub use event_bus::{EventBus, LoadEvent, LoadSource};
pub use image_cache::{CacheStatistics, EvictionOrder, ImageCache};
pub use memory::MemoryBudget;
pub use navigator::{Navigator, NavigatorStatistics};
pub use preloader::{PreloadStatistics, Preloader};
pub use registry::{DecodeOwner, DecodeRegistry};
pub use window_loader::{WindowLoader, WindowStatistics};
pub use workers::{Lane, Workers};
