//! Memory budget for decoded images
//!
//! Holds the runtime-mutable memory limit and pressure policy shared by the
//! window loader and the cache configuration. A limit of 0 MB means "auto":
//! a fraction of currently available RAM, minus a reserve for the system.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info};
use sysinfo::System;

use super::image_cache::ImageCache;
use crate::entities::{DecodedImage, ItemId};

const MB: usize = 1024 * 1024;

/// Fraction of usable memory taken when the limit is automatic
pub const AUTO_MEM_FRACTION: f64 = 0.75;
/// Memory left to the system when the limit is automatic
pub const AUTO_RESERVE_GB: f64 = 2.0;
/// Floor for the automatic limit on small machines
const AUTO_MIN_MB: usize = 256;

/// Shrink target after a pressure pass, as a fraction of the limit
const AGGRESSIVE_TARGET: f64 = 0.50;
const RELAXED_TARGET: f64 = 0.75;

#[derive(Debug)]
pub struct MemoryBudget {
    max_bytes: AtomicUsize,
    aggressive: AtomicBool,
}

impl MemoryBudget {
    /// Create budget
    ///
    /// # Arguments
    /// * `max_memory_mb` - Limit in MB, 0 for automatic
    /// * `aggressive` - Shrink to 50% instead of 75% under pressure
    pub fn new(max_memory_mb: usize, aggressive: bool) -> Self {
        let budget = Self {
            max_bytes: AtomicUsize::new(0),
            aggressive: AtomicBool::new(aggressive),
        };
        budget.set_limit_mb(max_memory_mb);
        budget
    }

    /// Limit derived from available RAM
    pub fn auto_limit_bytes() -> usize {
        let mut sys = System::new();
        sys.refresh_memory();

        let available = sys.available_memory() as usize;
        let reserve = (AUTO_RESERVE_GB * 1024.0 * 1024.0 * 1024.0) as usize;
        let usable = available.saturating_sub(reserve);
        let limit = ((usable as f64 * AUTO_MEM_FRACTION) as usize).max(AUTO_MIN_MB * MB);

        info!(
            "Auto memory limit: available={} MB, reserve={} MB, limit={} MB ({}%)",
            available / MB,
            reserve / MB,
            limit / MB,
            (AUTO_MEM_FRACTION * 100.0) as u32
        );
        limit
    }

    pub fn set_limit_mb(&self, max_memory_mb: usize) {
        let bytes = if max_memory_mb == 0 {
            Self::auto_limit_bytes()
        } else {
            max_memory_mb.saturating_mul(MB)
        };
        self.max_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Set the limit in bytes directly (tests and fine-grained callers)
    pub fn set_limit_bytes(&self, bytes: usize) {
        self.max_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn limit_bytes(&self) -> usize {
        self.max_bytes.load(Ordering::Relaxed)
    }

    pub fn set_aggressive(&self, aggressive: bool) {
        self.aggressive.store(aggressive, Ordering::Relaxed);
    }

    pub fn is_aggressive(&self) -> bool {
        self.aggressive.load(Ordering::Relaxed)
    }

    pub fn is_over(&self, usage: usize) -> bool {
        usage > self.limit_bytes()
    }

    /// Usage to shrink down to once over the limit
    pub fn pressure_target(&self) -> usize {
        let fraction = if self.is_aggressive() { AGGRESSIVE_TARGET } else { RELAXED_TARGET };
        (self.limit_bytes() as f64 * fraction) as usize
    }

    /// True when usage is below half the limit
    pub fn is_comfortable(&self, usage: usize) -> bool {
        usage < self.limit_bytes() / 2
    }
}

/// Store a freshly decoded image under the pressure policy.
///
/// An insert that takes usage past the limit counts as pressure and shrinks
/// the cache to `pressure_target()`. Returns every evicted id.
pub fn store_decoded(
    cache: &ImageCache,
    budget: &MemoryBudget,
    id: ItemId,
    image: Arc<DecodedImage>,
) -> Vec<ItemId> {
    let (evicted, pressured) =
        cache.set_with_pressure(id, image, budget.limit_bytes(), budget.pressure_target());
    if pressured {
        debug!(
            "Memory pressure on store: evicted {} to reach {:.1} MB of {:.1} MB",
            evicted.len(),
            bytes_to_mb(budget.pressure_target()),
            bytes_to_mb(budget.limit_bytes())
        );
    }
    evicted
}

/// Bytes to whole-ish megabytes for reports
pub fn bytes_to_mb(bytes: usize) -> f64 {
    bytes as f64 / MB as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_targets() {
        let budget = MemoryBudget::new(100, false);
        assert_eq!(budget.limit_bytes(), 100 * MB);
        assert_eq!(budget.pressure_target(), 75 * MB);

        budget.set_aggressive(true);
        assert_eq!(budget.pressure_target(), 50 * MB);
    }

    #[test]
    fn test_over_and_comfortable() {
        let budget = MemoryBudget::new(10, false);
        assert!(!budget.is_over(10 * MB));
        assert!(budget.is_over(10 * MB + 1));
        assert!(budget.is_comfortable(4 * MB));
        assert!(!budget.is_comfortable(5 * MB));
    }

    #[test]
    fn test_store_decoded_applies_relaxed_target() {
        let budget = MemoryBudget::new(1, false);
        budget.set_limit_bytes(1_000);
        let cache = ImageCache::new(100, 1_000);
        // 5x5 RGBA = 100 bytes
        let ids: Vec<ItemId> = (0..11).map(|_| uuid::Uuid::new_v4()).collect();
        for id in &ids {
            store_decoded(&cache, &budget, *id, Arc::new(DecodedImage::filled(5, 5, [0; 4])));
        }
        // The eleventh insert crossed 1 000 bytes and dropped to 750
        assert_eq!(cache.total_cost(), 700);
        assert!(cache.contains(&ids[10]));
        assert!(!cache.contains(&ids[0]));
    }

    #[test]
    fn test_auto_limit_nonzero() {
        let budget = MemoryBudget::new(0, false);
        assert!(budget.limit_bytes() >= AUTO_MIN_MB * MB);
    }
}
