//! Ordered collection items and their load state
//!
//! Items are owned by the UI/domain side. The loaders only read an item's
//! identity and locator, and report load state back through events.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use super::image::DecodedImage;

/// Stable identity of an item, independent of its position in the collection.
pub type ItemId = Uuid;

/// Where an item's bytes come from.
///
/// `Synthetic` items carry their own dimensions and are decoded without I/O,
/// which is what the demo binary and the tests use for huge collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    File(PathBuf),
    Synthetic { width: u32, height: u32 },
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::File(path) => write!(f, "{}", path.display()),
            Locator::Synthetic { width, height } => write!(f, "synthetic:{}x{}", width, height),
        }
    }
}

/// Entry in the ordered collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: ItemId,
    pub locator: Locator,
}

impl Item {
    pub fn new(locator: Locator) -> Self {
        Self {
            id: Uuid::new_v4(),
            locator,
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(Locator::File(path.into()))
    }

    pub fn synthetic(width: u32, height: u32) -> Self {
        Self::new(Locator::Synthetic { width, height })
    }
}

/// Load state of an item as seen by the UI.
///
/// Failures are not permanent: navigating back onto a failed item retries.
#[derive(Debug, Clone)]
pub enum LoadState {
    NotLoaded,
    Loading,
    Loaded(Arc<DecodedImage>),
    Failed(String),
}

impl LoadState {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadState::Loaded(_))
    }
}

impl PartialEq for LoadState {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LoadState::NotLoaded, LoadState::NotLoaded) => true,
            (LoadState::Loading, LoadState::Loading) => true,
            (LoadState::Loaded(a), LoadState::Loaded(b)) => Arc::ptr_eq(a, b),
            (LoadState::Failed(a), LoadState::Failed(b)) => a == b,
            _ => false,
        }
    }
}

/// Build a synthetic collection of `count` items (demo and tests)
pub fn synthetic_items(count: usize, width: u32, height: u32) -> Vec<Item> {
    (0..count).map(|_| Item::synthetic(width, height)).collect()
}
