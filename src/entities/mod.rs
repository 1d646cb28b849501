//! Entities - items, decoded images, errors and the decode primitive
//!
//! Plain data types shared by all loaders. Nothing here schedules work.

pub mod decoder;
pub mod error;
pub mod image;
pub mod item;
pub mod traits;

pub use decoder::{FileDecoder, SyntheticDecoder};
pub use error::LoadError;
pub use image::{estimate_cost, DecodedImage};
pub use item::{synthetic_items, Item, ItemId, LoadState, Locator};
pub use traits::ImageDecoder;
