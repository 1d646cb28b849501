//! Abstract traits for dependency inversion.
//!
//! The loaders in `core` only see the decode primitive through this trait,
//! so the real decoder, synthetic decoders and test doubles are
//! interchangeable.

use std::sync::Arc;

use super::error::LoadError;
use super::image::DecodedImage;
use super::item::Locator;
use crate::core::cancel::CancelToken;

/// Turns a locator into a displayable image.
///
/// Called from worker threads. Implementations should poll `cancel` during
/// long decodes and return `LoadError::Cancelled` when it fires; a result
/// produced after cancellation is discarded by the caller anyway.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, locator: &Locator, cancel: &CancelToken) -> Result<DecodedImage, LoadError>;
}

/// Blanket impl: Arc<T> implements the trait if T does
impl<T: ImageDecoder + ?Sized> ImageDecoder for Arc<T> {
    fn decode(&self, locator: &Locator, cancel: &CancelToken) -> Result<DecodedImage, LoadError> {
        (**self).decode(locator, cancel)
    }
}
