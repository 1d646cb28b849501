//! Decode primitive implementations
//!
//! `FileDecoder` decodes real files with the `image` crate.
//! `SyntheticDecoder` fabricates images without I/O; it can be scripted with
//! latency and failures, which the demo and tests rely on.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use super::error::LoadError;
use super::image::DecodedImage;
use super::item::Locator;
use super::traits::ImageDecoder;
use crate::core::cancel::CancelToken;

/// Polling step while a synthetic decode is "busy"
const SLEEP_SLICE: Duration = Duration::from_millis(2);

/// Decodes image files (PNG, JPEG, TIFF, TGA, WebP) into RGBA8.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileDecoder;

impl FileDecoder {
    fn decode_path(path: &Path) -> Result<DecodedImage, LoadError> {
        let locator = path.display().to_string();
        let reader = image::ImageReader::open(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => LoadError::SourceNotFound(locator.clone()),
            _ => LoadError::decode(&locator, e),
        })?;
        let reader = reader
            .with_guessed_format()
            .map_err(|e| LoadError::decode(&locator, e))?;
        let img = reader.decode().map_err(|e| LoadError::decode(&locator, e))?;
        let rgba = img.to_rgba8();
        let (width, height) = rgba.dimensions();
        debug!("Decoded {} ({}x{})", locator, width, height);
        Ok(DecodedImage::new(rgba.into_raw(), width, height))
    }
}

impl ImageDecoder for FileDecoder {
    fn decode(&self, locator: &Locator, cancel: &CancelToken) -> Result<DecodedImage, LoadError> {
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        match locator {
            Locator::File(path) => Self::decode_path(path),
            Locator::Synthetic { width, height } => {
                Ok(DecodedImage::filled(*width, *height, [0, 100, 0, 255]))
            }
        }
    }
}

/// In-memory decoder with scriptable latency and failures.
///
/// File locators decode to a `default_size` square; synthetic locators use
/// their own dimensions. Every call is appended to `calls()` in start order.
#[derive(Debug)]
pub struct SyntheticDecoder {
    latency: Duration,
    default_size: u32,
    per_locator_latency: Mutex<HashMap<String, Duration>>,
    failing: Mutex<HashSet<String>>,
    calls: Mutex<Vec<String>>,
}

impl Default for SyntheticDecoder {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl SyntheticDecoder {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            default_size: 8,
            per_locator_latency: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Size of images produced for file locators
    pub fn with_default_size(mut self, size: u32) -> Self {
        self.default_size = size;
        self
    }

    /// Override latency for one locator
    pub fn set_latency(&self, locator: &Locator, latency: Duration) {
        self.per_locator_latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(locator.to_string(), latency);
    }

    /// Make every decode of `locator` fail
    pub fn fail_on(&self, locator: &Locator) {
        self.failing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(locator.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Locators in the order their decodes started
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sleep for `total`, waking early when cancelled
    fn busy(total: Duration, cancel: &CancelToken) -> bool {
        let mut left = total;
        while !left.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }
            let step = left.min(SLEEP_SLICE);
            thread::sleep(step);
            left -= step;
        }
        !cancel.is_cancelled()
    }
}

impl ImageDecoder for SyntheticDecoder {
    fn decode(&self, locator: &Locator, cancel: &CancelToken) -> Result<DecodedImage, LoadError> {
        let key = locator.to_string();
        if cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());

        let latency = self
            .per_locator_latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .copied()
            .unwrap_or(self.latency);
        if !Self::busy(latency, cancel) {
            trace!("Synthetic decode cancelled: {}", key);
            return Err(LoadError::Cancelled);
        }

        if self.failing.lock().unwrap_or_else(|e| e.into_inner()).contains(&key) {
            return Err(LoadError::decode(&key, "scripted failure"));
        }

        let (width, height) = match locator {
            Locator::Synthetic { width, height } => (*width, *height),
            Locator::File(_) => (self.default_size, self.default_size),
        };
        Ok(DecodedImage::filled(width, height, [128, 128, 128, 255]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_missing_file_is_source_not_found() {
        let decoder = FileDecoder;
        let locator = Locator::File(PathBuf::from("/definitely/not/here.png"));
        let err = decoder.decode(&locator, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, LoadError::SourceNotFound(_)));
    }

    #[test]
    fn test_cancelled_before_start() {
        let decoder = SyntheticDecoder::default();
        let token = CancelToken::new();
        token.cancel();
        let err = decoder.decode(&Locator::Synthetic { width: 4, height: 4 }, &token).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(decoder.call_count(), 0);
    }

    #[test]
    fn test_scripted_failure_and_log() {
        let decoder = SyntheticDecoder::default();
        let bad = Locator::File(PathBuf::from("bad"));
        let good = Locator::File(PathBuf::from("good"));
        decoder.fail_on(&bad);

        let token = CancelToken::new();
        assert!(decoder.decode(&good, &token).is_ok());
        assert!(matches!(decoder.decode(&bad, &token), Err(LoadError::DecodeFailure { .. })));
        assert_eq!(decoder.calls(), vec!["good".to_string(), "bad".to_string()]);
    }

    #[test]
    fn test_synthetic_dimensions() {
        let decoder = SyntheticDecoder::default();
        let img = decoder
            .decode(&Locator::Synthetic { width: 10, height: 5 }, &CancelToken::new())
            .unwrap();
        assert_eq!((img.width(), img.height()), (10, 5));
    }
}
