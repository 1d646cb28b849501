//! Load error taxonomy

use std::fmt;

/// Why an item could not be delivered.
///
/// `Cancelled` is routine (the item left the window or a newer jump won)
/// and is never counted as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    DecodeFailure { locator: String, reason: String },
    Cancelled,
    SourceNotFound(String),
}

impl LoadError {
    pub fn decode(locator: impl fmt::Display, reason: impl fmt::Display) -> Self {
        LoadError::DecodeFailure {
            locator: locator.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, LoadError::Cancelled)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::DecodeFailure { locator, reason } => {
                write!(f, "Decode failed for {}: {}", locator, reason)
            }
            LoadError::Cancelled => write!(f, "Load cancelled"),
            LoadError::SourceNotFound(locator) => write!(f, "Source not found: {}", locator),
        }
    }
}

impl std::error::Error for LoadError {}
