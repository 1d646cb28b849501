//! Cooperative cancellation tokens for decode tasks
//!
//! A token is shared between whoever scheduled a decode and the worker
//! running it. Cancelling is always safe, including after the task finished.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation handle shared by all clones.
#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    /// New token in the non-cancelled state
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token and every clone of it. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// True if both handles refer to the same task
    pub fn same_task(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_state() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(!worker.is_cancelled());

        token.cancel();
        assert!(worker.is_cancelled());
        assert!(token.same_task(&worker));

        // Idempotent
        token.cancel();
        assert!(worker.is_cancelled());
    }

    #[test]
    fn test_distinct_tokens() {
        let a = CancelToken::new();
        let b = CancelToken::new();
        assert!(!a.same_task(&b));
        a.cancel();
        assert!(!b.is_cancelled());
    }
}
