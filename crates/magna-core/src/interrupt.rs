//! Cooperative interruption for long-running scans.
//!
//! Every multi-step pass (database upgrade, block-index load, pruning)
//! polls a shared token between steps so a shutdown request terminates it
//! at a consistent point. Partial work is durable and the pass resumes on
//! the next start.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Progress callback, invoked with a 0..=100 percentage.
pub type ProgressFn = dyn Fn(u32) + Send + Sync;

/// Shared shutdown-requested flag.
#[derive(Clone, Debug, Default)]
pub struct InterruptToken {
    flag: Arc<AtomicBool>,
}

impl InterruptToken {
    /// Create a token in the not-requested state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request interruption. Idempotent.
    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether interruption has been requested.
    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_visible_through_clones() {
        let token = InterruptToken::new();
        let other = token.clone();
        assert!(!other.is_requested());
        token.request();
        assert!(other.is_requested());
    }
}
