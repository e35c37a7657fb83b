#![forbid(unsafe_code)]
//! The remap engine: storage sizing and the in-place block shuffler.
//!
//! Given the loop-file extents, the free-space extents and a bounded
//! scratch arena, [`Remapper`] moves every block to its logical offset
//! using direct device-to-device moves where the destination is free
//! and the scratch arena everywhere else, journalling progress after
//! every batch so an interrupted job can resume.

pub mod sizer;
mod work;

pub use work::{run_remap, run_with, EngineOptions, RemapReport, Remapper};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Cooperative stop signal checked between batches.
///
/// Optionally carries a batch budget: once that many batches have run,
/// the token trips by itself. That is how tests exercise the
/// interrupted-and-resumed path deterministically.
#[derive(Debug, Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug)]
struct CancelInner {
    cancelled: AtomicBool,
    batches_left: AtomicU64,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::with_batch_budget(u64::MAX)
    }

    #[must_use]
    pub fn with_batch_budget(batches: u64) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                batches_left: AtomicU64::new(batches),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Account one finished batch against the budget.
    pub(crate) fn consume_batch(&self) {
        let left = self.inner.batches_left.load(Ordering::Acquire);
        if left != u64::MAX {
            if left <= 1 {
                self.cancel();
            } else {
                self.inner
                    .batches_left
                    .store(left - 1, Ordering::Release);
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_trips_on_request() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn batch_budget_trips_after_n_batches() {
        let token = CancelToken::with_batch_budget(2);
        token.consume_batch();
        assert!(!token.is_cancelled());
        token.consume_batch();
        assert!(token.is_cancelled());
    }
}
