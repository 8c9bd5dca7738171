//! Cooperative cancellation (§5).
//!
//! Every externally-facing operation accepts a [`CancellationToken`].
//! Retry loops check it between attempts; cancellation observed before a
//! conditional write succeeds aborts with [`crate::error::Error::Cancelled`],
//! while cancellation observed after a commit is durable is a no-op (the
//! commit stands and is visible on the next read).
//!
//! Kept dependency-light (an `Arc<AtomicBool>` newtype) rather than pulling
//! in `tokio_util`, matching the teacher's preference for small, explicit
//! concurrency primitives over extra crates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_observed_through_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
