//! Cooperative cancellation for materialization batches.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

/// Shared flag a dispatcher flips to abandon jobs that haven't started.
///
/// Clones observe the same flag. In-flight jobs are not interrupted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
