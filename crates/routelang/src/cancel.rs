//! Cooperative cancellation of long running passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Error returned by a pass that stopped because its token was cancelled.
///
/// Any partially built state must be discarded by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compilation was cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Shared flag that a host sets to stop a compilation running on another thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Yields the thread and returns [Cancelled] if the token has been cancelled.
    ///
    /// Passes call this once every fixed number of iterations.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        std::thread::yield_now();
        if self.is_cancelled() {
            log::debug!("cancellation requested");
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let token = CancellationToken::new();
        let other = token.clone();
        assert_eq!(other.checkpoint(), Ok(()));
        token.cancel();
        assert_eq!(other.checkpoint(), Err(Cancelled));
    }
}
