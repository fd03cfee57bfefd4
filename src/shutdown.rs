//! Graceful shutdown coordination.
//!
//! A [`ShutdownToken`] is cloned into every long-running task (discovery,
//! download workers, the persist loop). Triggering it moves the run into a
//! draining state: no new requests are issued, in-flight work finishes, and
//! the progress store is flushed once more before exit.
//!
//! Triggering is idempotent; a second signal is a no-op.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Cancellation token shared by all concurrent units of the crawl.
#[derive(Debug, Clone)]
pub struct ShutdownToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownToken {
    /// Creates a new, untriggered token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Signals shutdown. Safe to call from any task, any number of times.
    pub fn trigger(&self) {
        let already = self.tx.send_replace(true);
        if !already {
            debug!("shutdown triggered");
        }
    }

    /// Returns whether shutdown has been signalled.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is signalled.
    ///
    /// Intended for use inside `tokio::select!` alongside blocking
    /// operations (queue waits, rate-limit sleeps, network requests) so
    /// each observes cancellation promptly.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Error means every sender is gone, which only happens when all
        // token clones are dropped; treat as cancelled.
        let _ = rx.wait_for(|triggered| *triggered).await;
    }
}
