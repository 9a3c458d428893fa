//! Cooperative cancellation shared between the orchestrator and a run.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{PipelineError, Result};

/// Cheap, cloneable cancellation handle.
///
/// Checkpoints poll it synchronously; the one blocking point that cannot poll
/// (waiting on a subprocess) awaits [`CancelToken::cancelled`] instead.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Return `Err(Cancelled)` once the token has been triggered.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        Ok(())
    }

    /// Resolve once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
