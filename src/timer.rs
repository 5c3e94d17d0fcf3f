//! One-shot cancellable timer
//!
//! Fires a callback once after a delay unless cancelled first. Cancel is
//! idempotent; dropping the timer also cancels it, so a timer stored in a
//! map can never outlive its owner and fire into freed state.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct CancellableTimer {
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl CancellableTimer {
    /// Schedule `on_fire` to run once after `delay`
    pub fn spawn<F>(delay: Duration, on_fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => on_fire(),
                _ = rx => {}
            }
        });
        Self {
            cancel: Some(tx),
            handle,
        }
    }

    /// Prevent the callback from firing. Safe to call more than once.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
        self.handle.abort();
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for CancellableTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellableTimer")
            .field("cancelled", &self.cancel.is_none())
            .finish()
    }
}
