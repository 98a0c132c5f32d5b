//! Timer utilities.

use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::sleep;

/// A timer that can be cancelled.
///
/// Dropping the timer cancels it, so a pending deadline can be disarmed by
/// overwriting or dropping its handle.
pub struct CancellableTimer {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl CancellableTimer {
    /// Create a new timer that executes a callback after the specified duration
    pub fn new<F>(duration: Duration, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let (cancel_tx, cancel_rx) = oneshot::channel();

        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(duration) => {
                    callback();
                }
                _ = cancel_rx => {
                    // Timer was cancelled
                }
            }
        });

        Self {
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Cancel the timer
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Check if the timer is still active
    pub fn is_active(&self) -> bool {
        self.cancel_tx.is_some()
    }
}

impl Drop for CancellableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
