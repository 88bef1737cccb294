//! Single-slot deferred action, used to debounce the next-batch prefetch.

use crate::cancellation::CancellationToken;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::trace;

/// Holds at most one pending action. Scheduling a new action cancels the
/// previous one if its delay has not elapsed yet.
///
/// Once the delay has elapsed the action is handed to its own task and can no
/// longer be cancelled through the slot, so an in-progress request is never
/// torn down halfway.
#[derive(Debug, Default)]
pub struct DeferredSlot {
    pending: Mutex<Option<CancellationToken>>,
}

impl DeferredSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called from within a Tokio runtime.
    pub fn schedule<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        if let Some(previous) = self.lock().replace(token.clone()) {
            previous.cancel();
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!("Deferred action cancelled before firing");
                }
                _ = tokio::time::sleep(delay) => {
                    if token.is_cancelled() {
                        return;
                    }
                    // Fired; the slot no longer counts as pending.
                    token.cancel();
                    tokio::spawn(action);
                }
            }
        });
    }

    pub fn cancel(&self) {
        if let Some(previous) = self.lock().take() {
            previous.cancel();
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for DeferredSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
