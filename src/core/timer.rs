//! Cancellable one-shot timers.
//!
//! The locker arms one of these when a scope enters its reservation state;
//! promoting or releasing the reservation cancels the timer before it fires.

use std::future::Future;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::debug;

/// Handle to a scheduled one-shot task.
///
/// Dropping the handle does NOT cancel the task; call [`TimerHandle::cancel`]
/// explicitly. This mirrors the semantics of a detached background timer with
/// an explicit cancel switch.
#[derive(Debug)]
pub struct TimerHandle {
    handle: JoinHandle<()>,
}

impl TimerHandle {
    /// Cancel the timer. A timer whose callback already started cannot be
    /// stopped; callers that need stale-fire protection should guard the
    /// callback with a generation token.
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Whether the timer task has finished (fired or was cancelled).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Schedule `callback` to run once after `delay`.
///
/// Requires a running tokio runtime.
pub fn schedule<F>(delay: Duration, callback: F) -> TimerHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        debug!(delay_ms = delay.as_millis() as u64, "timer fired");
        callback.await;
    });
    TimerHandle { handle }
}
