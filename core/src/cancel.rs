/*!
# Cancellation Module

Cooperative cancellation for blocking pulls.

A pull suspends until an item is ready or the caller gives up. Giving up is
expressed through the `Cancellation` trait, which the queue polls before
touching its state and races against every wait.

The module includes:
- The `Cancellation` trait
- `NeverCancel`, which waits forever
- `Deadline`, which fires at a fixed instant on the monotonic clock
- `CancelSignal`, a clonable signal fired manually
*/

use crate::options::FAR_FUTURE;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Cooperative cancellation token.
#[async_trait]
pub trait Cancellation: Send + Sync {
    /// Resolves when cancellation is requested.
    async fn cancelled(&self);

    /// Non-blocking cancellation check.
    fn is_cancelled(&self) -> bool;
}

/// Cancellation token that never triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverCancel;

#[async_trait]
impl Cancellation for NeverCancel {
    async fn cancelled(&self) {
        futures::future::pending::<()>().await;
    }

    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Cancellation that fires once the monotonic clock reaches a deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline at an absolute instant
    pub fn at(at: Instant) -> Self {
        Self { at }
    }

    /// Deadline `timeout` from now; timeouts past the clock's range are clamped
    pub fn after(timeout: Duration) -> Self {
        let now = Instant::now();
        Self::at(now.checked_add(timeout).unwrap_or(now + FAR_FUTURE))
    }

    /// The instant at which this deadline fires
    pub fn instant(&self) -> Instant {
        self.at
    }
}

#[async_trait]
impl Cancellation for Deadline {
    async fn cancelled(&self) {
        tokio::time::sleep_until(self.at).await;
    }

    fn is_cancelled(&self) -> bool {
        Instant::now() >= self.at
    }
}

#[derive(Debug, Default)]
struct SignalState {
    fired: AtomicBool,
    notify: Notify,
}

/// Manually fired cancellation, shared by cloning.
///
/// Every clone observes the same signal; `cancel` releases all current and
/// future waiters.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    state: Arc<SignalState>,
}

impl CancelSignal {
    /// Create a signal that has not fired
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        if !self.state.fired.swap(true, Ordering::AcqRel) {
            self.state.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Cancellation for CancelSignal {
    async fn cancelled(&self) {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent cancel is not missed
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    fn is_cancelled(&self) -> bool {
        self.state.fired.load(Ordering::Acquire)
    }
}
