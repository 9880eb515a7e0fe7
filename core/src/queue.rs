/*!
# Queue Module

This module defines the queue abstraction for delayq.

Queues are responsible for:
- Holding values until their scheduled time has passed
- Handing each value to exactly one consumer, earliest `ready_at` first
- Blocking consumers until something is due, or until they cancel
- Supporting concurrent producers and consumers

The module includes:
- The `Queue` trait that defines the interface for all queue implementations
- The `Drain` trait for queues that can be emptied in one call
- `DelayQueue`, an in-memory implementation over a min-heap behind a `Mutex`
- A wake signal so pushes unblock waiting consumers promptly

Consumers never trust a wake-up: after every wake or timer they re-read the
heap, because a concurrent push may have added an earlier item and a
concurrent pull may have taken the one they were waiting for.
*/

use crate::cancel::Cancellation;
use crate::error::{QueueError, Result};
use crate::options::PushOptions;
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use tokio::sync::{Mutex, Notify};
use tokio::time::{self, Instant};
use tracing::trace;

/// Queue trait defining the interface for delivery queues
#[async_trait]
pub trait Queue: Send + Sync + 'static {
    /// Values accepted by `push`
    type Value: Send + 'static;

    /// What a consumer receives from `pull`
    type Delivery: Send + 'static;

    /// Enqueue a value, visible according to `options`
    async fn push(&self, value: Self::Value, options: PushOptions);

    /// Wait for the earliest due value, or fail with `QueueError::Cancelled`
    async fn pull(&self, cancel: &dyn Cancellation) -> Result<Self::Delivery>;

    /// Number of queued values, due or not
    async fn len(&self) -> usize;

    /// Check if queue is empty
    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Queues that can hand back everything they hold at once
#[async_trait]
pub trait Drain: Queue {
    /// Remove every queued value, earliest `ready_at` first
    async fn drain(&self) -> Vec<Self::Value>;
}

/// A queued value and the instant it becomes visible
struct Item<T> {
    ready_at: Instant,
    value: T,
}

// `BinaryHeap` is a max-heap; invert so the earliest `ready_at` sits on top.
// Ties are left unordered.
impl<T> Ord for Item<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.ready_at.cmp(&self.ready_at)
    }
}

impl<T> PartialOrd for Item<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Item<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at
    }
}

impl<T> Eq for Item<T> {}

/// In-memory time-ordered queue
pub struct DelayQueue<T> {
    items: Mutex<BinaryHeap<Item<T>>>,
    // notify_one keeps at most one permit, so bursts of pushes coalesce
    wake: Notify,
}

impl<T> DelayQueue<T> {
    /// Create a new, empty delay queue
    pub fn new() -> Self {
        Self {
            items: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
        }
    }

    /// The earliest `ready_at` currently queued, without removing it
    pub async fn next_ready_at(&self) -> Option<Instant> {
        self.items.lock().await.peek().map(|item| item.ready_at)
    }
}

impl<T> Default for DelayQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for DelayQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.items.try_lock().map(|items| items.len()).ok();
        f.debug_struct("DelayQueue").field("len", &len).finish()
    }
}

#[async_trait]
impl<T: Send + 'static> Queue for DelayQueue<T> {
    type Value = T;
    type Delivery = T;

    async fn push(&self, value: T, options: PushOptions) {
        let ready_at = options.ready_at();
        {
            let mut items = self.items.lock().await;
            items.push(Item { ready_at, value });
            trace!(queued = items.len(), "pushed item");
        }
        self.wake.notify_one();
    }

    async fn pull(&self, cancel: &dyn Cancellation) -> Result<T> {
        if cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        loop {
            // Scope the lock so it is released before any wait
            let next = {
                let mut items = self.items.lock().await;
                match items.peek().map(|item| item.ready_at) {
                    Some(ready_at) if ready_at <= Instant::now() => {
                        if let Some(item) = items.pop() {
                            let remaining = items.len();
                            drop(items);
                            // Another consumer may be sleeping on a timer for a
                            // later item than the one now at the top
                            if remaining > 0 {
                                self.wake.notify_one();
                            }
                            trace!(remaining, "delivered item");
                            return Ok(item.value);
                        }
                        None
                    }
                    next => next,
                }
            };

            match next {
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                        _ = self.wake.notified() => {}
                    }
                }
                Some(ready_at) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(QueueError::Cancelled),
                        _ = self.wake.notified() => {}
                        _ = time::sleep_until(ready_at) => {}
                    }
                }
            }
        }
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[async_trait]
impl<T: Send + 'static> Drain for DelayQueue<T> {
    async fn drain(&self) -> Vec<T> {
        let mut items = self.items.lock().await;
        let drained: Vec<T> = std::iter::from_fn(|| items.pop())
            .map(|item| item.value)
            .collect();
        trace!(count = drained.len(), "drained queue");
        drained
    }
}
