/*!
# Retry Queue Module

A `DelayQueue` decorator that lets consumers send failed values back.

Every pushed value is wrapped in an envelope that carries a stable identity,
a retry counter and a non-owning handle to the queue it lives in. `pull`
hands out a `RetryEnvelope`, one per delivery. Calling `retry` or
`retry_after` on it puts the same envelope back with a delay and bumps the
counter; each delivery can be re-submitted at most once, however many times
and from however many tasks the call is made.
*/

use crate::cancel::Cancellation;
use crate::error::Result;
use crate::options::PushOptions;
use crate::queue::{DelayQueue, Drain, Queue};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

type Parcel<T> = Arc<Envelope<T>>;

/// State shared by every delivery of one pushed value
struct Envelope<T> {
    id: Uuid,
    value: T,
    retry_count: AtomicU32,
    /// Number of times the envelope has been pulled
    deliveries: AtomicU64,
    /// Delivery number of the last re-submission, 0 if none
    resubmitted: AtomicU64,
    policy: RetryPolicy,
    queue: Weak<DelayQueue<Parcel<T>>>,
}

/// Delay queue whose deliveries can be retried with backoff
pub struct RetryQueue<T> {
    queue: Arc<DelayQueue<Parcel<T>>>,
    policy: RetryPolicy,
}

impl<T> RetryQueue<T> {
    /// Create a retry queue with the default exponential policy
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    /// Create a retry queue whose `retry` uses `policy`
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            queue: Arc::new(DelayQueue::new()),
            policy,
        }
    }

    /// The policy applied by `RetryEnvelope::retry`
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl<T> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for RetryQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryQueue")
            .field("queue", &self.queue)
            .field("policy", &self.policy)
            .finish()
    }
}

#[async_trait]
impl<T> Queue for RetryQueue<T>
where
    T: Send + Sync + 'static,
{
    type Value = T;
    type Delivery = RetryEnvelope<T>;

    async fn push(&self, value: T, options: PushOptions) {
        let envelope = Arc::new(Envelope {
            id: Uuid::new_v4(),
            value,
            retry_count: AtomicU32::new(0),
            deliveries: AtomicU64::new(0),
            resubmitted: AtomicU64::new(0),
            policy: self.policy,
            queue: Arc::downgrade(&self.queue),
        });
        self.queue.push(envelope, options).await;
    }

    async fn pull(&self, cancel: &dyn Cancellation) -> Result<RetryEnvelope<T>> {
        let envelope = self.queue.pull(cancel).await?;
        let delivery = envelope.deliveries.fetch_add(1, Ordering::AcqRel) + 1;
        Ok(RetryEnvelope { envelope, delivery })
    }

    async fn len(&self) -> usize {
        self.queue.len().await
    }
}

// Clone covers envelopes still shared with a handle from an earlier delivery
#[async_trait]
impl<T> Drain for RetryQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn drain(&self) -> Vec<T> {
        self.queue
            .drain()
            .await
            .into_iter()
            .map(|envelope| match Arc::try_unwrap(envelope) {
                Ok(envelope) => envelope.value,
                Err(shared) => shared.value.clone(),
            })
            .collect()
    }
}

/// One delivery of a value pulled from a `RetryQueue`
pub struct RetryEnvelope<T> {
    envelope: Parcel<T>,
    delivery: u64,
}

impl<T> RetryEnvelope<T> {
    /// The wrapped value
    pub fn value(&self) -> &T {
        &self.envelope.value
    }

    /// How many times this value has been re-submitted
    pub fn retry_count(&self) -> u32 {
        self.envelope.retry_count.load(Ordering::Acquire)
    }

    /// Identity of the value, stable across retries
    pub fn id(&self) -> Uuid {
        self.envelope.id
    }

    /// Whether this delivery has already been re-submitted
    pub fn is_retried(&self) -> bool {
        self.envelope.resubmitted.load(Ordering::Acquire) >= self.delivery
    }
}

impl<T: Send + Sync + 'static> RetryEnvelope<T> {
    /// Re-submit after the policy's jittered backoff for the current retry count.
    ///
    /// Returns `true` if this call re-enqueued the value.
    pub async fn retry(&self) -> bool {
        let delay = self.envelope.policy.backoff(self.retry_count());
        self.retry_after(delay).await
    }

    /// Re-submit after `delay`.
    ///
    /// Only the first call per delivery has an effect; later calls, and calls
    /// on handles from earlier deliveries, are silent no-ops returning `false`.
    pub async fn retry_after(&self, delay: Duration) -> bool {
        let Some(queue) = self.envelope.queue.upgrade() else {
            warn!(id = %self.envelope.id, "retry queue dropped, not re-submitting");
            return false;
        };

        // Delivery n may only be re-submitted if delivery n - 1 was the last one
        if self
            .envelope
            .resubmitted
            .compare_exchange(
                self.delivery - 1,
                self.delivery,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let retry_count = self.envelope.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            id = %self.envelope.id,
            retry_count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "re-submitting value"
        );
        queue
            .push(Arc::clone(&self.envelope), PushOptions::delay(delay))
            .await;
        true
    }
}

impl<T> Clone for RetryEnvelope<T> {
    fn clone(&self) -> Self {
        Self {
            envelope: Arc::clone(&self.envelope),
            delivery: self.delivery,
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RetryEnvelope<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEnvelope")
            .field("id", &self.envelope.id)
            .field("value", &self.envelope.value)
            .field("retry_count", &self.retry_count())
            .field("delivery", &self.delivery)
            .finish()
    }
}
