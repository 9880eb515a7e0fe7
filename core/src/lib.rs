/*!
# delayq Core

Core library for delayq, a concurrent time-ordered delivery queue.

This library provides:

- A delay queue that hands each value to exactly one consumer once its
  scheduled time has passed, earliest first
- Blocking pulls that can be cancelled by deadline or by signal
- A retry decorator that puts failed values back with exponential backoff
  and jitter, at most once per delivery
- Retry policies with configurable base, ceiling and growth factor
*/

pub mod cancel;
pub mod error;
pub mod options;
pub mod queue;
pub mod retry;
pub mod retry_queue;

pub use error::{QueueError, Result};

pub use cancel::{CancelSignal, Cancellation, Deadline, NeverCancel};
pub use options::PushOptions;
pub use queue::{DelayQueue, Drain, Queue};
pub use retry::RetryPolicy;
/// Re-export retry types for convenience
pub use retry_queue::{RetryEnvelope, RetryQueue};
