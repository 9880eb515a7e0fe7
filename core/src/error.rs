/*!
# Error Module

This module defines the error type surfaced by delayq.

The queue itself is infallible on the producer side: pushing, draining and
retrying never fail because the collection is unbounded and purely
in-memory. The only failure a consumer can observe is a pull that was
abandoned because its cancellation fired first.

The module includes:
- The `QueueError` enum
- A `Result` type alias for convenience
*/

use thiserror::Error;

/// Result type alias for delayq operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during delayq operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The caller's cancellation fired before an item became ready.
    /// No item was consumed; the pull may be repeated.
    #[error("pull cancelled before an item became ready")]
    Cancelled,

    /// A retry policy failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl QueueError {
    /// Whether this error is the cancellation of a pull
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
