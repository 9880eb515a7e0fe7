/*!
# Push Options

Selects when a pushed value becomes visible to consumers.

A value is either visible immediately, after a relative delay, or at an
absolute instant on the monotonic clock. Wall-clock targets are accepted
through `PushOptions::at_utc` and converted to the monotonic clock at the
moment of conversion.
*/

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Roughly 30 years; used when a requested instant overflows the clock.
pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// When a pushed value becomes ready for delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushOptions {
    /// Ready immediately
    #[default]
    Now,

    /// Ready once the duration has elapsed from the time of the push
    Delay(Duration),

    /// Ready at an absolute instant
    At(Instant),
}

impl PushOptions {
    /// Ready after `delay`
    pub fn delay(delay: Duration) -> Self {
        Self::Delay(delay)
    }

    /// Ready at `at`
    pub fn at(at: Instant) -> Self {
        Self::At(at)
    }

    /// Ready at a wall-clock time.
    ///
    /// Times in the past map to instants in the past, so they are due at once
    /// but still ordered relative to each other.
    pub fn at_utc(at: DateTime<Utc>) -> Self {
        let now = Instant::now();
        let offset = at - Utc::now();
        let ready_at = match offset.to_std() {
            Ok(ahead) => now.checked_add(ahead).unwrap_or(now + FAR_FUTURE),
            Err(_) => (-offset)
                .to_std()
                .ok()
                .and_then(|behind| now.checked_sub(behind))
                .unwrap_or(now),
        };
        Self::At(ready_at)
    }

    /// Resolve to the instant the value becomes ready
    pub fn ready_at(&self) -> Instant {
        let now = Instant::now();
        match *self {
            Self::Now => now,
            Self::Delay(delay) => now.checked_add(delay).unwrap_or(now + FAR_FUTURE),
            Self::At(at) => at,
        }
    }
}

impl From<Duration> for PushOptions {
    fn from(delay: Duration) -> Self {
        Self::Delay(delay)
    }
}

impl From<Instant> for PushOptions {
    fn from(at: Instant) -> Self {
        Self::At(at)
    }
}
