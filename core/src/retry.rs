/*!
# Retry Module

This module defines retry policies for failed deliveries in delayq.

Retry policies determine:
- How long to wait before a failed value is delivered again
- How that wait grows with the number of previous retries
- The ceiling the wait never exceeds

The module includes:
- The `RetryPolicy` enum with fixed and exponential strategies
- Multiplicative jitter on the exponential strategy so that values failing
  together do not come back together
- Methods to compute the un-jittered ceiling and a jittered backoff

The default policy starts at 50ms, grows by a factor of 4 per retry and is
capped at 10 minutes.
*/

use crate::error::{QueueError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default first backoff ceiling, in milliseconds
pub const DEFAULT_BASE_DELAY_MS: u64 = 50;

/// Default maximum backoff, in milliseconds (10 minutes)
pub const DEFAULT_MAX_DELAY_MS: u64 = 10 * 60 * 1000;

/// Default growth factor between consecutive retries
pub const DEFAULT_FACTOR: u32 = 4;

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Retry policy for failed deliveries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Same delay before every retry, without jitter
    Fixed {
        /// Delay between retries in milliseconds
        delay_ms: u64,
    },

    /// Exponential backoff with full multiplicative jitter
    Exponential {
        /// Ceiling for the first retry in milliseconds
        base_delay_ms: u64,
        /// Maximum delay in milliseconds
        max_delay_ms: u64,
        /// Multiplier applied per previous retry
        factor: u32,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            factor: DEFAULT_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Create a fixed-delay policy
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: saturating_millis(delay),
        }
    }

    /// Create an exponential policy
    pub fn exponential(base: Duration, max: Duration, factor: u32) -> Self {
        Self::Exponential {
            base_delay_ms: saturating_millis(base),
            max_delay_ms: saturating_millis(max),
            factor,
        }
    }

    /// Check the policy is usable
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Fixed { .. } => Ok(()),
            Self::Exponential {
                base_delay_ms,
                max_delay_ms,
                factor,
            } => {
                if factor == 0 {
                    return Err(QueueError::InvalidConfig(
                        "retry factor must be at least 1".into(),
                    ));
                }
                if base_delay_ms > max_delay_ms {
                    return Err(QueueError::InvalidConfig(format!(
                        "base delay {}ms exceeds max delay {}ms",
                        base_delay_ms, max_delay_ms
                    )));
                }
                Ok(())
            }
        }
    }

    /// Upper bound of the backoff before retry number `retry_count + 1`.
    ///
    /// Non-decreasing in `retry_count` and never above the maximum delay.
    pub fn ceiling(&self, retry_count: u32) -> Duration {
        let delay_ms = match *self {
            Self::Fixed { delay_ms } => delay_ms,

            Self::Exponential {
                base_delay_ms,
                max_delay_ms,
                factor,
            } => (factor as u64)
                .checked_pow(retry_count)
                .and_then(|growth| base_delay_ms.checked_mul(growth))
                .map_or(max_delay_ms, |delay| delay.min(max_delay_ms)),
        };

        Duration::from_millis(delay_ms)
    }

    /// Jittered backoff for an envelope that has been retried `retry_count` times
    pub fn backoff(&self, retry_count: u32) -> Duration {
        self.backoff_with(retry_count, &mut rand::thread_rng())
    }

    /// Same as `backoff`, drawing jitter from the given generator
    pub fn backoff_with<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        let ceiling = self.ceiling(retry_count);
        match self {
            Self::Fixed { .. } => ceiling,
            Self::Exponential { .. } => ceiling.mul_f64(rng.gen::<f64>()),
        }
    }
}
