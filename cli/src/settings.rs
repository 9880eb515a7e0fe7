//! Configuration for the `delayq` binary.
//!
//! Sources are layered: built-in defaults, then an optional file
//! (`delayq.toml`, `delayq.yaml`, ... in the working directory, or the path
//! given with `--config`), then `DELAYQ_`-prefixed environment variables
//! using `__` between sections, e.g. `DELAYQ_SOAK__ITEMS=500`.

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use delayq_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backoff applied when a soak delivery fails
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Workload for the `soak` command
    #[serde(default)]
    pub soak: SoakConfig,
}

/// Soak workload settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SoakConfig {
    /// Values pushed in total
    pub items: usize,
    /// Concurrent producer tasks
    pub producers: usize,
    /// Concurrent consumer tasks
    pub consumers: usize,
    /// Upper bound of the random initial delay, in milliseconds
    pub max_delay_ms: u64,
    /// Probability that a delivery fails and is retried
    pub fail_rate: f64,
    /// Give up waiting for completions after this many seconds
    pub timeout_secs: u64,
}

impl Default for SoakConfig {
    fn default() -> Self {
        Self {
            items: 1_000,
            producers: 4,
            consumers: 8,
            max_delay_ms: 200,
            fail_rate: 0.2,
            timeout_secs: 60,
        }
    }
}

impl SoakConfig {
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.producers == 0 || self.consumers == 0 {
            bail!("soak needs at least one producer and one consumer");
        }
        if !(0.0..1.0).contains(&self.fail_rate) {
            bail!("fail_rate must be in [0, 1), got {}", self.fail_rate);
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load and validate configuration
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => File::from(path).required(true),
            None => File::with_name("delayq").required(false),
        };

        let config: AppConfig = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("DELAYQ")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.retry.validate().context("Invalid retry policy")?;
        self.soak.validate().context("Invalid soak settings")
    }
}
