/*!
# delayq CLI

Command-line driver for the delayq delivery queue.

The CLI provides tools for:
- Watching the time-ordered delivery contract on a small example
- Soak-testing the retry queue with many producers, consumers and failures
- Inspecting the backoff schedule of a retry policy

Configuration is read from `delayq.toml` (or `--config`) and `DELAYQ_*`
environment variables; see the `settings` module.
*/

mod settings;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use delayq_core::{
    CancelSignal, Deadline, DelayQueue, Drain, PushOptions, Queue, RetryEnvelope, RetryQueue,
};
use rand::Rng;
use serde::Serialize;
use settings::AppConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// delayq - time-ordered delivery queue
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push five values out of order and pull them back in time order
    Demo,

    /// Run a producer/consumer workload through the retry queue
    Soak {
        /// Values to push (overrides config)
        #[arg(long, short)]
        items: Option<usize>,

        /// Consumer tasks (overrides config)
        #[arg(long)]
        consumers: Option<usize>,

        /// Probability that a delivery fails (overrides config)
        #[arg(long)]
        fail_rate: Option<f64>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the backoff schedule of the configured retry policy
    Backoff {
        /// Number of retries to show
        #[arg(long, short, default_value = "8")]
        retries: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AppConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Demo => run_demo().await,

        Commands::Soak {
            items,
            consumers,
            fail_rate,
            json,
        } => {
            if let Some(items) = items {
                config.soak.items = items;
            }
            if let Some(consumers) = consumers {
                config.soak.consumers = consumers;
            }
            if let Some(fail_rate) = fail_rate {
                config.soak.fail_rate = fail_rate;
            }
            config.validate()?;

            let report = run_soak(&config).await?;
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to encode report")?
                );
            } else {
                info!(
                    "Delivered {}/{} values in {}ms: {} retries, at most {} for one value",
                    report.completed,
                    report.items,
                    report.elapsed_ms,
                    report.total_retries,
                    report.max_retry_count
                );
            }

            if report.duplicates > 0 || report.missing > 0 {
                bail!(
                    "soak failed: {} duplicate and {} missing deliveries",
                    report.duplicates,
                    report.missing
                );
            }
            Ok(())
        }

        Commands::Backoff { retries } => {
            let policy = config.retry;
            println!("{:>6} {:>12} {:>12}", "retry", "ceiling_ms", "sample_ms");
            for retry_count in 0..=retries {
                println!(
                    "{:>6} {:>12} {:>12}",
                    retry_count,
                    policy.ceiling(retry_count).as_millis(),
                    policy.backoff(retry_count).as_millis()
                );
            }
            Ok(())
        }
    }
}

/// Demo values and their offset from start in seconds, in push order
const DEMO_SCHEDULE: [(i32, i64); 5] = [(5, 3), (3, 1), (4, 2), (1, -1), (2, 0)];

async fn run_demo() -> Result<()> {
    let queue = Arc::new(DelayQueue::new());
    let now = Instant::now();
    let deadline = Deadline::after(Duration::from_secs(4));

    info!("Pushing 5 values due between -1s and +3s, out of order");
    for (value, offset_secs) in DEMO_SCHEDULE {
        queue
            .push(value, PushOptions::at(offset_instant(now, offset_secs)))
            .await;
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumers: Vec<_> = [2, 3]
        .into_iter()
        .enumerate()
        .map(|(consumer, pulls)| {
            let queue = Arc::clone(&queue);
            let tx = tx.clone();
            tokio::spawn(async move {
                for _ in 0..pulls {
                    match queue.pull(&deadline).await {
                        Ok(value) => {
                            info!(
                                "Consumer {} pulled {} at +{}ms",
                                consumer,
                                value,
                                now.elapsed().as_millis()
                            );
                            if tx.send(value).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!("Consumer {} stopped: {}", consumer, e);
                            return;
                        }
                    }
                }
            })
        })
        .collect();
    drop(tx);

    for result in futures::future::join_all(consumers).await {
        result.context("Demo consumer panicked")?;
    }

    let mut order = Vec::new();
    while let Some(value) = rx.recv().await {
        order.push(value);
    }
    println!("{:?}", order);
    Ok(())
}

/// `now` shifted by a signed number of seconds
fn offset_instant(now: Instant, offset_secs: i64) -> Instant {
    let offset = Duration::from_secs(offset_secs.unsigned_abs());
    if offset_secs < 0 {
        now.checked_sub(offset).unwrap_or(now)
    } else {
        now + offset
    }
}

/// Outcome of a soak run
#[derive(Debug, Serialize)]
struct SoakReport {
    items: usize,
    completed: usize,
    duplicates: usize,
    missing: usize,
    total_retries: u64,
    max_retry_count: u32,
    elapsed_ms: u64,
}

async fn run_soak(config: &AppConfig) -> Result<SoakReport> {
    let soak = config.soak.clone();
    let queue = Arc::new(RetryQueue::with_policy(config.retry));
    let stop = CancelSignal::new();
    let started = Instant::now();

    info!(
        "Starting soak: {} items, {} producers, {} consumers, fail rate {}",
        soak.items, soak.producers, soak.consumers, soak.fail_rate
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumers: Vec<_> = (0..soak.consumers)
        .map(|consumer| {
            let queue = Arc::clone(&queue);
            let stop = stop.clone();
            let tx = tx.clone();
            let fail_rate = soak.fail_rate;
            tokio::spawn(async move {
                while let Ok(envelope) = queue.pull(&stop).await {
                    if rand::thread_rng().gen_bool(fail_rate) {
                        handle_failure(consumer, &envelope).await;
                    } else if tx.send((*envelope.value(), envelope.retry_count())).is_err() {
                        return;
                    }
                }
            })
        })
        .collect();
    drop(tx);

    let producers: Vec<_> = (0..soak.producers)
        .map(|producer| {
            let queue = Arc::clone(&queue);
            let soak = soak.clone();
            tokio::spawn(async move {
                let max_delay = u64::try_from(soak.max_delay().as_millis()).unwrap_or(u64::MAX);
                for item in (producer..soak.items).step_by(soak.producers) {
                    let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_delay));
                    queue.push(item as u64, PushOptions::delay(delay)).await;
                }
            })
        })
        .collect();
    for result in futures::future::join_all(producers).await {
        result.context("Soak producer panicked")?;
    }

    let mut completions: HashMap<u64, u32> = HashMap::new();
    let mut duplicates = 0;
    let collect = async {
        while completions.len() < soak.items {
            let Some((value, retry_count)) = rx.recv().await else {
                break;
            };
            if completions.insert(value, retry_count).is_some() {
                duplicates += 1;
            }
        }
    };
    if time::timeout(soak.timeout(), collect).await.is_err() {
        error!("Soak timed out after {}s", soak.timeout_secs);
    }

    stop.cancel();
    for result in futures::future::join_all(consumers).await {
        result.context("Soak consumer panicked")?;
    }
    let leftover = queue.drain().await;
    if !leftover.is_empty() {
        warn!("{} values were still queued at shutdown", leftover.len());
    }

    Ok(SoakReport {
        items: soak.items,
        completed: completions.len(),
        duplicates,
        missing: soak.items.saturating_sub(completions.len()),
        total_retries: completions.values().map(|&count| count as u64).sum(),
        max_retry_count: completions.values().copied().max().unwrap_or(0),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    })
}

async fn handle_failure(consumer: usize, envelope: &RetryEnvelope<u64>) {
    if envelope.retry().await {
        debug!(
            "Consumer {} failed value {}, retry {} scheduled",
            consumer,
            envelope.value(),
            envelope.retry_count()
        );
    }
}
