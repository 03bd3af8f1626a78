//! Load harness for the swipe ingress.
//!
//! A write pool drains a fixed batch of work units through bounded-retry
//! swipes while a read pool polls stats and matches on a fixed tick. The
//! read pool is cancelled once the writes are done.

pub mod client;
pub mod datagen;
pub mod error;
pub mod health;
pub mod pool;
pub mod retry;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

pub use client::{ApiClient, LoadTarget, ReadOutcome};
pub use error::HarnessError;
pub use pool::{WorkUnit, WritePoolConfig};
pub use retry::{retry, RetryPolicy};
pub use stats::{LatencySummary, PoolReport, RunReport, WorkerReport};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Work units in the write queue.
    pub requests: usize,
    pub write: WritePoolConfig,
    pub read_workers: usize,
    pub read_tick: Duration,
}

/// Run one load test to completion and summarise it.
pub async fn run(target: Arc<dyn LoadTarget>, config: &HarnessConfig) -> RunReport {
    let queue = pool::work_queue(config.requests);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    info!(
        requests = config.requests,
        writers = config.write.workers,
        readers = config.read_workers,
        "Starting load run"
    );
    let started = Instant::now();
    let readers = pool::spawn_read_pool(
        target.clone(),
        config.read_workers,
        config.read_tick,
        cancel_rx,
    );
    let writes = pool::run_write_pool(target, queue, &config.write).await;
    let elapsed = started.elapsed();

    cancel_tx.send_replace(true);
    let reads = pool::join_reports(readers).await;

    RunReport::new(
        elapsed,
        PoolReport::from_workers(&writes),
        PoolReport::from_workers(&reads),
    )
}
