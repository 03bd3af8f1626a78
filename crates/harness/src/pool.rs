//! Write and read worker pools.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::client::LoadTarget;
use crate::datagen;
use crate::retry::{retry, RetryPolicy};
use crate::stats::WorkerReport;

/// Opaque unit of write work.
#[derive(Debug, Clone, Copy)]
pub struct WorkUnit;

pub type WorkQueue = Arc<Mutex<mpsc::Receiver<WorkUnit>>>;

/// A queue pre-loaded with `n` units and already closed, so draining it is
/// the only way write workers stop.
pub fn work_queue(n: usize) -> WorkQueue {
    let (tx, rx) = mpsc::channel(n.max(1));
    for _ in 0..n {
        // Capacity is n, so this never fails.
        let _ = tx.try_send(WorkUnit);
    }
    drop(tx);
    Arc::new(Mutex::new(rx))
}

#[derive(Debug, Clone)]
pub struct WritePoolConfig {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Pause after each write, outside the measured latency.
    pub think_time: Duration,
}

/// Run `workers` writers until `queue` is drained. One report per worker.
pub async fn run_write_pool(
    target: Arc<dyn LoadTarget>,
    queue: WorkQueue,
    config: &WritePoolConfig,
) -> Vec<WorkerReport> {
    let handles: Vec<JoinHandle<WorkerReport>> = (0..config.workers.max(1))
        .map(|worker_id| {
            tokio::spawn(write_worker(
                worker_id,
                target.clone(),
                queue.clone(),
                config.retry,
                config.think_time,
            ))
        })
        .collect();
    join_reports(handles).await
}

async fn write_worker(
    worker_id: usize,
    target: Arc<dyn LoadTarget>,
    queue: WorkQueue,
    policy: RetryPolicy,
    think_time: Duration,
) -> WorkerReport {
    let mut rng = StdRng::from_entropy();
    let mut report = WorkerReport {
        worker_id,
        ..WorkerReport::default()
    };

    loop {
        let unit = queue.lock().await.recv().await;
        if unit.is_none() {
            break;
        }

        let direction = datagen::random_direction(&mut rng);
        let request = datagen::random_request(&mut rng);
        let started = Instant::now();
        let result = retry(&policy, |_| target.swipe(direction, &request)).await;
        report.latencies.push(started.elapsed());

        match result {
            Ok(()) => report.success += 1,
            Err(e) => {
                report.errors += 1;
                warn!(worker_id, error = %e, "Swipe failed");
            }
        }

        if !think_time.is_zero() {
            tokio::time::sleep(think_time).await;
        }
    }

    debug!(worker_id, success = report.success, errors = report.errors, "Write worker done");
    report
}

/// Start `workers` readers. Each alternates stats and matches reads
/// every `tick` until `cancel` flips to true.
pub fn spawn_read_pool(
    target: Arc<dyn LoadTarget>,
    workers: usize,
    tick: Duration,
    cancel: watch::Receiver<bool>,
) -> Vec<JoinHandle<WorkerReport>> {
    let tick = tick.max(Duration::from_millis(1));
    (0..workers)
        .map(|worker_id| tokio::spawn(read_worker(worker_id, target.clone(), tick, cancel.clone())))
        .collect()
}

async fn read_worker(
    worker_id: usize,
    target: Arc<dyn LoadTarget>,
    tick: Duration,
    mut cancel: watch::Receiver<bool>,
) -> WorkerReport {
    let mut rng = StdRng::from_entropy();
    let mut report = WorkerReport {
        worker_id,
        ..WorkerReport::default()
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stats_next = true;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = cancelled(&mut cancel) => break,
        }

        let user_id = datagen::random_user_id(&mut rng);
        let started = Instant::now();
        let result = if stats_next {
            target.user_stats(user_id).await
        } else {
            target.user_matches(user_id).await
        };
        report.latencies.push(started.elapsed());
        stats_next = !stats_next;

        match result {
            Ok(_) => report.success += 1,
            Err(e) => {
                report.errors += 1;
                warn!(worker_id, user_id, error = %e, "Read failed");
            }
        }
    }

    debug!(worker_id, reads = report.latencies.len(), "Read worker done");
    report
}

/// Resolves once cancellation is raised or the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Await every worker. A panicked worker is logged and left out.
pub async fn join_reports(handles: Vec<JoinHandle<WorkerReport>>) -> Vec<WorkerReport> {
    let mut reports = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.await {
            Ok(report) => reports.push(report),
            Err(e) => warn!(error = %e, "Worker task failed"),
        }
    }
    info!(workers = reports.len(), "Pool joined");
    reports
}
