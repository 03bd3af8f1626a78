//! Bounded-concurrency dispatch from a subscription to [`SwipeHandler`]s.

use std::future::Future;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use twinder_queue::Subscription;

use crate::handler::SwipeHandler;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Pulls deliveries and runs at most `concurrency` handlers at once.
pub struct ConsumerPool {
    subscription: Arc<dyn Subscription>,
    handler: Arc<SwipeHandler>,
    concurrency: usize,
}

impl ConsumerPool {
    pub fn new(
        subscription: Arc<dyn Subscription>,
        handler: Arc<SwipeHandler>,
        concurrency: usize,
    ) -> Self {
        Self {
            subscription,
            handler,
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Dispatch until `shutdown` flips to true or the subscription ends, then
    /// wait for every in-flight handler to finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let slots = Arc::new(Semaphore::new(self.concurrency));
        let metrics = self.handler.metrics().clone();
        info!(concurrency = self.concurrency, "Consumer pool started");

        loop {
            let permit = tokio::select! {
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = shutdown_signal(&mut shutdown) => break,
            };

            let next = tokio::select! {
                next = self.subscription.next_delivery() => next,
                _ = shutdown_signal(&mut shutdown) => break,
            };

            let delivery = match next {
                Some(Ok(d)) => d,
                Some(Err(e)) => {
                    warn!(error = %e, "Subscription error, backing off");
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                        _ = shutdown_signal(&mut shutdown) => break,
                    }
                }
                None => {
                    info!("Subscription closed");
                    break;
                }
            };

            let handler = self.handler.clone();
            let metrics = metrics.clone();
            metrics.in_flight.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                handler.handle(delivery).await;
                metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }

        info!(in_flight = metrics.in_flight.load(Ordering::Relaxed), "Consumer pool draining");
        // Every slot free means every spawned handler has returned.
        let _ = slots.acquire_many(self.concurrency as u32).await;
        info!(counters = ?metrics.snapshot(), "Consumer pool stopped");
    }
}

/// How a supervised pool run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolExit {
    /// `signal` fired first. The pool is still running and must be drained.
    Requested,
    /// The pool task returned or panicked without being asked to.
    Stopped,
}

/// Wait for either the shutdown `signal` or the pool task ending on its own.
/// After [`PoolExit::Stopped`] nothing is consuming the subscription.
pub async fn supervise(pool: &mut JoinHandle<()>, signal: impl Future<Output = ()>) -> PoolExit {
    tokio::select! {
        joined = pool => {
            match joined {
                Ok(()) => error!("Consumer pool stopped unexpectedly"),
                Err(e) => error!(error = %e, "Consumer pool task failed"),
            }
            PoolExit::Stopped
        }
        _ = signal => PoolExit::Requested,
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
