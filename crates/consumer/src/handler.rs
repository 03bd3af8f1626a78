//! Per-delivery processing: parse, apply to the store, settle.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use twinder_core::config::{BrokerConfig, DurabilityMode, StoreConfig};
use twinder_core::{SwipeEvent, SwipeMessage};
use twinder_metrics::ThroughputCounter;
use twinder_queue::{Delivery, Publisher};
use twinder_store::{with_deadline, StoreError, UserStore};

use crate::metrics::PoolMetrics;

/// How a failed store update is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyPolicy {
    pub mode: DurabilityMode,
    /// Attempts per delivery in retry mode. Ack-always makes one attempt.
    pub max_attempts: u32,
    /// Delay before retry `i` is `backoff * 2^i`.
    pub backoff: Duration,
    /// Deadline for each store call.
    pub store_timeout: Duration,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        Self {
            mode: DurabilityMode::AckAlways,
            max_attempts: 3,
            backoff: Duration::from_millis(100),
            store_timeout: Duration::from_secs(2),
        }
    }
}

impl ApplyPolicy {
    pub fn from_config(broker: &BrokerConfig, store: &StoreConfig) -> Self {
        Self {
            mode: broker.durability,
            max_attempts: broker.apply_max_attempts.max(1),
            backoff: Duration::from_millis(broker.apply_backoff_ms),
            store_timeout: Duration::from_millis(store.timeout_ms),
        }
    }

    fn attempts(&self) -> u32 {
        match self.mode {
            DurabilityMode::AckAlways => 1,
            DurabilityMode::RetryThenDeadLetter => self.max_attempts.max(1),
        }
    }

    fn delay_before_retry(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Final state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Store updated and acknowledged.
    Applied,
    /// Unparseable body, rejected without requeue.
    Rejected,
    /// Store update failed and the delivery was acknowledged anyway.
    Dropped,
    /// Store update failed, body forwarded to the dead-letter exchange.
    DeadLettered,
    /// Store update and dead-lettering both failed; returned to the broker.
    Requeued,
}

/// Stateless apart from its shared references; one instance serves every
/// handler task in a pool.
pub struct SwipeHandler {
    store: Arc<dyn UserStore>,
    policy: ApplyPolicy,
    dead_letter: Option<Arc<dyn Publisher>>,
    metrics: Arc<PoolMetrics>,
    throughput: Arc<ThroughputCounter>,
}

impl SwipeHandler {
    pub fn new(
        store: Arc<dyn UserStore>,
        policy: ApplyPolicy,
        metrics: Arc<PoolMetrics>,
        throughput: Arc<ThroughputCounter>,
    ) -> Self {
        Self {
            store,
            policy,
            dead_letter: None,
            metrics,
            throughput,
        }
    }

    pub fn with_dead_letter(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.dead_letter = Some(publisher);
        self
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub async fn handle(&self, delivery: Delivery) -> Outcome {
        self.metrics.received.fetch_add(1, Ordering::Relaxed);

        let event = match SwipeMessage::decode(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(tag = delivery.tag, error = %e, "Discarding unparseable delivery");
                self.metrics.rejected.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = delivery.reject(false).await {
                    error!(error = %e, "Failed to reject delivery");
                }
                return Outcome::Rejected;
            }
        };

        if delivery.redelivered {
            debug!(tag = delivery.tag, swiper = event.swiper_id, "Processing redelivered swipe");
        }

        let failure = match self.apply(&event).await {
            Ok(()) => {
                self.metrics.applied.fetch_add(1, Ordering::Relaxed);
                self.throughput.increment();
                settle(delivery.ack().await);
                return Outcome::Applied;
            }
            Err(e) => e,
        };

        self.metrics.apply_failed.fetch_add(1, Ordering::Relaxed);
        match self.policy.mode {
            DurabilityMode::AckAlways => {
                error!(
                    swiper = event.swiper_id,
                    swipee = event.swipee_id,
                    direction = %event.direction,
                    error = %failure,
                    "Store update failed, swipe dropped"
                );
                settle(delivery.ack().await);
                Outcome::Dropped
            }
            DurabilityMode::RetryThenDeadLetter => self.dead_letter_or_requeue(delivery, failure).await,
        }
    }

    async fn apply(&self, event: &SwipeEvent) -> Result<(), StoreError> {
        let attempts = self.policy.attempts();
        let mut attempt = 0;
        loop {
            let result = with_deadline(
                self.policy.store_timeout,
                self.store
                    .apply_swipe(event.swiper_id, event.swipee_id, event.direction),
            )
            .await;

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt + 1 < attempts && e.is_transient() => {
                    let delay = self.policy.delay_before_retry(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store update failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dead_letter_or_requeue(&self, delivery: Delivery, failure: StoreError) -> Outcome {
        // Only ack once the copy is confirmed to sit in a queue.
        if let Some(ref dlx) = self.dead_letter {
            match dlx.publish_routed(delivery.body.clone()).await {
                Ok(()) => {
                    warn!(tag = delivery.tag, error = %failure, "Swipe dead-lettered");
                    self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    settle(delivery.ack().await);
                    return Outcome::DeadLettered;
                }
                Err(e) => {
                    error!(tag = delivery.tag, error = %e, "Dead-letter publish failed");
                }
            }
        }

        warn!(tag = delivery.tag, error = %failure, "Requeueing swipe");
        self.metrics.requeued.fetch_add(1, Ordering::Relaxed);
        settle(delivery.reject(true).await);
        Outcome::Requeued
    }
}

fn settle(result: Result<(), twinder_queue::QueueError>) {
    if let Err(e) = result {
        error!(error = %e, "Failed to settle delivery");
    }
}
