//! Consumer pool against the in-memory broker and scripted stores.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::timeout;

use twinder_consumer::{
    supervise, ApplyPolicy, ConsumerPool, Outcome, PoolExit, PoolMetrics, SwipeHandler,
};
use twinder_core::config::DurabilityMode;
use twinder_core::{Direction, SwipeRequest, UserMatches, UserStats};
use twinder_metrics::ThroughputCounter;
use twinder_queue::{MemoryBroker, Publisher, QueueError, Subscription};
use twinder_store::{PartitionedStore, StoreError, UserStore};

const TIMEOUT: Duration = Duration::from_secs(5);

fn swipe_body(swiper: i64, swipee: i64, direction: &str) -> Vec<u8> {
    SwipeRequest {
        swiper: swiper.to_string(),
        swipee: swipee.to_string(),
        comment: "hey".into(),
    }
    .validate(direction)
    .unwrap()
    .encode()
    .unwrap()
}

fn handler_for(store: Arc<dyn UserStore>, policy: ApplyPolicy) -> SwipeHandler {
    SwipeHandler::new(
        store,
        policy,
        Arc::new(PoolMetrics::new()),
        Arc::new(ThroughputCounter::new()),
    )
}

fn retrying() -> ApplyPolicy {
    ApplyPolicy {
        mode: DurabilityMode::RetryThenDeadLetter,
        max_attempts: 3,
        backoff: Duration::from_millis(5),
        store_timeout: Duration::from_millis(200),
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ── Scripted stores / publishers ─────────────────────────────────

/// Fails the first `failures` writes, then delegates.
struct FlakyStore {
    inner: PartitionedStore,
    failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: PartitionedStore::default(),
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl UserStore for FlakyStore {
    async fn apply_swipe(&self, user: i64, swipee: i64, d: Direction) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("scripted failure".into()));
        }
        self.inner.apply_swipe(user, swipee, d).await
    }

    async fn get_user_stats(&self, user: i64) -> Result<Option<UserStats>, StoreError> {
        self.inner.get_user_stats(user).await
    }

    async fn get_matches(&self, user: i64) -> Result<Option<UserMatches>, StoreError> {
        self.inner.get_matches(user).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}

/// Sleeps on every write and records the peak number of concurrent writes.
struct SlowStore {
    inner: PartitionedStore,
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl SlowStore {
    fn new(delay: Duration) -> Self {
        Self {
            inner: PartitionedStore::default(),
            delay,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl UserStore for SlowStore {
    async fn apply_swipe(&self, user: i64, swipee: i64, d: Direction) -> Result<(), StoreError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        let result = self.inner.apply_swipe(user, swipee, d).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn get_user_stats(&self, user: i64) -> Result<Option<UserStats>, StoreError> {
        self.inner.get_user_stats(user).await
    }

    async fn get_matches(&self, user: i64) -> Result<Option<UserMatches>, StoreError> {
        self.inner.get_matches(user).await
    }

    fn backend_name(&self) -> &'static str {
        "slow"
    }
}

/// Applies the first write, then hangs forever as if the worker died
/// before it could acknowledge.
struct CrashAfterWrite {
    inner: PartitionedStore,
    crashed: AtomicBool,
}

#[async_trait]
impl UserStore for CrashAfterWrite {
    async fn apply_swipe(&self, user: i64, swipee: i64, d: Direction) -> Result<(), StoreError> {
        self.inner.apply_swipe(user, swipee, d).await?;
        if !self.crashed.swap(true, Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn get_user_stats(&self, user: i64) -> Result<Option<UserStats>, StoreError> {
        self.inner.get_user_stats(user).await
    }

    async fn get_matches(&self, user: i64) -> Result<Option<UserMatches>, StoreError> {
        self.inner.get_matches(user).await
    }

    fn backend_name(&self) -> &'static str {
        "crash-after-write"
    }
}

struct DownPublisher;

#[async_trait]
impl Publisher for DownPublisher {
    async fn publish(&self, _body: Vec<u8>) -> Result<(), QueueError> {
        Err(QueueError::Connection("dead-letter exchange unreachable".into()))
    }

    fn backend_name(&self) -> &'static str {
        "down"
    }
}

// ── Handler outcomes ─────────────────────────────────────────────

#[tokio::test]
async fn poison_delivery_is_rejected_without_requeue() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(PartitionedStore::default());
    let handler = handler_for(store.clone(), ApplyPolicy::default());

    for body in [
        b"not json".to_vec(),
        br#"{"swiper":"x","swipee":"2","comment":"","direction":"left"}"#.to_vec(),
        br#"{"swiper":"1","swipee":"2","comment":"","direction":"up"}"#.to_vec(),
    ] {
        broker.publish(body).await.unwrap();
        let d = sub.next_delivery().await.unwrap().unwrap();
        assert_eq!(handler.handle(d).await, Outcome::Rejected);
    }

    assert!(timeout(Duration::from_millis(100), sub.next_delivery()).await.is_err());
    assert_eq!(sub.stats().rejected, 3);
    assert_eq!(handler.metrics().snapshot().rejected, 3);
    assert_eq!(store.get_user_stats(1).await.unwrap(), None);
}

#[tokio::test]
async fn applied_swipe_is_acked_and_counted() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(PartitionedStore::default());
    let throughput = Arc::new(ThroughputCounter::new());
    let handler = SwipeHandler::new(
        store.clone(),
        ApplyPolicy::default(),
        Arc::new(PoolMetrics::new()),
        throughput.clone(),
    );

    broker.publish(swipe_body(42, 7, "right")).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::Applied);

    assert_eq!(sub.stats().acked, 1);
    assert_eq!(throughput.current(), 1);
    assert_eq!(
        store.get_user_stats(42).await.unwrap(),
        Some(UserStats { num_likes: 1, num_dislikes: 0 })
    );
}

#[tokio::test]
async fn ack_always_drops_failed_update() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let handler = handler_for(store.clone(), ApplyPolicy::default());

    broker.publish(swipe_body(1, 2, "left")).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::Dropped);

    assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    assert_eq!(sub.stats().acked, 1);
    assert!(timeout(Duration::from_millis(100), sub.next_delivery()).await.is_err());
    assert_eq!(handler.metrics().snapshot().apply_failed, 1);
}

#[tokio::test]
async fn retry_mode_recovers_from_transient_failures() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(FlakyStore::new(2));
    let handler = handler_for(store.clone(), retrying());

    broker.publish(swipe_body(1, 2, "right")).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::Applied);
    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert_eq!(store.get_matches(1).await.unwrap().unwrap().match_list, vec![2]);
}

#[tokio::test]
async fn retry_mode_dead_letters_after_max_attempts() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let dead = Arc::new(MemoryBroker::new("swipes.dead"));
    let dead_sub = dead.subscribe("parking", 8).await;

    let store = Arc::new(FlakyStore::new(u32::MAX));
    let handler = handler_for(store.clone(), retrying()).with_dead_letter(dead.clone());

    let body = swipe_body(9, 10, "left");
    broker.publish(body.clone()).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::DeadLettered);

    assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    assert_eq!(sub.stats().acked, 1);
    let parked = dead_sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(parked.body, body);
    assert_eq!(handler.metrics().snapshot().dead_lettered, 1);
}

#[tokio::test]
async fn failed_dead_letter_requeues() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(FlakyStore::new(3));
    let handler = handler_for(store.clone(), retrying()).with_dead_letter(Arc::new(DownPublisher));

    broker.publish(swipe_body(5, 6, "right")).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::Requeued);

    // Store has recovered by the time the broker redelivers.
    let again = sub.next_delivery().await.unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(handler.handle(again).await, Outcome::Applied);
    assert_eq!(handler.metrics().snapshot().requeued, 1);
    assert_eq!(
        store.get_user_stats(5).await.unwrap(),
        Some(UserStats { num_likes: 1, num_dislikes: 0 })
    );
}

#[tokio::test]
async fn unbound_dead_letter_exchange_requeues() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    // Nothing is bound to the dead-letter exchange, so a parked copy would vanish.
    let dead = Arc::new(MemoryBroker::new("swipes.dead"));
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let handler = handler_for(store.clone(), retrying()).with_dead_letter(dead);

    let body = swipe_body(7, 8, "left");
    broker.publish(body.clone()).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::Requeued);

    let snap = handler.metrics().snapshot();
    assert_eq!(snap.dead_lettered, 0);
    assert_eq!(snap.requeued, 1);
    assert_eq!(sub.stats().acked, 0);

    let again = timeout(TIMEOUT, sub.next_delivery()).await.unwrap().unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(again.body, body);
}

#[tokio::test]
async fn redelivery_after_crash_double_applies() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(CrashAfterWrite {
        inner: PartitionedStore::default(),
        crashed: AtomicBool::new(false),
    });
    let policy = ApplyPolicy {
        store_timeout: Duration::from_secs(60),
        ..ApplyPolicy::default()
    };
    let handler = handler_for(store.clone(), policy);

    broker.publish(swipe_body(3, 4, "right")).await.unwrap();

    // The handler writes, then is torn down before it can ack.
    let first = sub.next_delivery().await.unwrap().unwrap();
    assert!(timeout(Duration::from_millis(100), handler.handle(first)).await.is_err());
    assert_eq!(sub.stats().acked, 0);

    let again = timeout(TIMEOUT, sub.next_delivery()).await.unwrap().unwrap().unwrap();
    assert!(again.redelivered);
    assert_eq!(handler.handle(again).await, Outcome::Applied);

    assert_eq!(sub.stats().acked, 1);
    assert_eq!(
        store.get_user_stats(3).await.unwrap(),
        Some(UserStats { num_likes: 2, num_dislikes: 0 })
    );
    assert_eq!(store.get_matches(3).await.unwrap().unwrap().match_list, vec![4]);
}

// ── Pool ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_respects_concurrency_limit() {
    let broker = Arc::new(MemoryBroker::new("swipes"));
    let sub = broker.subscribe("g", 128).await;
    let store = Arc::new(SlowStore::new(Duration::from_millis(20)));
    let handler = Arc::new(handler_for(store.clone(), ApplyPolicy::default()));
    let metrics = handler.metrics().clone();

    let (tx, rx) = watch::channel(false);
    let pool = ConsumerPool::new(Arc::new(sub), handler, 3).spawn(rx);

    for i in 0..20 {
        broker.publish(swipe_body(100, i, "right")).await.unwrap();
    }
    wait_until(|| metrics.settled() == 20).await;
    tx.send(true).unwrap();
    timeout(TIMEOUT, pool).await.unwrap().unwrap();

    assert!(store.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(metrics.snapshot().applied, 20);
    assert_eq!(
        store.get_user_stats(100).await.unwrap(),
        Some(UserStats { num_likes: 20, num_dislikes: 0 })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_drains_in_flight_handlers() {
    let broker = Arc::new(MemoryBroker::new("swipes"));
    let sub = broker.subscribe("g", 128).await;
    let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
    let handler = Arc::new(handler_for(store.clone(), ApplyPolicy::default()));
    let metrics = handler.metrics().clone();

    let (tx, rx) = watch::channel(false);
    let pool = ConsumerPool::new(Arc::new(sub), handler, 4).spawn(rx);

    for i in 0..4 {
        broker.publish(swipe_body(i + 1, 99, "left")).await.unwrap();
    }
    wait_until(|| metrics.snapshot().in_flight == 4).await;
    tx.send(true).unwrap();
    timeout(TIMEOUT, pool).await.unwrap().unwrap();

    let snap = metrics.snapshot();
    assert_eq!(snap.applied, 4);
    assert_eq!(snap.in_flight, 0);
    assert_eq!(broker.group_stats("g").await.unwrap().acked, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn store_deadline_counts_as_failure() {
    let broker = Arc::new(MemoryBroker::new("swipes"));
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(SlowStore::new(Duration::from_millis(500)));
    let policy = ApplyPolicy {
        store_timeout: Duration::from_millis(20),
        ..ApplyPolicy::default()
    };
    let handler = handler_for(store, policy);

    broker.publish(swipe_body(1, 2, "right")).await.unwrap();
    let d = sub.next_delivery().await.unwrap().unwrap();
    assert_eq!(handler.handle(d).await, Outcome::Dropped);
}

// ── Supervision ──────────────────────────────────────────────────

#[tokio::test]
async fn supervise_reports_pool_that_stops_on_its_own() {
    let broker = MemoryBroker::new("swipes");
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(PartitionedStore::default());
    let handler = Arc::new(handler_for(store, ApplyPolicy::default()));

    let (_tx, rx) = watch::channel(false);
    let mut pool = ConsumerPool::new(Arc::new(sub), handler, 2).spawn(rx);

    // Broker going away ends the subscription without any shutdown request.
    broker.close();
    let exit = timeout(TIMEOUT, supervise(&mut pool, std::future::pending::<()>()))
        .await
        .unwrap();
    assert_eq!(exit, PoolExit::Stopped);
}

#[tokio::test]
async fn supervise_returns_on_signal_and_pool_still_drains() {
    let broker = Arc::new(MemoryBroker::new("swipes"));
    let sub = broker.subscribe("g", 8).await;
    let store = Arc::new(PartitionedStore::default());
    let handler = Arc::new(handler_for(store.clone(), ApplyPolicy::default()));
    let metrics = handler.metrics().clone();

    let (tx, rx) = watch::channel(false);
    let mut pool = ConsumerPool::new(Arc::new(sub), handler, 2).spawn(rx);

    broker.publish(swipe_body(1, 2, "right")).await.unwrap();
    wait_until(|| metrics.settled() == 1).await;

    let exit = supervise(&mut pool, async {}).await;
    assert_eq!(exit, PoolExit::Requested);

    tx.send(true).unwrap();
    timeout(TIMEOUT, pool).await.unwrap().unwrap();
    assert_eq!(metrics.snapshot().applied, 1);
}
