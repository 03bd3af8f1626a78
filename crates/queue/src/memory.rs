//! In-process fan-out broker with per-group prefetch and redelivery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::error::QueueError;
use crate::traits::{Acknowledge, Delivery, Publisher, Subscription};

#[derive(Debug)]
struct QueuedMessage {
    body: Arc<[u8]>,
    redelivered: bool,
}

/// Per-group counters.
#[derive(Debug, Default)]
struct GroupCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    redelivered: AtomicU64,
}

/// Point-in-time view of a group's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GroupStats {
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub rejected: u64,
    pub redelivered: u64,
    /// Deliveries handed out and not yet settled.
    pub in_flight: u64,
}

struct GroupQueue {
    name: String,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: Mutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    prefetch: Arc<Semaphore>,
    prefetch_limit: usize,
    next_tag: AtomicU64,
    counters: GroupCounters,
}

impl GroupQueue {
    fn new(name: String, prefetch: u16) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let limit = usize::from(prefetch.max(1));
        Self {
            name,
            tx,
            rx: Mutex::new(rx),
            prefetch: Arc::new(Semaphore::new(limit)),
            prefetch_limit: limit,
            next_tag: AtomicU64::new(1),
            counters: GroupCounters::default(),
        }
    }

    fn enqueue(&self, body: Arc<[u8]>, redelivered: bool) -> Result<(), QueueError> {
        self.tx
            .send(QueuedMessage { body, redelivered })
            .map_err(|_| QueueError::Closed)
    }

    fn stats(&self) -> GroupStats {
        let c = &self.counters;
        GroupStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            acked: c.acked.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            in_flight: (self.prefetch_limit - self.prefetch.available_permits()) as u64,
        }
    }
}

/// In-process fan-out exchange.
///
/// Each named consumer group owns one queue; every publish enqueues a copy
/// into every group. Subscriptions on the same group compete for its
/// messages. At most `prefetch` deliveries per group are unsettled at once.
pub struct MemoryBroker {
    exchange: String,
    groups: RwLock<HashMap<String, Arc<GroupQueue>>>,
    anon_seq: AtomicU64,
    closed: watch::Sender<bool>,
}

impl MemoryBroker {
    pub fn new(exchange: impl Into<String>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            exchange: exchange.into(),
            groups: RwLock::new(HashMap::new()),
            anon_seq: AtomicU64::new(0),
            closed,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    /// Bind a consumer group and return a subscription to it.
    ///
    /// Binding an existing group joins it as a competing consumer; the first
    /// bind fixes the group's prefetch. An empty name creates a private,
    /// uniquely named group.
    pub async fn subscribe(&self, group: &str, prefetch: u16) -> MemorySubscription {
        let name = if group.is_empty() {
            let n = self.anon_seq.fetch_add(1, Ordering::Relaxed);
            format!("{}.anon-{}", self.exchange, n)
        } else {
            group.to_string()
        };

        let queue = {
            let mut groups = self.groups.write().await;
            groups
                .entry(name.clone())
                .or_insert_with(|| {
                    info!(exchange = %self.exchange, group = %name, prefetch, "Bound consumer group");
                    Arc::new(GroupQueue::new(name.clone(), prefetch))
                })
                .clone()
        };

        MemorySubscription {
            group: queue,
            closed: self.closed.subscribe(),
        }
    }

    pub async fn group_stats(&self, group: &str) -> Option<GroupStats> {
        self.groups.read().await.get(group).map(|q| q.stats())
    }

    pub async fn group_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop accepting publishes and end all subscriptions.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl MemoryBroker {
    /// Copy `body` to every bound group. Returns how many groups got it.
    async fn fan_out(&self, body: Vec<u8>) -> Result<usize, QueueError> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }
        let body: Arc<[u8]> = body.into();
        let groups = self.groups.read().await;
        for queue in groups.values() {
            queue.enqueue(body.clone(), false)?;
            queue.counters.published.fetch_add(1, Ordering::Relaxed);
        }
        Ok(groups.len())
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        if self.fan_out(body).await? == 0 {
            debug!(exchange = %self.exchange, "No groups bound, message dropped");
        }
        Ok(())
    }

    async fn publish_routed(&self, body: Vec<u8>) -> Result<(), QueueError> {
        match self.fan_out(body).await? {
            0 => Err(QueueError::Unroutable(format!(
                "no groups bound to {}",
                self.exchange
            ))),
            _ => Ok(()),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// Subscription to one [`MemoryBroker`] consumer group.
pub struct MemorySubscription {
    group: Arc<GroupQueue>,
    closed: watch::Receiver<bool>,
}

impl MemorySubscription {
    pub fn group(&self) -> &str {
        &self.group.name
    }

    pub fn stats(&self) -> GroupStats {
        self.group.stats()
    }

    async fn receive(&self) -> Option<Delivery> {
        let permit = self.group.prefetch.clone().acquire_owned().await.ok()?;
        let msg = {
            let mut rx = self.group.rx.lock().await;
            rx.recv().await?
        };

        let counters = &self.group.counters;
        counters.delivered.fetch_add(1, Ordering::Relaxed);
        if msg.redelivered {
            counters.redelivered.fetch_add(1, Ordering::Relaxed);
        }
        let tag = self.group.next_tag.fetch_add(1, Ordering::Relaxed);

        let acker = MemoryAcker {
            group: self.group.clone(),
            body: msg.body.clone(),
            settled: AtomicBool::new(false),
            _permit: permit,
        };
        Some(Delivery::new(tag, msg.body.to_vec(), msg.redelivered, Box::new(acker)))
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_delivery(&self) -> Option<Result<Delivery, QueueError>> {
        let mut closed = self.closed.clone();
        if *closed.borrow_and_update() {
            return None;
        }
        tokio::select! {
            _ = closed.wait_for(|c| *c) => None,
            delivery = self.receive() => delivery.map(Ok),
        }
    }
}

/// Holds one prefetch slot until the delivery is settled or dropped.
struct MemoryAcker {
    group: Arc<GroupQueue>,
    body: Arc<[u8]>,
    settled: AtomicBool,
    _permit: OwnedSemaphorePermit,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(), QueueError> {
        if self.settled.swap(true, Ordering::AcqRel) {
            return Err(QueueError::Ack("delivery already settled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<(), QueueError> {
        self.settle()?;
        self.group.counters.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), QueueError> {
        self.settle()?;
        self.group.counters.rejected.fetch_add(1, Ordering::Relaxed);
        if requeue {
            self.group.enqueue(self.body.clone(), true)?;
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::Acquire) {
            warn!(group = %self.group.name, "Delivery dropped unsettled, requeueing");
            let _ = self.group.enqueue(self.body.clone(), true);
        }
    }
}
