use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::QueueError;

/// Publishes message bodies to a fan-out exchange.
///
/// Every consumer group bound to the exchange receives its own copy. With no
/// groups bound the message is dropped.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError>;

    /// Publish and fail with [`QueueError::Unroutable`] unless at least one
    /// bound queue took the message. Used where a dropped message is a loss,
    /// such as dead-lettering.
    ///
    /// Backends that cannot observe routing refuse the publish.
    async fn publish_routed(&self, body: Vec<u8>) -> Result<(), QueueError> {
        let _ = body;
        Err(QueueError::Unroutable(format!(
            "{} backend cannot confirm routing",
            self.backend_name()
        )))
    }

    /// Short backend label for health output and logs.
    fn backend_name(&self) -> &'static str;
}

/// Blanket implementation so `Arc<dyn Publisher>` can be used directly.
#[async_trait]
impl<T: Publisher + ?Sized> Publisher for Arc<T> {
    async fn publish(&self, body: Vec<u8>) -> Result<(), QueueError> {
        (**self).publish(body).await
    }

    async fn publish_routed(&self, body: Vec<u8>) -> Result<(), QueueError> {
        (**self).publish_routed(body).await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

/// One consumer's view of a consumer group queue.
///
/// Competing subscriptions on the same group split its messages between them.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Wait for the next delivery. `None` once the subscription is closed.
    ///
    /// Blocks while the group's prefetch budget is exhausted.
    async fn next_delivery(&self) -> Option<Result<Delivery, QueueError>>;
}

#[async_trait]
impl<T: Subscription + ?Sized> Subscription for Arc<T> {
    async fn next_delivery(&self) -> Option<Result<Delivery, QueueError>> {
        (**self).next_delivery().await
    }
}

/// Backend-specific settlement of a single delivery.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;

    async fn reject(&self, requeue: bool) -> Result<(), QueueError>;
}

/// A message handed to a consumer, settled exactly once via [`ack`](Self::ack)
/// or [`reject`](Self::reject).
///
/// Dropping a delivery without settling it returns the message to its group.
pub struct Delivery {
    pub tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(tag: u64, body: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledge>) -> Self {
        Self {
            tag,
            body,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<(), QueueError> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("tag", &self.tag)
            .field("len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
