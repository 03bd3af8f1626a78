//! Fan-out publish/subscribe with acknowledged, redeliverable deliveries.

pub mod error;
pub mod memory;
pub mod traits;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::QueueError;
pub use memory::{GroupStats, MemoryBroker, MemorySubscription};
pub use traits::{Acknowledge, Delivery, Publisher, Subscription};

#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpSubscription};
