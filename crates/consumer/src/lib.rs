//! Consumer worker pool: drains broker deliveries into store updates.

pub mod handler;
pub mod metrics;
pub mod pool;

pub use handler::{ApplyPolicy, Outcome, SwipeHandler};
pub use metrics::{PoolMetrics, PoolSnapshot};
pub use pool::{supervise, ConsumerPool, PoolExit};
