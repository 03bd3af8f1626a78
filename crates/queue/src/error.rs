//! Broker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("acknowledge error: {0}")]
    Ack(String),

    #[error("message unroutable: {0}")]
    Unroutable(String),

    #[error("broker closed")]
    Closed,

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("provider error: {0}")]
    Provider(String),
}
