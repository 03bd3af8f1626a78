use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Rejected before touching storage.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store throttled: {0}")]
    Throttled(String),

    #[error("store call timed out after {0}ms")]
    Timeout(u64),

    /// A stored item could not be read back into an aggregate.
    #[error("corrupt item for user {user_id}: {reason}")]
    Corrupt { user_id: i64, reason: String },
}

impl StoreError {
    /// Transient failures that a retry may clear.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Throttled(_) | StoreError::Timeout(_)
        )
    }
}
