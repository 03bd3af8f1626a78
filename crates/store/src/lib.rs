//! Per-user swipe aggregates behind the [`UserStore`] contract.

pub mod error;
pub mod memory;
pub mod partitioned;
pub mod shard;

#[cfg(feature = "dynamodb")]
pub mod dynamo;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use twinder_core::config::{StoreBackend, StoreConfig};
use twinder_core::{Direction, UserMatches, UserStats};

pub use error::StoreError;
pub use memory::MemoryStore;
pub use partitioned::PartitionedStore;
pub use shard::{ShardKey, ShardRouter};

#[cfg(feature = "dynamodb")]
pub use dynamo::DynamoStore;

/// Storage contract for per-user like/dislike counters and match sets.
///
/// Updates are atomic per user id. Reads of an id that was never written
/// return `Ok(None)`.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Parse a wire direction token and apply the swipe.
    ///
    /// Unknown tokens fail with [`StoreError::InvalidArgument`] before any
    /// storage is touched.
    async fn update_user_stats(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: &str,
    ) -> Result<(), StoreError> {
        let direction = direction.parse::<Direction>().map_err(|_| {
            StoreError::InvalidArgument(format!("invalid swipe direction: {direction}"))
        })?;
        self.apply_swipe(user_id, swipee_id, direction).await
    }

    /// Like: `numLikes += 1`, `numDislikes` initialised to 0 if absent, swipee
    /// added to the match set. Dislike: `numDislikes += 1`, `numLikes`
    /// initialised to 0 if absent.
    async fn apply_swipe(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: Direction,
    ) -> Result<(), StoreError>;

    async fn get_user_stats(&self, user_id: i64) -> Result<Option<UserStats>, StoreError>;

    async fn get_matches(&self, user_id: i64) -> Result<Option<UserMatches>, StoreError>;

    /// Short backend label for health output and logs.
    fn backend_name(&self) -> &'static str;
}

#[async_trait]
impl<T: UserStore + ?Sized> UserStore for Arc<T> {
    async fn update_user_stats(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: &str,
    ) -> Result<(), StoreError> {
        (**self).update_user_stats(user_id, swipee_id, direction).await
    }

    async fn apply_swipe(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: Direction,
    ) -> Result<(), StoreError> {
        (**self).apply_swipe(user_id, swipee_id, direction).await
    }

    async fn get_user_stats(&self, user_id: i64) -> Result<Option<UserStats>, StoreError> {
        (**self).get_user_stats(user_id).await
    }

    async fn get_matches(&self, user_id: i64) -> Result<Option<UserMatches>, StoreError> {
        (**self).get_matches(user_id).await
    }

    fn backend_name(&self) -> &'static str {
        (**self).backend_name()
    }
}

/// Run a store call under a deadline. Expiry maps to [`StoreError::Timeout`].
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(deadline.as_millis() as u64)),
    }
}

/// Build the configured store backend.
pub async fn build_store(config: &StoreConfig) -> Result<Arc<dyn UserStore>, StoreError> {
    let store: Arc<dyn UserStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Partitioned => Arc::new(PartitionedStore::new(ShardRouter::new(
            config.shard_count,
            config.shard_width,
        ))),
        StoreBackend::DynamoDb => dynamo_store(config).await?,
    };
    info!(backend = store.backend_name(), "User store ready");
    Ok(store)
}

#[cfg(feature = "dynamodb")]
async fn dynamo_store(config: &StoreConfig) -> Result<Arc<dyn UserStore>, StoreError> {
    Ok(Arc::new(DynamoStore::new(config).await?))
}

#[cfg(not(feature = "dynamodb"))]
async fn dynamo_store(_config: &StoreConfig) -> Result<Arc<dyn UserStore>, StoreError> {
    Err(StoreError::Unavailable(
        "STORE_BACKEND=dynamodb requires the `dynamodb` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowStore;

    #[async_trait]
    impl UserStore for SlowStore {
        async fn apply_swipe(&self, _: i64, _: i64, _: Direction) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }

        async fn get_user_stats(&self, _: i64) -> Result<Option<UserStats>, StoreError> {
            Ok(None)
        }

        async fn get_matches(&self, _: i64) -> Result<Option<UserMatches>, StoreError> {
            Ok(None)
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn deadline_maps_to_timeout() {
        let store = SlowStore;
        let err = with_deadline(
            Duration::from_millis(20),
            store.apply_swipe(1, 2, Direction::Like),
        )
        .await
        .unwrap_err();
        assert_eq!(err, StoreError::Timeout(20));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn arc_store_delegates() {
        let store: Arc<dyn UserStore> = Arc::new(MemoryStore::new());
        let shared = Arc::new(store);
        shared.update_user_stats(1, 2, "right").await.unwrap();
        assert_eq!(shared.backend_name(), "memory");
        assert!(shared.get_user_stats(1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn build_store_follows_config() {
        let mut config = twinder_core::Config::from_vars("", &Default::default())
            .unwrap()
            .store;
        assert_eq!(build_store(&config).await.unwrap().backend_name(), "partitioned");

        config.backend = StoreBackend::Memory;
        assert_eq!(build_store(&config).await.unwrap().backend_name(), "memory");
    }
}
