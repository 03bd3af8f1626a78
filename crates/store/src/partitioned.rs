use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use twinder_core::{Direction, UserAggregate, UserMatches, UserStats};

use crate::error::StoreError;
use crate::shard::{ShardKey, ShardRouter};
use crate::UserStore;

/// In-process partitioned store: one map and one lock per shard.
///
/// Writes to users in different shards never contend. Within a shard, a
/// write holds the shard lock for the whole read-modify-write, which makes
/// each update atomic per key.
#[derive(Debug)]
pub struct PartitionedStore {
    router: ShardRouter,
    shards: Vec<RwLock<HashMap<i64, UserAggregate>>>,
}

impl PartitionedStore {
    pub fn new(router: ShardRouter) -> Self {
        let shards = (0..router.shard_count())
            .map(|_| RwLock::new(HashMap::new()))
            .collect();
        Self { router, shards }
    }

    pub fn router(&self) -> &ShardRouter {
        &self.router
    }

    fn shard(&self, user_id: i64) -> &RwLock<HashMap<i64, UserAggregate>> {
        let ShardKey(idx) = self.router.shard_of(user_id);
        &self.shards[idx]
    }

    /// Number of users held by each shard, in shard order.
    pub async fn shard_sizes(&self) -> Vec<usize> {
        let mut sizes = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            sizes.push(shard.read().await.len());
        }
        sizes
    }
}

impl Default for PartitionedStore {
    fn default() -> Self {
        Self::new(ShardRouter::default())
    }
}

#[async_trait]
impl UserStore for PartitionedStore {
    async fn apply_swipe(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: Direction,
    ) -> Result<(), StoreError> {
        let mut shard = self.shard(user_id).write().await;
        shard.entry(user_id).or_default().apply(swipee_id, direction);
        Ok(())
    }

    async fn get_user_stats(&self, user_id: i64) -> Result<Option<UserStats>, StoreError> {
        Ok(self
            .shard(user_id)
            .read()
            .await
            .get(&user_id)
            .map(UserAggregate::stats))
    }

    async fn get_matches(&self, user_id: i64) -> Result<Option<UserMatches>, StoreError> {
        Ok(self
            .shard(user_id)
            .read()
            .await
            .get(&user_id)
            .map(UserAggregate::match_list))
    }

    fn backend_name(&self) -> &'static str {
        "partitioned"
    }
}
