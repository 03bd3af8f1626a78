use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use twinder_core::{Direction, UserAggregate, UserMatches, UserStats};

use crate::error::StoreError;
use crate::UserStore;

/// Single-map store behind one mutex.
///
/// Every write for every user serializes on the same lock, so throughput is
/// capped by one core. Use [`PartitionedStore`](crate::PartitionedStore) when
/// that matters.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<i64, UserAggregate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.users.lock().await.len()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn apply_swipe(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: Direction,
    ) -> Result<(), StoreError> {
        let mut users = self.users.lock().await;
        users.entry(user_id).or_default().apply(swipee_id, direction);
        Ok(())
    }

    async fn get_user_stats(&self, user_id: i64) -> Result<Option<UserStats>, StoreError> {
        Ok(self.users.lock().await.get(&user_id).map(UserAggregate::stats))
    }

    async fn get_matches(&self, user_id: i64) -> Result<Option<UserMatches>, StoreError> {
        Ok(self
            .users
            .lock()
            .await
            .get(&user_id)
            .map(UserAggregate::match_list))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
