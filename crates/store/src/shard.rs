//! Range-bucketed routing from user id to physical shard.

use std::fmt;

/// Index of a physical shard, `0..shard_count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardKey(pub usize);

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard-{}", self.0)
    }
}

/// Maps user ids onto `shard_count` buckets of `bucket_width` ids each.
///
/// Ids `1..=width` land in shard 0, the next `width` ids in shard 1, and so on.
/// Everything above the last boundary lands in the last shard, everything
/// below 1 in shard 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: usize,
    bucket_width: i64,
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self::new(5, 1000)
    }
}

impl ShardRouter {
    /// Counts and widths below 1 are raised to 1.
    pub fn new(shard_count: usize, bucket_width: i64) -> Self {
        Self {
            shard_count: shard_count.max(1),
            bucket_width: bucket_width.max(1),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shard_count
    }

    pub fn shard_of(&self, user_id: i64) -> ShardKey {
        let bucket = user_id.saturating_sub(1).div_euclid(self.bucket_width);
        let last = (self.shard_count - 1) as i64;
        ShardKey(bucket.clamp(0, last) as usize)
    }

    /// Physical table name for a shard, numbered from 1: `SwipeData1`, ...
    pub fn table_name(&self, prefix: &str, key: ShardKey) -> String {
        format!("{}{}", prefix, key.0 + 1)
    }
}
