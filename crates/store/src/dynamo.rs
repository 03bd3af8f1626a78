//! DynamoDB-backed store: one table per shard, one `UpdateItem` per swipe.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_dynamodb::config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::error::ProvideErrorMetadata;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use tracing::{debug, info};

use twinder_core::config::StoreConfig;
use twinder_core::{Direction, UserMatches, UserStats};

use crate::error::StoreError;
use crate::shard::ShardRouter;
use crate::UserStore;

const KEY_ATTR: &str = "userId";
const LIKES_ATTR: &str = "numLikes";
const DISLIKES_ATTR: &str = "numDislikes";
const MATCHES_ATTR: &str = "matchList";

const LIKE_EXPR: &str =
    "ADD numLikes :one, matchList :swipee SET numDislikes = if_not_exists(numDislikes, :zero)";
const DISLIKE_EXPR: &str = "ADD numDislikes :one SET numLikes = if_not_exists(numLikes, :zero)";

const THROTTLE_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
];

pub struct DynamoStore {
    client: Client,
    router: ShardRouter,
    table_prefix: String,
}

impl DynamoStore {
    pub async fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let mut builder = aws_sdk_dynamodb::Config::builder()
            .region(Region::new(config.region.clone()))
            .behavior_version(BehaviorVersion::latest());

        if let (Some(key_id), Some(secret)) = (&config.access_key_id, &config.secret_access_key) {
            let creds = Credentials::new(
                key_id,
                secret,
                config.session_token.clone(),
                None,
                "twinder-store-static",
            );
            builder = builder.credentials_provider(creds);
        } else {
            // Fall back to the default provider chain (instance role, profile, ...).
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            if let Some(provider) = shared.credentials_provider() {
                builder = builder.credentials_provider(provider);
            }
        }

        if let Some(ref endpoint) = config.endpoint_url {
            let url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                endpoint.clone()
            } else {
                format!("https://{endpoint}")
            };
            builder = builder.endpoint_url(url);
        }

        let router = ShardRouter::new(config.shard_count, config.shard_width);
        info!(
            region = %config.region,
            prefix = %config.table_prefix,
            shards = router.shard_count(),
            "DynamoDB store initialized"
        );

        Ok(Self {
            client: Client::from_conf(builder.build()),
            router,
            table_prefix: config.table_prefix.clone(),
        })
    }

    fn table_for(&self, user_id: i64) -> String {
        self.router
            .table_name(&self.table_prefix, self.router.shard_of(user_id))
    }

    async fn fetch_item(
        &self,
        user_id: i64,
    ) -> Result<Option<HashMap<String, AttributeValue>>, StoreError> {
        let out = self
            .client
            .get_item()
            .table_name(self.table_for(user_id))
            .key(KEY_ATTR, AttributeValue::N(user_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| classify("GetItem", &e))?;
        Ok(out.item)
    }
}

#[async_trait]
impl UserStore for DynamoStore {
    async fn apply_swipe(
        &self,
        user_id: i64,
        swipee_id: i64,
        direction: Direction,
    ) -> Result<(), StoreError> {
        let table = self.table_for(user_id);
        let mut req = self
            .client
            .update_item()
            .table_name(&table)
            .key(KEY_ATTR, AttributeValue::N(user_id.to_string()))
            .expression_attribute_values(":one", AttributeValue::N("1".into()))
            .expression_attribute_values(":zero", AttributeValue::N("0".into()));

        req = match direction {
            Direction::Like => req
                .update_expression(LIKE_EXPR)
                .expression_attribute_values(":swipee", AttributeValue::Ns(vec![swipee_id.to_string()])),
            Direction::Dislike => req.update_expression(DISLIKE_EXPR),
        };

        req.send().await.map_err(|e| classify("UpdateItem", &e))?;
        debug!(%table, user_id, swipee_id, %direction, "Swipe applied");
        Ok(())
    }

    async fn get_user_stats(&self, user_id: i64) -> Result<Option<UserStats>, StoreError> {
        let Some(item) = self.fetch_item(user_id).await? else {
            return Ok(None);
        };
        Ok(Some(UserStats {
            num_likes: read_counter(user_id, &item, LIKES_ATTR)?,
            num_dislikes: read_counter(user_id, &item, DISLIKES_ATTR)?,
        }))
    }

    async fn get_matches(&self, user_id: i64) -> Result<Option<UserMatches>, StoreError> {
        let Some(item) = self.fetch_item(user_id).await? else {
            return Ok(None);
        };
        Ok(Some(UserMatches {
            match_list: read_match_list(user_id, &item)?,
        }))
    }

    fn backend_name(&self) -> &'static str {
        "dynamodb"
    }
}

fn classify<E: ProvideErrorMetadata + std::fmt::Debug>(op: &str, err: &E) -> StoreError {
    let detail = format!("{op}: {}", err.message().unwrap_or("no message"));
    match err.code() {
        Some(code) if THROTTLE_CODES.contains(&code) => StoreError::Throttled(detail),
        Some(code) => StoreError::Unavailable(format!("{detail} ({code})")),
        None => StoreError::Unavailable(format!("{op}: {err:?}")),
    }
}

/// Missing counters read as 0.
fn read_counter(
    user_id: i64,
    item: &HashMap<String, AttributeValue>,
    attr: &str,
) -> Result<u64, StoreError> {
    let Some(value) = item.get(attr) else {
        return Ok(0);
    };
    let raw = value.as_n().map_err(|_| StoreError::Corrupt {
        user_id,
        reason: format!("{attr} is not a number"),
    })?;
    raw.parse().map_err(|_| StoreError::Corrupt {
        user_id,
        reason: format!("{attr}={raw} is not a non-negative integer"),
    })
}

/// Missing match set reads as empty. Output is sorted ascending.
fn read_match_list(
    user_id: i64,
    item: &HashMap<String, AttributeValue>,
) -> Result<Vec<i64>, StoreError> {
    let Some(value) = item.get(MATCHES_ATTR) else {
        return Ok(Vec::new());
    };
    let raw = value.as_ns().map_err(|_| StoreError::Corrupt {
        user_id,
        reason: format!("{MATCHES_ATTR} is not a number set"),
    })?;
    let mut ids = raw
        .iter()
        .map(|s| {
            s.parse::<i64>().map_err(|_| StoreError::Corrupt {
                user_id,
                reason: format!("{MATCHES_ATTR} member {s} is not an id"),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    ids.sort_unstable();
    Ok(ids)
}
