//! HTTP calls against the ingress.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use twinder_core::{Direction, SwipeRequest};

use crate::error::HarnessError;

/// Result of a read request. A 404 still proves the store answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    Found,
    NotFound,
}

/// The operations the harness drives. One call, no retries.
#[async_trait]
pub trait LoadTarget: Send + Sync {
    async fn swipe(&self, direction: Direction, request: &SwipeRequest) -> Result<(), HarnessError>;

    async fn user_stats(&self, user_id: i64) -> Result<ReadOutcome, HarnessError>;

    async fn user_matches(&self, user_id: i64) -> Result<ReadOutcome, HarnessError>;
}

/// `reqwest` client bound to one server URL, sharing a connection pool.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: reqwest::Client,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration, max_idle: usize) -> Result<Self, HarnessError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(max_idle)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| HarnessError::Setup(e.to_string()))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn read(&self, path: &str) -> Result<ReadOutcome, HarnessError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .send()
            .await?;
        match resp.status() {
            StatusCode::OK => Ok(ReadOutcome::Found),
            StatusCode::NOT_FOUND => Ok(ReadOutcome::NotFound),
            status => Err(status_error(status, resp).await),
        }
    }
}

#[async_trait]
impl LoadTarget for ApiClient {
    async fn swipe(&self, direction: Direction, request: &SwipeRequest) -> Result<(), HarnessError> {
        let resp = self
            .http
            .post(format!("{}/swipe/{}/", self.base_url, direction.token()))
            .json(request)
            .send()
            .await?;
        let status = resp.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            Ok(())
        } else {
            Err(status_error(status, resp).await)
        }
    }

    async fn user_stats(&self, user_id: i64) -> Result<ReadOutcome, HarnessError> {
        self.read(&format!("/stats/{user_id}")).await
    }

    async fn user_matches(&self, user_id: i64) -> Result<ReadOutcome, HarnessError> {
        self.read(&format!("/matches/{user_id}")).await
    }
}

async fn status_error(status: StatusCode, resp: reqwest::Response) -> HarnessError {
    HarnessError::Status {
        status: status.as_u16(),
        body: resp.text().await.unwrap_or_default(),
    }
}
