//! Destinations for throughput points.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Errors that can occur while shipping a throughput point.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ingest endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Which kind of process emitted a point. Serialized as `serverId` or
/// `consumerId` next to the other fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PointSource {
    #[serde(rename = "serverId")]
    Server(String),
    #[serde(rename = "consumerId")]
    Consumer(String),
}

impl PointSource {
    pub fn id(&self) -> &str {
        match self {
            PointSource::Server(id) | PointSource::Consumer(id) => id,
        }
    }
}

/// One flushed window: `{_time, serverId|consumerId, throughput}`.
#[derive(Debug, Clone, Serialize)]
pub struct ThroughputPoint {
    #[serde(rename = "_time")]
    pub time: DateTime<Utc>,
    #[serde(flatten)]
    pub source: PointSource,
    pub throughput: u64,
}

impl ThroughputPoint {
    pub fn now(source: PointSource, throughput: u64) -> Self {
        Self {
            time: Utc::now(),
            source,
            throughput,
        }
    }
}

#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Ship the count taken for one flush window.
    async fn ship(&self, throughput: u64) -> Result<(), MetricsError>;

    fn sink_name(&self) -> &str;
}

// ── Log sink ──────────────────────────────────────────────────

/// Emits points as structured log events only.
#[derive(Debug, Clone)]
pub struct LogSink {
    source: PointSource,
}

impl LogSink {
    pub fn new(source: PointSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl MetricsSink for LogSink {
    async fn ship(&self, throughput: u64) -> Result<(), MetricsError> {
        info!(source = self.source.id(), throughput, "Throughput");
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "log"
    }
}

// ── Axiom sink ────────────────────────────────────────────────

/// Posts each point as a one-element JSON array to an Axiom dataset.
#[derive(Debug, Clone)]
pub struct AxiomSink {
    url: String,
    token: String,
    source: PointSource,
    client: reqwest::Client,
}

impl AxiomSink {
    /// `base_url` is the API root, e.g. `https://api.axiom.co`.
    pub fn new(base_url: &str, dataset: &str, token: &str, source: PointSource) -> Self {
        Self {
            url: format!(
                "{}/v1/datasets/{}/ingest",
                base_url.trim_end_matches('/'),
                dataset
            ),
            token: token.to_string(),
            source,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl MetricsSink for AxiomSink {
    async fn ship(&self, throughput: u64) -> Result<(), MetricsError> {
        let points = [ThroughputPoint::now(self.source.clone(), throughput)];

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&points)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            warn!(url = %self.url, %status, "Axiom ingest rejected point");
            return Err(MetricsError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(url = %self.url, throughput, "Throughput shipped");
        Ok(())
    }

    fn sink_name(&self) -> &str {
        "axiom"
    }
}
