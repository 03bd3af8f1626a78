//! consumer-worker: drains a RabbitMQ consumer group into the user store.
//!
//! Binds the configured group to the swipes exchange, runs a bounded pool of
//! handlers, ships consumer throughput to the metrics sink and serves
//! `GET /health` with the pool counters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use twinder_consumer::{
    supervise, ApplyPolicy, PoolExit, PoolMetrics, PoolSnapshot, SwipeHandler,
};
use twinder_core::config::{self, BrokerBackend, Config};
use twinder_metrics::{build_sink, spawn_flush_task, PointSource, ThroughputCounter};

// ── CLI ─────────────────────────────────────────────────────────────

/// Swipe consumer worker.
#[derive(Parser, Debug)]
#[command(name = "consumer-worker", version, about)]
struct Cli {
    /// Port for the health endpoint.
    #[arg(long, env = "CONSUMER_HEALTH_PORT", default_value_t = 8081)]
    health_port: u16,

    /// Seconds to wait for in-flight handlers on shutdown.
    #[arg(long, env = "CONSUMER_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

// ── Health ──────────────────────────────────────────────────────────

struct HealthState {
    group: String,
    store: &'static str,
    metrics: Arc<PoolMetrics>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    group: String,
    store: &'static str,
    pool: PoolSnapshot,
}

async fn health(State(state): State<Arc<HealthState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        group: state.group.clone(),
        store: state.store,
        pool: state.metrics.snapshot(),
    })
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    config.validate().context("invalid configuration")?;
    config.log_summary();

    if config.broker.backend != BrokerBackend::Amqp {
        anyhow::bail!(
            "consumer-worker needs BROKER_BACKEND=amqp; the memory broker runs its consumers inside twinder-server"
        );
    }

    let store = twinder_store::build_store(&config.store).await?;
    let metrics = Arc::new(PoolMetrics::new());
    let throughput = Arc::new(ThroughputCounter::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sink = build_sink(
        &config.metrics,
        PointSource::Consumer(config.metrics.instance_id.clone()),
    );
    let flush = spawn_flush_task(
        throughput.clone(),
        sink,
        Duration::from_secs(config.metrics.flush_secs),
        shutdown_rx.clone(),
    );

    let handler = SwipeHandler::new(
        store.clone(),
        ApplyPolicy::from_config(&config.broker, &config.store),
        metrics.clone(),
        throughput,
    );
    let (pool, group) = amqp::build_pool(&config, handler).await?;

    let health_state = Arc::new(HealthState {
        group,
        store: store.backend_name(),
        metrics,
    });
    let app = Router::new()
        .route("/health", get(health))
        .with_state(health_state);
    let addr = format!("{}:{}", config.server.host, cli.health_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("consumer-worker health on http://{}/health", addr);
    let mut health_shutdown = shutdown_rx.clone();
    let health_server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = health_shutdown.wait_for(|s| *s).await;
            })
            .await
    });

    let mut pool = pool.spawn(shutdown_rx);

    let exit = supervise(&mut pool, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
        info!("Shutdown requested");
    })
    .await;
    shutdown_tx.send_replace(true);

    if exit == PoolExit::Requested
        && tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), pool)
            .await
            .is_err()
    {
        warn!("In-flight handlers did not finish in time; unacked deliveries will be redelivered");
    }
    let _ = flush.await;
    let _ = health_server.await;

    if exit == PoolExit::Stopped {
        anyhow::bail!("consumer pool stopped; no deliveries are being consumed");
    }
    info!("consumer-worker exited cleanly");
    Ok(())
}

#[cfg(feature = "amqp")]
mod amqp {
    use std::sync::Arc;

    use twinder_consumer::{ConsumerPool, SwipeHandler};
    use twinder_core::config::{Config, DurabilityMode};
    use twinder_queue::{AmqpBroker, Subscription};

    pub async fn build_pool(
        config: &Config,
        handler: SwipeHandler,
    ) -> anyhow::Result<(ConsumerPool, String)> {
        let uri = config
            .broker
            .amqp_uri()
            .ok_or_else(|| anyhow::anyhow!("RABBITMQ_HOST is not set"))?;
        let broker = AmqpBroker::connect(&uri, &config.broker.exchange).await?;
        let subscription = broker
            .subscribe(&config.broker.consumer_group, config.broker.prefetch)
            .await?;
        let group = subscription.queue().to_string();

        let handler = if config.broker.durability == DurabilityMode::RetryThenDeadLetter {
            let dead = AmqpBroker::connect(&uri, &config.broker.dead_letter_exchange).await?;
            dead.bind_parking_queue().await?;
            handler.with_dead_letter(Arc::new(dead))
        } else {
            handler
        };

        // The subscription's channel lives as long as the connection does.
        let broker = Arc::new(broker);
        let pool = ConsumerPool::new(
            Arc::new(KeepAlive { _broker: broker, inner: subscription }),
            Arc::new(handler),
            config.broker.concurrency,
        );
        Ok((pool, group))
    }

    /// Ties the broker connection's lifetime to the subscription.
    struct KeepAlive {
        _broker: Arc<AmqpBroker>,
        inner: twinder_queue::AmqpSubscription,
    }

    #[async_trait::async_trait]
    impl Subscription for KeepAlive {
        async fn next_delivery(
            &self,
        ) -> Option<Result<twinder_queue::Delivery, twinder_queue::QueueError>> {
            self.inner.next_delivery().await
        }
    }
}

#[cfg(not(feature = "amqp"))]
mod amqp {
    use twinder_consumer::{ConsumerPool, SwipeHandler};
    use twinder_core::config::Config;

    pub async fn build_pool(
        _config: &Config,
        _handler: SwipeHandler,
    ) -> anyhow::Result<(ConsumerPool, String)> {
        anyhow::bail!("consumer-worker was built without the `amqp` feature")
    }
}
