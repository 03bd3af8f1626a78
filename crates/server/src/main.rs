//! twinder-server: swipe ingress.
//!
//! With `BROKER_BACKEND=memory` the consumer pool runs in this process and
//! drains the in-memory exchange into the configured store. With `amqp` the
//! server only publishes; `consumer-worker` processes do the aggregation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use twinder_consumer::{
    supervise, ApplyPolicy, ConsumerPool, PoolExit, PoolMetrics, SwipeHandler,
};
use twinder_core::config::{self, BrokerBackend, Config, DurabilityMode};
use twinder_metrics::{build_sink, spawn_flush_task, PointSource, ThroughputCounter};
use twinder_queue::{MemoryBroker, Publisher};
use twinder_server::{build_router, AppState};
use twinder_store::UserStore;

/// Swipe ingress server.
#[derive(Parser, Debug)]
#[command(name = "twinder-server", version, about)]
struct Cli {
    /// Seconds to wait for in-process consumers on shutdown.
    #[arg(long, env = "SERVER_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

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

    let store = twinder_store::build_store(&config.store).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let throughput = Arc::new(ThroughputCounter::new());
    let flush = spawn_flush_task(
        throughput.clone(),
        build_sink(
            &config.metrics,
            PointSource::Server(config.metrics.instance_id.clone()),
        ),
        Duration::from_secs(config.metrics.flush_secs),
        shutdown_rx.clone(),
    );

    let mut background = vec![flush];
    let (publisher, mut pool): (Arc<dyn Publisher>, Option<JoinHandle<()>>) =
        match config.broker.backend {
            BrokerBackend::Memory => {
                let wired = in_process(&config, store.clone(), shutdown_rx.clone()).await;
                background.push(wired.consumer_flush);
                (wired.publisher, Some(wired.pool))
            }
            BrokerBackend::Amqp => (amqp::publisher(&config).await?, None),
        };

    let state = Arc::new(AppState::new(
        publisher,
        store,
        throughput,
        Duration::from_millis(config.store.timeout_ms),
    ));
    let app = build_router(state, &config.server.cors_origin);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("twinder-server listening on http://{}", addr);
    info!("API docs at http://{}/docs", addr);

    let mut serve_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = serve_shutdown.wait_for(|s| *s).await;
            })
            .await
    });

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
        }
        info!("Shutdown requested");
    };
    let exit = match pool.as_mut() {
        Some(handle) => supervise(handle, ctrl_c).await,
        None => {
            ctrl_c.await;
            PoolExit::Requested
        }
    };
    shutdown_tx.send_replace(true);

    if exit == PoolExit::Requested {
        background.extend(pool);
    }
    let drain = async {
        match server.await {
            Ok(Err(e)) => warn!(error = %e, "HTTP server error"),
            Err(e) => warn!(error = %e, "HTTP server task failed"),
            Ok(Ok(())) => {}
        }
        join_all(background).await;
    };
    if tokio::time::timeout(Duration::from_secs(cli.shutdown_timeout), drain)
        .await
        .is_err()
    {
        warn!("Background tasks did not finish in time");
    }

    if exit == PoolExit::Stopped {
        anyhow::bail!("in-process consumer pool stopped; published swipes would never be applied");
    }
    info!("twinder-server exited cleanly");
    Ok(())
}

async fn join_all(handles: Vec<JoinHandle<()>>) {
    for handle in handles {
        let _ = handle.await;
    }
}

struct InProcess {
    publisher: Arc<dyn Publisher>,
    pool: JoinHandle<()>,
    consumer_flush: JoinHandle<()>,
}

/// Wire the in-memory exchange to a consumer pool in this process.
async fn in_process(
    config: &Config,
    store: Arc<dyn UserStore>,
    shutdown: watch::Receiver<bool>,
) -> InProcess {
    let broker = Arc::new(MemoryBroker::new(config.broker.exchange.clone()));
    let subscription = broker
        .subscribe(&config.broker.consumer_group, config.broker.prefetch)
        .await;
    info!(
        exchange = broker.exchange(),
        group = subscription.group(),
        concurrency = config.broker.concurrency,
        "In-process consumer pool"
    );

    if config.broker.durability == DurabilityMode::RetryThenDeadLetter {
        info!("Memory broker has no dead-letter exchange; exhausted swipes are requeued");
    }

    let consumed = Arc::new(ThroughputCounter::new());
    let consumer_flush = spawn_flush_task(
        consumed.clone(),
        build_sink(
            &config.metrics,
            PointSource::Consumer(config.metrics.instance_id.clone()),
        ),
        Duration::from_secs(config.metrics.flush_secs),
        shutdown.clone(),
    );

    let handler = SwipeHandler::new(
        store,
        ApplyPolicy::from_config(&config.broker, &config.store),
        Arc::new(PoolMetrics::new()),
        consumed,
    );
    let pool = ConsumerPool::new(
        Arc::new(subscription),
        Arc::new(handler),
        config.broker.concurrency,
    )
    .spawn(shutdown);

    InProcess {
        publisher: broker,
        pool,
        consumer_flush,
    }
}

#[cfg(feature = "amqp")]
mod amqp {
    use std::sync::Arc;

    use twinder_core::config::Config;
    use twinder_queue::{AmqpBroker, Publisher};

    pub async fn publisher(config: &Config) -> anyhow::Result<Arc<dyn Publisher>> {
        let uri = config
            .broker
            .amqp_uri()
            .ok_or_else(|| anyhow::anyhow!("RABBITMQ_HOST is not set"))?;
        let broker = AmqpBroker::connect(&uri, &config.broker.exchange).await?;
        tracing::info!(exchange = broker.exchange(), "Publishing to RabbitMQ");
        Ok(Arc::new(broker))
    }
}

#[cfg(not(feature = "amqp"))]
mod amqp {
    use std::sync::Arc;

    use twinder_core::config::Config;
    use twinder_queue::Publisher;

    pub async fn publisher(_config: &Config) -> anyhow::Result<Arc<dyn Publisher>> {
        anyhow::bail!("BROKER_BACKEND=amqp requires the `amqp` feature")
    }
}
