//! load-harness: drive the swipe ingress and report throughput and latency.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use twinder_harness::health::serve_health;
use twinder_harness::{run, ApiClient, HarnessConfig, RetryPolicy, RunReport, WritePoolConfig};

// ── CLI ─────────────────────────────────────────────────────────────

/// Swipe load generator.
#[derive(Parser, Debug)]
#[command(name = "load-harness", version, about)]
struct Cli {
    /// Base URL of the ingress, e.g. http://localhost:8080
    #[arg(long, env = "SERVER_URL")]
    server_url: String,

    /// Total swipes to send.
    #[arg(long, env = "HARNESS_REQUESTS", default_value_t = 1000)]
    requests: usize,

    /// Concurrent write workers.
    #[arg(long, env = "HARNESS_WORKERS", default_value_t = 10)]
    workers: usize,

    /// Concurrent read workers.
    #[arg(long, env = "HARNESS_READERS", default_value_t = 1)]
    readers: usize,

    /// Interval between reads.
    #[arg(long, env = "HARNESS_READ_TICK_MS", default_value_t = 1000)]
    read_tick_ms: u64,

    /// Attempts per swipe, including the first.
    #[arg(long, env = "HARNESS_MAX_ATTEMPTS", default_value_t = 5)]
    max_attempts: u32,

    /// Base backoff; retry i waits 2^i times this plus jitter.
    #[arg(long, env = "HARNESS_BASE_DELAY_MS", default_value_t = 100)]
    base_delay_ms: u64,

    /// Upper bound of the uniform jitter added to each backoff.
    #[arg(long, env = "HARNESS_JITTER_MS", default_value_t = 1000)]
    jitter_ms: u64,

    /// Per-request client timeout.
    #[arg(long, env = "HARNESS_TIMEOUT_MS", default_value_t = 5000)]
    timeout_ms: u64,

    /// Pause each write worker after every swipe.
    #[arg(long, env = "HARNESS_THINK_TIME_MS", default_value_t = 0)]
    think_time_ms: u64,

    /// Serve `GET /health` on this port while the run is in progress.
    #[arg(long, env = "HARNESS_HEALTH_PORT")]
    health_port: Option<u16>,

    /// Print the report as JSON on stdout.
    #[arg(long)]
    json: bool,
}

fn log_report(report: &RunReport) {
    info!("Total run time: {:.2}s", report.elapsed_secs);
    info!("Throughput: {:.2} req/sec", report.throughput);
    info!(
        success = report.write.success,
        errors = report.write.errors,
        "Write pool"
    );
    if let Some(ref l) = report.write.latency {
        info!(
            "Write latency ms: mean={:.2} median={:.2} p99={:.2} min={:.2} max={:.2}",
            l.mean, l.median, l.p99, l.min, l.max
        );
    }
    info!(
        success = report.read.success,
        errors = report.read.errors,
        "Read pool"
    );
    if let Some(ref l) = report.read.latency {
        info!(
            "Read latency ms: mean={:.2} median={:.2} p99={:.2} min={:.2} max={:.2}",
            l.mean, l.median, l.p99, l.min, l.max
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    twinder_core::config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client = ApiClient::new(
        &cli.server_url,
        Duration::from_millis(cli.timeout_ms),
        cli.workers + cli.readers,
    )?;
    info!(url = client.base_url(), "Target");

    let config = HarnessConfig {
        requests: cli.requests,
        write: WritePoolConfig {
            workers: cli.workers,
            retry: RetryPolicy {
                max_attempts: cli.max_attempts,
                base_delay: Duration::from_millis(cli.base_delay_ms),
                jitter_max: Duration::from_millis(cli.jitter_ms),
            },
            think_time: Duration::from_millis(cli.think_time_ms),
        },
        read_workers: cli.readers,
        read_tick: Duration::from_millis(cli.read_tick_ms),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = match cli.health_port {
        Some(port) => {
            let addr = format!("0.0.0.0:{port}");
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .with_context(|| format!("failed to bind {addr}"))?;
            Some(tokio::spawn(serve_health(listener, shutdown_rx)))
        }
        None => None,
    };

    let report = run(Arc::new(client), &config).await;
    shutdown_tx.send_replace(true);
    if let Some(health) = health {
        match health.await {
            Ok(Err(e)) => warn!(error = %e, "Health server error"),
            Err(e) => warn!(error = %e, "Health server task failed"),
            Ok(Ok(())) => {}
        }
    }
    log_report(&report);
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
