//! Throughput counting and periodic flushing to a metrics sink.

pub mod counter;
pub mod sink;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use twinder_core::config::{MetricsConfig, MetricsSinkKind};

pub use counter::ThroughputCounter;
pub use sink::{AxiomSink, LogSink, MetricsError, MetricsSink, PointSource, ThroughputPoint};

/// Build the configured sink. Call after `Config::validate()`; a missing
/// Axiom dataset or token falls back to the log sink.
pub fn build_sink(config: &MetricsConfig, source: PointSource) -> Arc<dyn MetricsSink> {
    match (config.sink, &config.axiom_dataset, &config.axiom_api_token) {
        (MetricsSinkKind::Axiom, Some(dataset), Some(token)) => {
            let sink = AxiomSink::new(&config.axiom_url, dataset, token, source);
            info!(url = sink.url(), "Metrics: Axiom sink");
            Arc::new(sink)
        }
        (MetricsSinkKind::Axiom, _, _) => {
            warn!("Axiom sink selected without dataset/token, logging throughput instead");
            Arc::new(LogSink::new(source))
        }
        (MetricsSinkKind::Log, _, _) => Arc::new(LogSink::new(source)),
    }
}

/// Take the counter and ship it. A failed ship restores the taken count so it
/// is reported with the next window.
pub async fn flush_once(counter: &ThroughputCounter, sink: &dyn MetricsSink) -> Result<u64, MetricsError> {
    let taken = counter.take();
    match sink.ship(taken).await {
        Ok(()) => Ok(taken),
        Err(e) => {
            counter.restore(taken);
            Err(e)
        }
    }
}

/// Flush every `period` until `shutdown` flips to true, then flush once more.
pub fn spawn_flush_task(
    counter: Arc<ThroughputCounter>,
    sink: Arc<dyn MetricsSink>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = flush_once(&counter, sink.as_ref()).await {
                        warn!(sink = sink.sink_name(), error = %e, "Metrics flush failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = flush_once(&counter, sink.as_ref()).await {
            warn!(sink = sink.sink_name(), error = %e, "Final metrics flush failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        shipped: Mutex<Vec<u64>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl MetricsSink for RecordingSink {
        async fn ship(&self, throughput: u64) -> Result<(), MetricsError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(MetricsError::Rejected {
                    status: 503,
                    body: "down".into(),
                });
            }
            self.shipped.lock().await.push(throughput);
            Ok(())
        }

        fn sink_name(&self) -> &str {
            "recording"
        }
    }

    #[tokio::test]
    async fn failed_flush_is_reported_next_window() {
        let counter = ThroughputCounter::new();
        let sink = RecordingSink::default();

        counter.increment();
        counter.increment();
        sink.fail.store(true, Ordering::SeqCst);
        assert!(flush_once(&counter, &sink).await.is_err());
        assert_eq!(counter.current(), 2);

        counter.increment();
        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(flush_once(&counter, &sink).await.unwrap(), 3);
        assert_eq!(*sink.shipped.lock().await, vec![3]);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_task_ticks_and_flushes_on_shutdown() {
        let counter = Arc::new(ThroughputCounter::new());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = watch::channel(false);

        let handle = spawn_flush_task(counter.clone(), sink.clone(), Duration::from_secs(5), rx);

        counter.increment();
        tokio::time::sleep(Duration::from_millis(5_100)).await;
        counter.increment();
        counter.increment();
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*sink.shipped.lock().await, vec![1, 2]);
    }

    #[test]
    fn build_sink_follows_config() {
        let mut config = twinder_core::Config::from_vars("", &Default::default())
            .unwrap()
            .metrics;
        let source = PointSource::Server("s".into());
        assert_eq!(build_sink(&config, source.clone()).sink_name(), "log");

        config.sink = MetricsSinkKind::Axiom;
        config.axiom_dataset = Some("swipes".into());
        config.axiom_api_token = Some("tok".into());
        assert_eq!(build_sink(&config, source).sink_name(), "axiom");
    }
}
