//! Latency aggregation and the run report.

use std::time::Duration;

use serde::Serialize;

/// Summary of a latency sample set, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencySummary {
    pub count: usize,
    pub mean: f64,
    pub median: f64,
    /// Nearest-rank 99th percentile.
    pub p99: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencySummary {
    /// `None` for an empty sample set.
    pub fn from_samples(samples: &[Duration]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut ms: Vec<f64> = samples.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
        ms.sort_by(f64::total_cmp);

        let count = ms.len();
        let mean = ms.iter().sum::<f64>() / count as f64;
        let median = if count % 2 == 1 {
            ms[count / 2]
        } else {
            (ms[count / 2 - 1] + ms[count / 2]) / 2.0
        };
        let rank = ((0.99 * count as f64).ceil() as usize).clamp(1, count);

        Some(Self {
            count,
            mean,
            median,
            p99: ms[rank - 1],
            min: ms[0],
            max: ms[count - 1],
        })
    }
}

/// What one worker observed. Owned by the worker until it is joined.
#[derive(Debug, Clone, Default)]
pub struct WorkerReport {
    pub worker_id: usize,
    pub latencies: Vec<Duration>,
    pub success: u64,
    pub errors: u64,
}

/// Totals for one pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    pub workers: usize,
    pub requests: usize,
    pub success: u64,
    pub errors: u64,
    pub latency: Option<LatencySummary>,
}

impl PoolReport {
    pub fn from_workers(reports: &[WorkerReport]) -> Self {
        let samples: Vec<Duration> = reports
            .iter()
            .flat_map(|r| r.latencies.iter().copied())
            .collect();
        Self {
            workers: reports.len(),
            requests: samples.len(),
            success: reports.iter().map(|r| r.success).sum(),
            errors: reports.iter().map(|r| r.errors).sum(),
            latency: LatencySummary::from_samples(&samples),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub elapsed_secs: f64,
    /// Successful writes per second of wall-clock time.
    pub throughput: f64,
    pub write: PoolReport,
    pub read: PoolReport,
}

impl RunReport {
    pub fn new(elapsed: Duration, write: PoolReport, read: PoolReport) -> Self {
        let secs = elapsed.as_secs_f64();
        let throughput = if secs > 0.0 {
            write.success as f64 / secs
        } else {
            0.0
        };
        Self {
            elapsed_secs: secs,
            throughput,
            write,
            read,
        }
    }
}
