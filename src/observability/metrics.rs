//! Session metrics: a request-latency histogram plus the counters the
//! dispatch paths feed (timeouts, retries, speculative attempts and the
//! connection total).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use histogram::{AtomicHistogram, Histogram};
use thiserror::Error;

const ORDER: Ordering = Ordering::Relaxed;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("histogram error: {0}")]
    Histogram(#[from] Arc<dyn std::error::Error + Send + Sync>),
    #[error("histogram is empty")]
    Empty,
}

/// Point-in-time statistics of the request-latency histogram, in
/// microseconds.
#[non_exhaustive]
#[derive(Debug)]
pub struct Snapshot {
    pub min: u64,
    pub max: u64,
    pub mean: u64,
    pub median: u64,
    pub percentile_95: u64,
    pub percentile_99: u64,
}

pub struct Metrics {
    request_timeouts: AtomicU64,
    pending_request_timeouts: AtomicU64,
    connection_timeouts: AtomicU64,
    total_connections: AtomicU64,
    retries: AtomicU64,
    speculative_executions: AtomicU64,
    request_latencies: AtomicHistogram,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics::default()
    }

    pub(crate) fn inc_request_timeouts(&self) {
        self.request_timeouts.fetch_add(1, ORDER);
    }

    pub(crate) fn inc_pending_request_timeouts(&self) {
        self.pending_request_timeouts.fetch_add(1, ORDER);
    }

    pub(crate) fn inc_connection_timeouts(&self) {
        self.connection_timeouts.fetch_add(1, ORDER);
    }

    pub(crate) fn inc_total_connections(&self) {
        self.total_connections.fetch_add(1, ORDER);
    }

    pub(crate) fn dec_total_connections(&self) {
        self.total_connections.fetch_sub(1, ORDER);
    }

    pub(crate) fn inc_retries(&self) {
        self.retries.fetch_add(1, ORDER);
    }

    pub(crate) fn inc_speculative_executions(&self) {
        self.speculative_executions.fetch_add(1, ORDER);
    }

    /// Records the latency of one completed request, in microseconds.
    pub(crate) fn record_request_latency(&self, latency_micros: u64) {
        // A value past the histogram's range is clamped rather than lost.
        let _ = self
            .request_latencies
            .increment(latency_micros.min(u64::from(u32::MAX)));
    }

    pub fn get_request_timeouts(&self) -> u64 {
        self.request_timeouts.load(ORDER)
    }

    pub fn get_pending_request_timeouts(&self) -> u64 {
        self.pending_request_timeouts.load(ORDER)
    }

    pub fn get_connection_timeouts(&self) -> u64 {
        self.connection_timeouts.load(ORDER)
    }

    pub fn get_total_connections(&self) -> u64 {
        self.total_connections.load(ORDER)
    }

    pub fn get_retries(&self) -> u64 {
        self.retries.load(ORDER)
    }

    pub fn get_speculative_executions(&self) -> u64 {
        self.speculative_executions.load(ORDER)
    }

    /// Snapshot of the request-latency histogram taken at call time.
    pub fn get_snapshot(&self) -> Result<Snapshot, MetricsError> {
        let h = self.request_latencies.load();

        let (min, max) = Self::minmax(&h)?;
        let percentiles = Self::percentiles(&h, &[50.0, 95.0, 99.0])?;

        Ok(Snapshot {
            min,
            max,
            mean: Self::mean(&h)?,
            median: percentiles[0],
            percentile_95: percentiles[1],
            percentile_99: percentiles[2],
        })
    }

    fn mean(h: &Histogram) -> Result<u64, MetricsError> {
        let mut weighted_sum = 0u128;
        let mut count = 0u128;
        for bucket in h {
            let mid = ((bucket.start() + bucket.end()) / 2) as u128;
            weighted_sum += mid * bucket.count() as u128;
            count += bucket.count() as u128;
        }
        if count == 0 {
            return Err(MetricsError::Empty);
        }
        Ok((weighted_sum / count) as u64)
    }

    fn percentiles(h: &Histogram, percentiles: &[f64]) -> Result<Vec<u64>, MetricsError> {
        match h.percentiles(percentiles) {
            Err(err) => Err(MetricsError::Histogram(Arc::new(err))),
            Ok(None) => Err(MetricsError::Empty),
            Ok(Some(ps)) => Ok(ps.into_iter().map(|(_, bucket)| bucket.count()).collect()),
        }
    }

    fn minmax(h: &Histogram) -> Result<(u64, u64), MetricsError> {
        let mut min = u64::MAX;
        let mut max = 0;
        for bucket in h {
            if bucket.count() == 0 {
                continue;
            }
            min = u64::min(min, bucket.start());
            max = u64::max(max, bucket.end());
        }
        if min > max {
            Err(MetricsError::Empty)
        } else {
            Ok((min, max))
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        // grouping_power 10 / max_value_power 32 keeps the histogram around
        // 100 KiB while resolving microsecond latencies up to ~71 minutes.
        let grouping_power = 10;
        let max_value_power = 32;

        Self {
            request_timeouts: AtomicU64::new(0),
            pending_request_timeouts: AtomicU64::new(0),
            connection_timeouts: AtomicU64::new(0),
            total_connections: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            speculative_executions: AtomicU64::new(0),
            request_latencies: AtomicHistogram::new(grouping_power, max_value_power).unwrap(),
        }
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("request_timeouts", &self.request_timeouts)
            .field("pending_request_timeouts", &self.pending_request_timeouts)
            .field("connection_timeouts", &self.connection_timeouts)
            .field("total_connections", &self.total_connections)
            .field("retries", &self.retries)
            .field("speculative_executions", &self.speculative_executions)
            .finish_non_exhaustive()
    }
}
