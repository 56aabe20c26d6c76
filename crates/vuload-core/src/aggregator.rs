//! Concurrent aggregation of per-iteration samples.
//!
//! Counters are plain atomics. Latencies go into an HDR histogram guarded by a
//! `parking_lot::Mutex`; recording a value is constant-time, so the critical
//! section never grows with the number of samples or the test duration.
//!
//! # Error bound
//!
//! The histogram tracks 1µs to 1h with 3 significant digits: every value it
//! reports for a percentile lies within 0.1% (relative) of the true sample at
//! that rank. Memory is fixed at construction time.

use crate::metrics::{ITERATIONS_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION};
use crate::sample::Sample;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Highest trackable latency in microseconds (1 hour).
const LATENCY_HIGH_US: u64 = 3_600_000_000;

/// Significant value digits kept by the latency histogram.
const LATENCY_SIGFIG: u8 = 3;

/// Status codes 0..=999 get a dedicated counter slot; anything above is
/// counted under a mutex.
const STATUS_SLOTS: usize = 1000;

/// Shared, process-wide aggregate for one test run.
pub struct MetricsAggregator {
    started_at: Instant,
    requests: AtomicU64,
    failures: AtomicU64,
    transport_errors: AtomicU64,
    checks_passed: AtomicU64,
    checks_failed: AtomicU64,
    status_counts: Box<[AtomicU64]>,
    overflow_statuses: Mutex<BTreeMap<u16, u64>>,
    latency_us: Mutex<Histogram<u64>>,
}

impl MetricsAggregator {
    /// Create an empty aggregator; elapsed time is measured from here.
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            checks_passed: AtomicU64::new(0),
            checks_failed: AtomicU64::new(0),
            status_counts: (0..STATUS_SLOTS).map(|_| AtomicU64::new(0)).collect(),
            overflow_statuses: Mutex::new(BTreeMap::new()),
            latency_us: Mutex::new(
                Histogram::new_with_bounds(1, LATENCY_HIGH_US, LATENCY_SIGFIG)
                    .expect("static histogram bounds are valid"),
            ),
        }
    }

    /// Fold one sample into the aggregate. Safe to call from any task.
    pub fn record(&self, sample: Sample) {
        let micros = u64::try_from(sample.latency().as_micros()).unwrap_or(u64::MAX);
        self.latency_us.lock().saturating_record(micros);

        self.requests.fetch_add(1, Ordering::Relaxed);
        if sample.is_failure() {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        match sample.outcome().status() {
            Some(code) => {
                match self.status_counts.get(usize::from(code)) {
                    Some(slot) => {
                        slot.fetch_add(1, Ordering::Relaxed);
                    }
                    None => *self.overflow_statuses.lock().entry(code).or_insert(0) += 1,
                }
                REQUESTS_TOTAL.with_label_values(&[&code.to_string()]).inc();
            }
            None => {
                self.transport_errors.fetch_add(1, Ordering::Relaxed);
                REQUESTS_TOTAL.with_label_values(&["error"]).inc();
            }
        }
        self.checks_passed
            .fetch_add(u64::from(sample.checks_passed()), Ordering::Relaxed);
        self.checks_failed
            .fetch_add(u64::from(sample.checks_failed()), Ordering::Relaxed);

        REQUEST_DURATION.observe(sample.latency().as_secs_f64());
        ITERATIONS_TOTAL.inc();
    }

    /// Number of samples recorded so far.
    pub fn count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Copy the current state. Counters are read individually, so a snapshot
    /// taken mid-run may be off by the samples recorded while it was taken.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut status_counts: BTreeMap<u16, u64> = self
            .status_counts
            .iter()
            .enumerate()
            .filter_map(|(code, slot)| {
                let count = slot.load(Ordering::Relaxed);
                (count > 0).then_some((code as u16, count))
            })
            .collect();
        status_counts.extend(self.overflow_statuses.lock().iter().map(|(code, count)| (*code, *count)));

        MetricsSnapshot {
            elapsed: self.started_at.elapsed(),
            requests: self.requests.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            checks_passed: self.checks_passed.load(Ordering::Relaxed),
            checks_failed: self.checks_failed.load(Ordering::Relaxed),
            status_counts,
            latency_us: self.latency_us.lock().clone(),
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Immutable copy of the aggregate state.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Time since the aggregator was created
    pub elapsed: Duration,

    /// Total requests (one per iteration)
    pub requests: u64,

    /// Requests that errored or returned a non-2xx status
    pub failures: u64,

    /// Requests that never produced a status
    pub transport_errors: u64,

    pub checks_passed: u64,
    pub checks_failed: u64,

    /// Responses per status code
    pub status_counts: BTreeMap<u16, u64>,

    latency_us: Histogram<u64>,
}

impl MetricsSnapshot {
    /// Override the elapsed time used for rate computations.
    #[must_use]
    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    /// Fraction of failed requests (0.0-1.0), `None` without requests.
    pub fn error_rate(&self) -> Option<f64> {
        ratio(self.failures, self.requests)
    }

    /// Fraction of passed checks (0.0-1.0), `None` when no check ran.
    pub fn checks_rate(&self) -> Option<f64> {
        ratio(self.checks_passed, self.checks_passed + self.checks_failed)
    }

    /// Requests per second over the elapsed time.
    pub fn request_rate(&self) -> Option<f64> {
        let secs = self.elapsed.as_secs_f64();
        if self.requests == 0 || secs == 0.0 {
            return None;
        }
        Some(self.requests as f64 / secs)
    }

    /// Latency at percentile `p` (0.0-100.0).
    pub fn latency_percentile(&self, p: f64) -> Option<Duration> {
        if self.latency_us.is_empty() {
            return None;
        }
        let quantile = (p / 100.0).clamp(0.0, 1.0);
        Some(Duration::from_micros(self.latency_us.value_at_quantile(quantile)))
    }

    pub fn latency_min(&self) -> Option<Duration> {
        (!self.latency_us.is_empty()).then(|| Duration::from_micros(self.latency_us.min()))
    }

    pub fn latency_max(&self) -> Option<Duration> {
        (!self.latency_us.is_empty()).then(|| Duration::from_micros(self.latency_us.max()))
    }

    pub fn latency_mean(&self) -> Option<Duration> {
        (!self.latency_us.is_empty())
            .then(|| Duration::from_secs_f64(self.latency_us.mean() / 1_000_000.0))
    }

    /// Number of latency values in the histogram.
    pub fn latency_count(&self) -> u64 {
        self.latency_us.len()
    }

    /// Serializable summary with latencies in milliseconds.
    pub fn summary(&self) -> MetricsSummary {
        let ms = |d: Option<Duration>| d.map(|d| d.as_secs_f64() * 1000.0);
        MetricsSummary {
            duration_seconds: self.elapsed.as_secs_f64(),
            total_requests: self.requests,
            failed_requests: self.failures,
            transport_errors: self.transport_errors,
            error_rate: self.error_rate(),
            requests_per_second: self.request_rate(),
            checks_passed: self.checks_passed,
            checks_failed: self.checks_failed,
            status_counts: self
                .status_counts
                .iter()
                .map(|(code, count)| (code.to_string(), *count))
                .collect(),
            latency_ms: LatencySummary {
                min: ms(self.latency_min()),
                mean: ms(self.latency_mean()),
                p50: ms(self.latency_percentile(50.0)),
                p90: ms(self.latency_percentile(90.0)),
                p95: ms(self.latency_percentile(95.0)),
                p99: ms(self.latency_percentile(99.0)),
                max: ms(self.latency_max()),
            },
        }
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

/// Report-friendly view of a [`MetricsSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub duration_seconds: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub transport_errors: u64,
    pub error_rate: Option<f64>,
    pub requests_per_second: Option<f64>,
    pub checks_passed: u64,
    pub checks_failed: u64,
    pub status_counts: BTreeMap<String, u64>,
    pub latency_ms: LatencySummary,
}

/// Latency statistics in milliseconds; `None` without samples.
#[derive(Debug, Clone, Serialize)]
pub struct LatencySummary {
    pub min: Option<f64>,
    pub mean: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub max: Option<f64>,
}
