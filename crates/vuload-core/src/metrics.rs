//! Prometheus metric definitions
//!
//! Mirrors the aggregate state into the default Prometheus registry so a run
//! can be exported in the text exposition format. Metrics are registered
//! lazily on first access using once_cell::Lazy.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Requests issued by virtual users, labelled by status code (`error` for transport failures)
pub static REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "vuload_requests_total",
        "Total number of requests issued by virtual users",
        &["status"]
    )
    .expect("Failed to register requests counter")
});

/// Request latency histogram
pub static REQUEST_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "vuload_request_duration_seconds",
        "Iteration request latency in seconds",
        // Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .expect("Failed to register request duration histogram")
});

/// Completed iterations
pub static ITERATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "vuload_iterations_total",
        "Total number of completed iterations"
    )
    .expect("Failed to register iterations counter")
});

/// Currently running virtual users
pub static ACTIVE_VUS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!("vuload_active_vus", "Number of running virtual users")
        .expect("Failed to register active VUs gauge")
});

/// Render every registered metric in the Prometheus text format.
pub fn export_text() -> Result<String, prometheus::Error> {
    // Touch the statics so they appear even before the first sample.
    Lazy::force(&REQUESTS_TOTAL);
    Lazy::force(&REQUEST_DURATION);
    Lazy::force(&ITERATIONS_TOTAL);
    Lazy::force(&ACTIVE_VUS);

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
