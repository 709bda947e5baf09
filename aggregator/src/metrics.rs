//! Prometheus metrics for bucket queries and writes

use anyhow::Context;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_histogram, Counter, CounterVec, Encoder,
    Histogram, TextEncoder,
};

// ── Query metrics ────────────────────────────────────────────────────────────

pub static QUERIES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("tally_queries_total", "Bucket queries executed", &["shape"]).unwrap()
});

pub static QUERY_ERRORS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("tally_query_errors_total", "Bucket queries that failed", &["kind"])
        .unwrap()
});

pub static QUERY_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "tally_query_duration_seconds",
        "Bucket query latency, repository call included",
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap()
});

pub static PERIODS_SYNTHESIZED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tally_periods_synthesized_total",
        "Zero-count periods added while gap-filling"
    )
    .unwrap()
});

// ── Write metrics ────────────────────────────────────────────────────────────

pub static RECORDS_STORED: Lazy<Counter> = Lazy::new(|| {
    register_counter!("tally_records_stored_total", "Records written to repositories").unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&families, &mut buffer)
        .context("failed to encode metrics")?;
    String::from_utf8(buffer).context("metrics output is not UTF-8")
}
