//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};

/// Metrics prefix for all Quarry metrics
pub const METRICS_PREFIX: &str = "quarry";

/// Buckets for end-to-end query latency (in seconds).
/// Cache hits should land under 25ms; generation dominates the tail.
pub const QUERY_BUCKETS: &[f64] = &[
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms - cached answer target
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
];

/// Buckets for embedding latency (typically slower)
pub const EMBEDDING_BUCKETS: &[f64] = &[
    0.010,  // 10ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Query metrics
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of answered queries by outcome"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end query latency in seconds"
    );

    describe_gauge!(
        format!("{}_context_tokens", METRICS_PREFIX),
        Unit::Count,
        "Tokens used by the most recent assembled context"
    );

    // Retrieval metrics
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Document store retrieval latency in seconds"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API errors"
    );

    // Generation metrics
    describe_counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total generation provider calls"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Generation latency in seconds"
    );

    describe_gauge!(
        format!("{}_circuit_state", METRICS_PREFIX),
        Unit::Count,
        "Circuit state per dependency (0 closed, 1 half open, 2 open)"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
    );

    describe_counter!(
        format!("{}_cache_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache backing store failures"
    );

    describe_counter!(
        format!("{}_prompt_sanitized_total", METRICS_PREFIX),
        Unit::Count,
        "Queries replaced by the injection guard"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record end-to-end query metrics
pub fn record_query(duration_secs: f64, status: &str, from_cache: bool) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "status" => status.to_string(),
        "from_cache" => from_cache.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        "status" => status.to_string()
    )
    .record(duration_secs);
}

/// Helper to record assembled context size
pub fn record_context_tokens(tokens: usize) {
    gauge!(format!("{}_context_tokens", METRICS_PREFIX)).set(tokens as f64);
}

/// Helper to record retrieval latency
pub fn record_retrieval(duration_secs: f64, result_count: usize) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "empty" => (result_count == 0).to_string()
    )
    .record(duration_secs);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Helper to record a generation attempt
pub fn record_generation(duration_secs: f64, provider: &str, outcome: &str) {
    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "provider" => provider.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        "provider" => provider.to_string()
    )
    .record(duration_secs);
}

/// Generation call refused by an open circuit; no latency is recorded
pub fn record_generation_rejected(provider: &str) {
    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "provider" => provider.to_string(),
        "outcome" => "circuit_open"
    )
    .increment(1);
}

/// Helper to publish circuit breaker state
pub fn record_circuit_state(service: &str, state_code: u8) {
    gauge!(
        format!("{}_circuit_state", METRICS_PREFIX),
        "service" => service.to_string()
    )
    .set(f64::from(state_code));
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}

/// Helper to record a cache backing store failure
pub fn record_cache_error(cache_name: &str, operation: &str) {
    counter!(
        format!("{}_cache_errors_total", METRICS_PREFIX),
        "cache" => cache_name.to_string(),
        "op" => operation.to_string()
    )
    .increment(1);
}

/// Helper to count sanitized prompts
pub fn record_sanitized_prompt(rule: &str) {
    counter!(
        format!("{}_prompt_sanitized_total", METRICS_PREFIX),
        "rule" => rule.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [QUERY_BUCKETS, EMBEDDING_BUCKETS] {
            let mut prev = 0.0;
            for &bucket in buckets {
                assert!(bucket > prev);
                prev = bucket;
            }
        }
        // Cached answer target should be a bucket edge
        assert!(QUERY_BUCKETS.contains(&0.025));
    }

    #[test]
    fn test_recorders_without_exporter() {
        // No recorder installed: calls must be no-ops, not panics
        record_query(0.01, "answered", false);
        record_cache(true, "l1");
        record_cache_error("l2", "get");
        record_circuit_state("generation", 2);
    }
}
