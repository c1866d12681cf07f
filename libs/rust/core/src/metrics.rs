//! Prometheus metrics for the round engine, registered on the default registry.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, Histogram,
    IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

pub struct RoundMetrics {
    pub rounds_completed: IntCounter,
    pub round_retries: IntCounter,
    pub results_accepted: IntCounterVec,
    pub client_failures: IntCounterVec,
    pub dropped_results: IntCounterVec,
    pub connected_clients: IntGauge,
    pub current_round: IntGauge,
    pub aggregation_latency_ms: Histogram,
}

pub static ROUND_METRICS: Lazy<RoundMetrics> = Lazy::new(|| RoundMetrics {
    rounds_completed: register_int_counter!("fedround_rounds_completed_total", "Rounds that reached aggregation")
        .expect("register fedround_rounds_completed_total"),
    round_retries: register_int_counter!("fedround_round_retries_total", "Rounds retried after falling below the minimum")
        .expect("register fedround_round_retries_total"),
    results_accepted: register_int_counter_vec!(
        "fedround_results_accepted_total",
        "Client results accepted for aggregation",
        &["phase"]
    )
    .expect("register fedround_results_accepted_total"),
    client_failures: register_int_counter_vec!(
        "fedround_client_failures_total",
        "Client calls that failed, by phase and failure kind",
        &["phase", "kind"]
    )
    .expect("register fedround_client_failures_total"),
    dropped_results: register_int_counter_vec!(
        "fedround_dropped_results_total",
        "Responses dropped without being merged (stale connection, duplicate)",
        &["phase", "reason"]
    )
    .expect("register fedround_dropped_results_total"),
    connected_clients: register_int_gauge!("fedround_connected_clients", "Live client sessions")
        .expect("register fedround_connected_clients"),
    current_round: register_int_gauge!("fedround_current_round", "Round the coordinator is working on")
        .expect("register fedround_current_round"),
    aggregation_latency_ms: register_histogram!(
        "fedround_aggregation_latency_ms",
        "FedAvg aggregation latency in milliseconds",
        vec![0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0]
    )
    .expect("register fedround_aggregation_latency_ms"),
});

/// Text exposition of everything in the default registry.
pub fn encode() -> String {
    Lazy::force(&ROUND_METRICS);
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        tracing::warn!(error = %e, "metrics_encode_failed");
    }
    String::from_utf8(buf).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_lists_round_metrics() {
        ROUND_METRICS.results_accepted.with_label_values(&["fit"]).inc();
        let text = encode();
        assert!(text.contains("fedround_results_accepted_total"));
        assert!(text.contains("fedround_connected_clients"));
    }
}
