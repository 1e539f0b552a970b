use axum::response::IntoResponse;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};

lazy_static! {
    // Response cache
    pub static ref CACHE_HITS: CounterVec = register_counter_vec!(
        "anticip8_cache_hits_total",
        "Cache hits",
        &["service", "namespace"]
    )
    .unwrap();

    pub static ref CACHE_MISSES: CounterVec = register_counter_vec!(
        "anticip8_cache_misses_total",
        "Cache misses",
        &["service", "namespace"]
    )
    .unwrap();

    // Prefetch execution
    pub static ref PREFETCH_TOTAL: CounterVec = register_counter_vec!(
        "anticip8_prefetch_total",
        "Prefetch requests started",
        &["service"]
    )
    .unwrap();

    pub static ref PREFETCH_ERRORS: CounterVec = register_counter_vec!(
        "anticip8_prefetch_errors_total",
        "Prefetch errors",
        &["service", "reason"]
    )
    .unwrap();

    pub static ref PREFETCH_LATENCY: HistogramVec = register_histogram_vec!(
        "anticip8_prefetch_latency_seconds",
        "Prefetch latency (seconds)",
        &["service"],
        vec![0.01, 0.025, 0.05, 0.09, 0.12, 0.22, 0.5, 1.0]
    )
    .unwrap();

    // Prefetch quality: HIT/MISS from intent + prefetched markers
    pub static ref PREFETCH_HITS: CounterVec = register_counter_vec!(
        "anticip8_prefetch_hits_total",
        "Prefetch hits (user later requested a prefetched path)",
        &["service"]
    )
    .unwrap();

    pub static ref PREFETCH_MISSES: CounterVec = register_counter_vec!(
        "anticip8_prefetch_misses_total",
        "Prefetch misses (intent was set but the mark never arrived)",
        &["service"]
    )
    .unwrap();

    pub static ref INTENT_SEEN: CounterVec = register_counter_vec!(
        "anticip8_intent_seen_total",
        "Real request observed an intent marker for this req_key",
        &["service"]
    )
    .unwrap();

    pub static ref INTENT_MISSING: CounterVec = register_counter_vec!(
        "anticip8_intent_missing_total",
        "Real request had no intent marker for this req_key",
        &["service"]
    )
    .unwrap();

    pub static ref PREFETCH_MARK_READY: CounterVec = register_counter_vec!(
        "anticip8_prefetch_mark_ready_total",
        "Real request observed prefetched mark present at arrival time",
        &["service"]
    )
    .unwrap();

    pub static ref PREFETCH_MARK_NOT_READY: CounterVec = register_counter_vec!(
        "anticip8_prefetch_mark_not_ready_total",
        "Real request had intent but prefetched mark was not ready yet",
        &["service"]
    )
    .unwrap();

    pub static ref RACE_GRACE_HITS: CounterVec = register_counter_vec!(
        "anticip8_race_grace_hits_total",
        "After small grace wait, prefetched mark appeared (race window)",
        &["service"]
    )
    .unwrap();

    pub static ref RACE_GRACE_MISSES: CounterVec = register_counter_vec!(
        "anticip8_race_grace_misses_total",
        "After grace wait, prefetched mark still missing (slow/failed prefetch)",
        &["service"]
    )
    .unwrap();

    pub static ref RACE_GRACE_WAIT: HistogramVec = register_histogram_vec!(
        "anticip8_race_grace_wait_seconds",
        "Grace wait duration for race recheck",
        &["service"],
        vec![0.001, 0.005, 0.01, 0.02, 0.05]
    )
    .unwrap();

    // Prefetch control plane
    pub static ref PREFETCH_BUDGET_OVERRUN: CounterVec = register_counter_vec!(
        "anticip8_prefetch_budget_overrun_total",
        "Prefetch batch stopped due to budget deadline",
        &["service"]
    )
    .unwrap();

    pub static ref PREFETCH_DEDUP_SKIPS: CounterVec = register_counter_vec!(
        "anticip8_prefetch_dedup_skips_total",
        "Prefetch skipped due to inflight dedup",
        &["service"]
    )
    .unwrap();

    pub static ref PREFETCH_DEADLINE_SKIPS: CounterVec = register_counter_vec!(
        "anticip8_prefetch_deadline_skips_total",
        "Prefetch skipped because deadline already passed",
        &["service"]
    )
    .unwrap();

    // Policy plane (sidecar side)
    pub static ref POLICY_REQUESTS: CounterVec = register_counter_vec!(
        "anticip8_policy_requests_total",
        "Requests to the policy engine next-path endpoint",
        &["service"]
    )
    .unwrap();

    pub static ref POLICY_ERRORS: CounterVec = register_counter_vec!(
        "anticip8_policy_errors_total",
        "Errors calling the policy engine next-path endpoint",
        &["service", "reason"]
    )
    .unwrap();

    pub static ref POLICY_LATENCY: HistogramVec = register_histogram_vec!(
        "anticip8_policy_latency_seconds",
        "Latency of policy engine calls",
        &["service"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25]
    )
    .unwrap();

    pub static ref BREAKER_TRIPS: CounterVec = register_counter_vec!(
        "anticip8_breaker_trips_total",
        "Circuit breaker transitions into cooloff",
        &["service"]
    )
    .unwrap();

    // Policy engine (core side)
    pub static ref INGEST_EVENTS: CounterVec = register_counter_vec!(
        "anticip8_ingest_events_total",
        "Transition ingests by kind and outcome",
        &["kind", "outcome"]
    )
    .unwrap();

    pub static ref POLICY_QUERIES: CounterVec = register_counter_vec!(
        "anticip8_policy_queries_total",
        "Next-path queries served by the policy engine",
        &["service"]
    )
    .unwrap();
}

/// Handler for GET /metrics on every surface that mounts it.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();

    ([("content-type", "text/plain; version=0.0.4")], buffer)
}
