use lazy_static::lazy_static;
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref READINGS_STORED_TOTAL: Counter = Counter::with_opts(Opts::new(
        "vitals_readings_stored_total",
        "Total vital-sign readings persisted"
    ))
    .unwrap();
    pub static ref REPLAYS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "vitals_replays_total",
        "Total ingestion requests answered from a stored idempotency record"
    ))
    .unwrap();
    pub static ref CONFLICTS_TOTAL: Counter = Counter::with_opts(Opts::new(
        "vitals_conflicts_total",
        "Total idempotency key reuses with a different payload"
    ))
    .unwrap();
    pub static ref VALIDATION_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "vitals_validation_failures_total",
        "Total ingestion payloads rejected by validation"
    ))
    .unwrap();
    pub static ref AUTH_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "vitals_auth_failures_total",
        "Total requests rejected for a bad or missing API key"
    ))
    .unwrap();
    pub static ref DB_FAILURES_TOTAL: Counter = Counter::with_opts(Opts::new(
        "vitals_db_failures_total",
        "Total storage operation failures"
    ))
    .unwrap();
    pub static ref INGEST_LATENCY_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "vitals_ingest_latency_seconds",
            "Time taken to resolve and persist one ingestion request"
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0
        ])
    )
    .unwrap();
}

pub fn init_metrics() {
    REGISTRY
        .register(Box::new(READINGS_STORED_TOTAL.clone()))
        .unwrap();
    REGISTRY.register(Box::new(REPLAYS_TOTAL.clone())).unwrap();
    REGISTRY
        .register(Box::new(CONFLICTS_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(VALIDATION_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(AUTH_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(DB_FAILURES_TOTAL.clone()))
        .unwrap();
    REGISTRY
        .register(Box::new(INGEST_LATENCY_SECONDS.clone()))
        .unwrap();
}

pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}
