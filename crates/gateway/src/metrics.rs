use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static ACTIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static RATE_LIMITED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static RATE_LIMITER_FAIL_OPEN_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static IDEMPOTENT_REPLAYS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static REDACTED_BODIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "fraudesk_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create fraudesk_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "fraudesk_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create fraudesk_gateway_http_request_duration_seconds"),
        )
    })
}

fn actions_total() -> &'static IntCounterVec {
    ACTIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "fraudesk_gateway_actions_total",
                    "Operator actions by kind and outcome.",
                ),
                &["action", "outcome"],
            )
            .expect("create fraudesk_gateway_actions_total"),
        )
    })
}

fn rate_limited_total() -> &'static IntCounter {
    RATE_LIMITED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "fraudesk_gateway_rate_limited_total",
                "Requests rejected by the sliding-window limiter.",
            )
            .expect("create fraudesk_gateway_rate_limited_total"),
        )
    })
}

fn rate_limiter_fail_open_total() -> &'static IntCounter {
    RATE_LIMITER_FAIL_OPEN_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "fraudesk_gateway_rate_limiter_fail_open_total",
                "Requests admitted because the limiter's window store failed.",
            )
            .expect("create fraudesk_gateway_rate_limiter_fail_open_total"),
        )
    })
}

fn idempotent_replays_total() -> &'static IntCounter {
    IDEMPOTENT_REPLAYS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "fraudesk_gateway_idempotent_replays_total",
                "Responses served from the idempotency cache.",
            )
            .expect("create fraudesk_gateway_idempotent_replays_total"),
        )
    })
}

fn redacted_bodies_total() -> &'static IntCounterVec {
    REDACTED_BODIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "fraudesk_gateway_redacted_bodies_total",
                    "HTTP bodies in which PII was masked.",
                ),
                &["direction"],
            )
            .expect("create fraudesk_gateway_redacted_bodies_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_action(action: &str, outcome: &str) {
    actions_total().with_label_values(&[action, outcome]).inc();
}

pub fn inc_rate_limited() {
    rate_limited_total().inc();
}

pub fn inc_rate_limiter_fail_open() {
    rate_limiter_fail_open_total().inc();
}

pub fn inc_idempotent_replay() {
    idempotent_replays_total().inc();
}

pub fn inc_redacted_body(direction: &str) {
    redacted_bodies_total()
        .with_label_values(&[direction])
        .inc();
}

/// Text exposition of the gateway registry plus the triage registry.
pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = rate_limiter_fail_open_total();
    let _ = rate_limited_total();
    let _ = idempotent_replays_total();

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();

    let metric_families = registry().gather();
    encoder.encode(&metric_families, &mut buffer)?;

    let triage_families = fraudesk_triage::metrics::registry().gather();
    encoder.encode(&triage_families, &mut buffer)?;

    Ok((buffer, encoder.format_type().to_string()))
}
