use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static RUNS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static STEP_RETRIES_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static FALLBACKS_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static RUN_DURATION_SECONDS: OnceLock<Histogram> = OnceLock::new();

/// Registry gathered by the gateway's `/metrics` exposition.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn runs_total() -> &'static IntCounterVec {
    RUNS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new("fraudesk_triage_runs_total", "Triage runs by outcome."),
                &["outcome"],
            )
            .expect("create fraudesk_triage_runs_total"),
        )
    })
}

fn step_retries_total() -> &'static IntCounter {
    STEP_RETRIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "fraudesk_triage_step_retries_total",
                "Pipeline step retry attempts.",
            )
            .expect("create fraudesk_triage_step_retries_total"),
        )
    })
}

fn fallbacks_total() -> &'static IntCounter {
    FALLBACKS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "fraudesk_triage_fallbacks_total",
                "Pipeline steps substituted by their fallback result.",
            )
            .expect("create fraudesk_triage_fallbacks_total"),
        )
    })
}

fn run_duration_seconds() -> &'static Histogram {
    RUN_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            Histogram::with_opts(
                HistogramOpts::new(
                    "fraudesk_triage_run_duration_seconds",
                    "Wall time of a full triage run.",
                )
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            )
            .expect("create fraudesk_triage_run_duration_seconds"),
        )
    })
}

pub fn observe_run(outcome: &str, duration: Duration) {
    runs_total().with_label_values(&[outcome]).inc();
    run_duration_seconds().observe(duration.as_secs_f64());
}

pub fn inc_step_retry() {
    step_retries_total().inc();
}

pub fn inc_fallback() {
    fallbacks_total().inc();
}
