use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, Opts, Registry, TextEncoder};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref WORKFLOWS_STARTED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "onboard_workflows_started_total",
        "Total number of workflow instances created."
    ))
    .unwrap();
    pub static ref WORKFLOWS_COMPLETED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "onboard_workflows_completed_total",
        "Total number of workflow instances completed."
    ))
    .unwrap();
    pub static ref WORKFLOWS_CANCELLED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "onboard_workflows_cancelled_total",
        "Total number of workflow instances cancelled."
    ))
    .unwrap();
    pub static ref STEPS_COMPLETED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "onboard_steps_completed_total",
        "Total number of workflow steps completed."
    ))
    .unwrap();
    pub static ref INTEGRATION_RETRIES_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "onboard_integration_retries_total",
        "Total number of integration call retries."
    ))
    .unwrap();
    pub static ref EXCEPTIONS_RAISED_TOTAL: IntCounter = IntCounter::with_opts(Opts::new(
        "onboard_exceptions_raised_total",
        "Total number of workflow exceptions raised."
    ))
    .unwrap();
}

pub fn register_metrics() {
    for metric in [
        &*WORKFLOWS_STARTED_TOTAL,
        &*WORKFLOWS_COMPLETED_TOTAL,
        &*WORKFLOWS_CANCELLED_TOTAL,
        &*STEPS_COMPLETED_TOTAL,
        &*INTEGRATION_RETRIES_TOTAL,
        &*EXCEPTIONS_RAISED_TOTAL,
    ] {
        // Re-registration only happens in tests that rebuild the server.
        let _ = REGISTRY.register(Box::new(metric.clone()));
    }
}

pub fn gather_metrics() -> String {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .expect("Failed to encode metrics");
    String::from_utf8(buffer).expect("Failed to convert metrics to string")
}
