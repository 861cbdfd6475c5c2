use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PII_DISCLOSURES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SCOPE_DENIALS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static SYNC_ROWS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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
                Opts::new("amani_api_http_requests_total", "API HTTP request count."),
                &["route", "method", "status"],
            )
            .expect("create amani_api_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "amani_api_http_request_duration_seconds",
                    "API HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create amani_api_http_request_duration_seconds"),
        )
    })
}

fn pii_disclosures_total() -> &'static IntCounterVec {
    PII_DISCLOSURES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "amani_api_pii_disclosures_total",
                    "Responses that carried decrypted PII.",
                ),
                &["route"],
            )
            .expect("create amani_api_pii_disclosures_total"),
        )
    })
}

fn scope_denials_total() -> &'static IntCounterVec {
    SCOPE_DENIALS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "amani_api_scope_denials_total",
                    "Requests refused because the target fell outside the caller's scope.",
                ),
                &["route"],
            )
            .expect("create amani_api_scope_denials_total"),
        )
    })
}

fn sync_rows_total() -> &'static IntCounterVec {
    SYNC_ROWS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "amani_api_sync_rows_total",
                    "Rows handed to offline clients by sync pulls.",
                ),
                &["collection"],
            )
            .expect("create amani_api_sync_rows_total"),
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

pub fn observe_pii_disclosure(route: &str) {
    pii_disclosures_total().with_label_values(&[route]).inc();
}

pub fn observe_scope_denial(route: &str) {
    scope_denials_total().with_label_values(&[route]).inc();
}

pub fn observe_sync_rows(collection: &str, rows: usize) {
    sync_rows_total()
        .with_label_values(&[collection])
        .inc_by(rows as u64);
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = pii_disclosures_total();
    let _ = scope_denials_total();
    let _ = sync_rows_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
