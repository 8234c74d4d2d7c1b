/// Prometheus metrics for the moderation service
///
/// Every metric lives under the `pravado_moderation` namespace and is
/// registered in the default registry on first use.
///
/// - HTTP traffic per route template
/// - Database pool occupancy
/// - Background job runs
/// - Moderation actions, abuse reports, detection sweeps and event intake
/// - Audit trail writes

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    TextEncoder,
};

pub const NAMESPACE: &str = "pravado_moderation";

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];
const JOB_BUCKETS: &[f64] = &[0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0];

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn histogram(name: &str, help: &str, buckets: &[f64]) -> HistogramOpts {
    HistogramOpts::new(name, help)
        .namespace(NAMESPACE)
        .buckets(buckets.to_vec())
}

lazy_static! {
    // ========== HTTP ==========

    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("http_requests_total", "Admin API requests by route and status"),
        &["method", "route", "status"]
    )
    .unwrap();

    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        histogram("http_request_duration_seconds", "Admin API latency by route", LATENCY_BUCKETS),
        &["method", "route"]
    )
    .unwrap();

    pub static ref HTTP_REQUESTS_ACTIVE: IntGauge = register_int_gauge!(
        opts("http_requests_in_flight", "Admin API requests being handled")
    )
    .unwrap();

    // ========== Storage ==========

    pub static ref DB_CONNECTIONS_POOL_SIZE: IntGauge = register_int_gauge!(
        opts("db_pool_connections", "Connections held by the SQLite pool")
    )
    .unwrap();

    pub static ref DB_CONNECTIONS_IDLE: IntGauge = register_int_gauge!(
        opts("db_pool_idle_connections", "Idle connections in the SQLite pool")
    )
    .unwrap();

    // ========== Background jobs ==========

    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("job_runs_total", "Background job runs by job and outcome"),
        &["job", "outcome"]
    )
    .unwrap();

    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        histogram("job_duration_seconds", "Background job run time", JOB_BUCKETS),
        &["job"]
    )
    .unwrap();

    pub static ref BACKGROUND_JOBS_ACTIVE: IntGauge = register_int_gauge!(
        opts("jobs_running", "Background jobs currently running")
    )
    .unwrap();

    // ========== Moderation ==========

    /// Flags, bans, resolutions and expiries by action and target kind
    pub static ref MODERATION_ACTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("actions_total", "Moderation actions by action and target"),
        &["action", "target"]
    )
    .unwrap();

    pub static ref REPORTS_CREATED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("abuse_reports_created_total", "Abuse reports raised by score"),
        &["abuse_score"]
    )
    .unwrap();

    pub static ref REPORTS_RESOLVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("abuse_reports_resolved_total", "Abuse reports closed by score"),
        &["abuse_score"]
    )
    .unwrap();

    pub static ref DETECTION_RUNS_TOTAL: IntCounter = register_int_counter!(
        opts("detection_runs_total", "Per-organization detection runs")
    )
    .unwrap();

    pub static ref AUTO_FLAGS_TOTAL: IntCounter = register_int_counter!(
        opts("detection_auto_flags_total", "Restrictions applied by detection")
    )
    .unwrap();

    pub static ref ABUSE_EVENTS_INGESTED_TOTAL: IntCounter = register_int_counter!(
        opts("abuse_events_ingested_total", "Abuse signals accepted from the platform")
    )
    .unwrap();

    // ========== Audit ==========

    pub static ref AUDIT_ENTRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("audit_entries_total", "Audit entries written by action and outcome"),
        &["action", "success"]
    )
    .unwrap();

    // ========== Process ==========

    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        opts("errors_total", "Internal errors by code and source"),
        &["code", "source"]
    )
    .unwrap();

    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        opts("uptime_seconds", "Seconds since the service started")
    )
    .unwrap();
}

/// Render the default registry in Prometheus text format
pub fn render_metrics() -> String {
    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Count an admin API request against its route template
pub fn record_http_request(method: &str, route: &str, status: u16, seconds: f64) {
    let status = status.to_string();
    HTTP_REQUESTS_TOTAL.with_label_values(&[method, route, &status]).inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, route])
        .observe(seconds);
}

pub fn record_pool_state(size: u32, idle: usize) {
    DB_CONNECTIONS_POOL_SIZE.set(i64::from(size));
    DB_CONNECTIONS_IDLE.set(i64::try_from(idle).unwrap_or(i64::MAX));
}

pub fn record_background_job(job: &str, outcome: &str, seconds: f64) {
    BACKGROUND_JOBS_TOTAL.with_label_values(&[job, outcome]).inc();
    BACKGROUND_JOB_DURATION_SECONDS.with_label_values(&[job]).observe(seconds);
}

pub fn record_moderation_action(action: &str, target: &str) {
    MODERATION_ACTIONS_TOTAL.with_label_values(&[action, target]).inc();
}

pub fn record_report_created(abuse_score: &str) {
    REPORTS_CREATED_TOTAL.with_label_values(&[abuse_score]).inc();
}

pub fn record_report_resolved(abuse_score: &str) {
    REPORTS_RESOLVED_TOTAL.with_label_values(&[abuse_score]).inc();
}

/// Count one organization's detection run and the flags it applied
pub fn record_detection_run(reports_created: u64, flags_created: u64) {
    DETECTION_RUNS_TOTAL.inc();
    AUTO_FLAGS_TOTAL.inc_by(flags_created);
    tracing::debug!(
        reports = reports_created,
        flags = flags_created,
        "detection run recorded"
    );
}

pub fn record_events_ingested(count: u64) {
    ABUSE_EVENTS_INGESTED_TOTAL.inc_by(count);
}

pub fn record_audit_entry(action: &str, success: bool) {
    let success = if success { "true" } else { "false" };
    AUDIT_ENTRIES_TOTAL.with_label_values(&[action, success]).inc();
}

pub fn record_error(code: &str, source: &str) {
    ERRORS_TOTAL.with_label_values(&[code, source]).inc();
}
