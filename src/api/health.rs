/// Liveness, readiness and component health for the moderation service
///
/// `/health/live` only proves the process answers. `/health/ready` gates
/// traffic on the SQLite pool. `/system/health` reports every component:
///
/// - `database`: pool round trip and occupancy
/// - `moderation_store`: applied schema migrations
/// - `background_jobs`: detection sweep settings and running jobs
use crate::{context::AppContext, db, jobs, metrics};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

/// Component or overall health state, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthState {
    /// Degraded still serves traffic
    pub fn status_code(&self) -> StatusCode {
        match self {
            HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
            HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthState,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ComponentHealth {
    fn healthy(name: &str, elapsed: Duration, details: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            status: HealthState::Healthy,
            response_time_ms: elapsed.as_millis() as u64,
            error: None,
            details: Some(details),
        }
    }

    fn failed(name: &str, status: HealthState, elapsed: Duration, error: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            status,
            response_time_ms: elapsed.as_millis() as u64,
            error: Some(error.to_string()),
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemHealth {
    pub status: HealthState,
    pub version: String,
    pub uptime_seconds: f64,
    pub components: Vec<ComponentHealth>,
}

/// Build health and metrics routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/health", get(liveness))
        .route("/health/live", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/system/health", get(system_health))
        .route("/metrics", get(prometheus_metrics))
}

/// GET /health, /health/live
async fn liveness() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// GET /health/ready
async fn readiness(State(ctx): State<AppContext>) -> (StatusCode, Json<serde_json::Value>) {
    match db::test_connection(&ctx.db).await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "ready" }))),
        Err(e) => {
            tracing::warn!(error = %e, "readiness check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "error": "database unreachable" })),
            )
        }
    }
}

/// GET /system/health
async fn system_health(State(ctx): State<AppContext>) -> (StatusCode, Json<SystemHealth>) {
    let components = vec![
        check_database(&ctx).await,
        check_moderation_store(&ctx).await,
        check_background_jobs(&ctx).await,
    ];
    let status = overall_state(&components);

    let uptime = ctx.started_at.elapsed().as_secs_f64();
    metrics::UPTIME_SECONDS.set(uptime);

    if status != HealthState::Healthy {
        tracing::warn!(status = ?status, "system health check reported problems");
    }

    let body = SystemHealth {
        status,
        version: ctx.config.service.version.clone(),
        uptime_seconds: uptime,
        components,
    };
    (status.status_code(), Json(body))
}

/// GET /metrics
async fn prometheus_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}

async fn check_database(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    match db::test_connection(&ctx.db).await {
        Ok(()) => ComponentHealth::healthy(
            "database",
            start.elapsed(),
            json!({
                "poolSize": ctx.db.size(),
                "idle": ctx.db.num_idle(),
            }),
        ),
        Err(e) => ComponentHealth::failed("database", HealthState::Unhealthy, start.elapsed(), e),
    }
}

async fn check_moderation_store(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    let applied: Result<i64, sqlx::Error> =
        sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success = 1")
            .fetch_one(&ctx.db)
            .await;

    match applied {
        Ok(0) => ComponentHealth::failed(
            "moderation_store",
            HealthState::Unhealthy,
            start.elapsed(),
            "no schema migrations applied",
        ),
        Ok(count) => ComponentHealth::healthy("moderation_store", start.elapsed(), json!({ "migrations": count })),
        Err(e) => ComponentHealth::failed("moderation_store", HealthState::Unhealthy, start.elapsed(), e),
    }
}

async fn check_background_jobs(ctx: &AppContext) -> ComponentHealth {
    let start = Instant::now();
    match jobs::tasks::health_check(ctx).await {
        Ok(()) => ComponentHealth::healthy(
            "background_jobs",
            start.elapsed(),
            json!({
                "detectionEnabled": ctx.config.detection.enabled,
                "detectionIntervalSecs": ctx.config.detection.interval_secs,
                "running": metrics::BACKGROUND_JOBS_ACTIVE.get(),
            }),
        ),
        // Failing jobs do not stop the admin API
        Err(e) => ComponentHealth::failed("background_jobs", HealthState::Degraded, start.elapsed(), e),
    }
}

/// Worst state among the components
fn overall_state(components: &[ComponentHealth]) -> HealthState {
    components
        .iter()
        .map(|c| c.status)
        .max()
        .unwrap_or(HealthState::Healthy)
}
