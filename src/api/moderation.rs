/// Moderation endpoints: abuse reports, flags, token bans, events and detection
use crate::{
    api::{audit_actor, audit_entry, authorize},
    auth::{AdminAuthContext, RequestMeta},
    context::AppContext,
    error::{ModerationError, ModerationResult},
    moderation::{
        assess, AbuseAssessment, AbuseDetectionConfig, AbuseDetectionMetrics, AbuseEvent, AbuseReport,
        AbuseReportFilter, AbuseReportPage, AbuseSubject, AuditActionType, BanTokenRequest, BanTokenResponse,
        DetectionSummary, FlagClientRequest, FlagClientResponse, FlagFilter, FlagPage, ModerationFlag, Permission,
        RestrictionStatus, StoredDetectionConfig,
    },
};
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Largest event batch accepted in one request
pub const MAX_EVENT_BATCH: usize = 1000;

/// Build moderation routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/moderation/abuse-reports", get(list_abuse_reports))
        .route("/moderation/abuse-reports/:id", get(get_abuse_report))
        .route("/moderation/abuse-reports/:id/resolve", post(resolve_abuse_report))
        .route("/moderation/abuse-reports/:id/notes", put(update_report_notes))
        .route("/moderation/flag-client", post(flag_client))
        .route("/moderation/flags", get(list_flags))
        .route("/moderation/flags/:id", get(get_flag))
        .route("/moderation/flags/:id/resolve", post(resolve_flag))
        .route("/moderation/ban-token", post(ban_token))
        .route("/moderation/check", get(check_restriction))
        .route("/moderation/metrics", get(subject_metrics))
        .route("/moderation/events", post(ingest_events))
        .route("/moderation/detect", post(run_detection))
        .route("/moderation/config", get(get_config).put(update_config))
}

/// Resolution body for reports and flags
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub notes: Option<String>,
}

/// Notes replacement body
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesRequest {
    pub notes: String,
}

/// Event ingestion body
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEventsRequest {
    pub events: Vec<AbuseEvent>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEventsResponse {
    pub accepted: u64,
}

/// Subject plus an optional window override
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub token_id: Option<String>,
    pub window_minutes: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMetricsResponse {
    pub metrics: AbuseDetectionMetrics,
    pub assessment: AbuseAssessment,
}

/// GET /moderation/abuse-reports
async fn list_abuse_reports(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(filter): Query<AbuseReportFilter>,
) -> ModerationResult<Json<AbuseReportPage>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;
    let page = ctx.reports.list_reports(&auth.organization_id, &filter).await?;
    Ok(Json(page))
}

/// GET /moderation/abuse-reports/:id
async fn get_abuse_report(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> ModerationResult<Json<AbuseReport>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;
    let report = ctx.reports.get_report(&auth.organization_id, &id).await?;
    Ok(Json(report))
}

/// POST /moderation/abuse-reports/:id/resolve
async fn resolve_abuse_report(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> ModerationResult<Json<AbuseReport>> {
    authorize(&ctx, &auth, &meta, Permission::ResolveReports).await?;

    let notes = req.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let report = ctx
        .reports
        .resolve_report(&audit_actor(&auth, &meta), &id, notes)
        .await?;

    tracing::info!("Abuse report {} resolved by {}", report.id, auth.user_id);
    Ok(Json(report))
}

/// PUT /moderation/abuse-reports/:id/notes
async fn update_report_notes(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(req): Json<NotesRequest>,
) -> ModerationResult<Json<AbuseReport>> {
    authorize(&ctx, &auth, &meta, Permission::ResolveReports).await?;

    if req.notes.chars().count() > 2000 {
        return Err(ModerationError::Validation(
            "notes must be at most 2000 characters".to_string(),
        ));
    }

    let report = ctx
        .reports
        .update_notes(&audit_actor(&auth, &meta), &id, &req.notes)
        .await?;
    Ok(Json(report))
}

/// POST /moderation/flag-client
async fn flag_client(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Json(req): Json<FlagClientRequest>,
) -> ModerationResult<Json<FlagClientResponse>> {
    authorize(&ctx, &auth, &meta, Permission::FlagClients).await?;

    let flag = match ctx.flags.flag_client(&audit_actor(&auth, &meta), &req).await {
        Ok(flag) => flag,
        Err(e) => {
            if matches!(e, ModerationError::Validation(_)) {
                ctx.audit
                    .record_best_effort(
                        audit_entry(&auth, &meta, AuditActionType::ClientFlagged).failed(e.to_string()),
                    )
                    .await;
            }
            return Err(e);
        }
    };

    tracing::info!(
        "Flag {} ({}) created by {} in {}",
        flag.id,
        flag.flag_type.as_str(),
        auth.user_id,
        auth.organization_id
    );

    Ok(Json(FlagClientResponse { flag_id: flag.id }))
}

/// GET /moderation/flags
async fn list_flags(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(filter): Query<FlagFilter>,
) -> ModerationResult<Json<FlagPage>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;
    let page = ctx.flags.list_flags(&auth.organization_id, &filter).await?;
    Ok(Json(page))
}

/// GET /moderation/flags/:id
async fn get_flag(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Path(id): Path<String>,
) -> ModerationResult<Json<ModerationFlag>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;
    let flag = ctx.flags.get_flag(&auth.organization_id, &id).await?;
    Ok(Json(flag))
}

/// POST /moderation/flags/:id/resolve
async fn resolve_flag(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> ModerationResult<Json<ModerationFlag>> {
    authorize(&ctx, &auth, &meta, Permission::FlagClients).await?;

    let notes = req.notes.as_deref().map(str::trim).filter(|n| !n.is_empty());
    let flag = ctx
        .flags
        .resolve_flag(&audit_actor(&auth, &meta), &id, notes)
        .await?;
    Ok(Json(flag))
}

/// POST /moderation/ban-token
async fn ban_token(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Json(req): Json<BanTokenRequest>,
) -> ModerationResult<Json<BanTokenResponse>> {
    authorize(&ctx, &auth, &meta, Permission::BanTokens).await?;

    let response = ctx.flags.ban_token(&audit_actor(&auth, &meta), &req).await?;

    tracing::warn!("Token {} banned by {}", response.token_id, auth.user_id);
    Ok(Json(response))
}

/// GET /moderation/check
async fn check_restriction(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(subject): Query<AbuseSubject>,
) -> ModerationResult<Json<RestrictionStatus>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;
    let status = ctx.flags.check_restriction(&auth.organization_id, &subject).await?;
    Ok(Json(status))
}

/// GET /moderation/metrics
async fn subject_metrics(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(query): Query<MetricsQuery>,
) -> ModerationResult<Json<SubjectMetricsResponse>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;

    let config = ctx.detection_config.get(&auth.organization_id).await?.config;
    let window_minutes = query.window_minutes.unwrap_or(config.time_window_minutes);
    if !(1..=1440).contains(&window_minutes) {
        return Err(ModerationError::Validation(
            "windowMinutes must be between 1 and 1440".to_string(),
        ));
    }

    let subject = AbuseSubject {
        client_id: query.client_id,
        ip_address: query.ip_address,
        token_id: query.token_id,
    };
    let metrics = ctx
        .events
        .compute_metrics(&auth.organization_id, &subject, window_minutes, Utc::now())
        .await?;
    let assessment = assess(&metrics, &config);

    Ok(Json(SubjectMetricsResponse { metrics, assessment }))
}

/// POST /moderation/events
async fn ingest_events(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Json(req): Json<IngestEventsRequest>,
) -> ModerationResult<Json<IngestEventsResponse>> {
    authorize(&ctx, &auth, &meta, Permission::IngestEvents).await?;

    if req.events.is_empty() {
        return Err(ModerationError::Validation("events must not be empty".to_string()));
    }
    if req.events.len() > MAX_EVENT_BATCH {
        return Err(ModerationError::Validation(format!(
            "At most {} events per request",
            MAX_EVENT_BATCH
        )));
    }

    let accepted = ctx.events.record_batch(&audit_actor(&auth, &meta), req.events).await?;

    Ok(Json(IngestEventsResponse { accepted }))
}

/// POST /moderation/detect
async fn run_detection(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
) -> ModerationResult<Json<DetectionSummary>> {
    authorize(&ctx, &auth, &meta, Permission::EditConfig).await?;
    let summary = ctx
        .detector
        .run_for_organization(&auth.organization_id, Utc::now(), &auth.user_id)
        .await?;
    Ok(Json(summary))
}

/// GET /moderation/config
async fn get_config(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
) -> ModerationResult<Json<StoredDetectionConfig>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;
    let config = ctx.detection_config.get(&auth.organization_id).await?;
    Ok(Json(config))
}

/// PUT /moderation/config
async fn update_config(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Json(config): Json<AbuseDetectionConfig>,
) -> ModerationResult<Json<StoredDetectionConfig>> {
    authorize(&ctx, &auth, &meta, Permission::EditConfig).await?;

    let stored = ctx
        .detection_config
        .update(&audit_actor(&auth, &meta), config)
        .await?;
    Ok(Json(stored))
}
