/// Admin console summary endpoints
use crate::{
    analytics::{usage_heatmap, HeatmapCell},
    api::authorize,
    auth::{AdminAuthContext, RequestMeta},
    context::AppContext,
    error::{ModerationError, ModerationResult},
    moderation::{AbuseScore, Permission},
};
use axum::{
    extract::{Query, State},
    response::Json,
    routing::get,
    Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Build admin console routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/admin-console/overview", get(overview))
        .route("/admin-console/usage-heatmap", get(heatmap))
}

/// Open report counts per score
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenReportCounts {
    pub suspicious: i64,
    pub abusive: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverviewResponse {
    pub organization_id: String,
    pub open_reports: OpenReportCounts,
    pub active_flags: i64,
    pub audit_entries_last_24h: i64,
    pub events_last_24h: i64,
}

#[derive(Debug, Deserialize)]
pub struct HeatmapQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeatmapResponse {
    pub since: DateTime<Utc>,
    pub max_requests: u64,
    pub cells: Vec<HeatmapCell>,
}

/// GET /admin-console/overview
async fn overview(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
) -> ModerationResult<Json<OverviewResponse>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;

    let org = &auth.organization_id;
    let since = Utc::now() - Duration::hours(24);

    let mut open_reports = OpenReportCounts::default();
    for (score, count) in ctx.reports.open_counts_by_score(org).await? {
        match score {
            AbuseScore::Suspicious => open_reports.suspicious = count,
            AbuseScore::Abusive => open_reports.abusive = count,
            AbuseScore::Normal => {}
        }
    }

    Ok(Json(OverviewResponse {
        organization_id: org.clone(),
        open_reports,
        active_flags: ctx.flags.count_active(org).await?,
        audit_entries_last_24h: ctx.audit.count_since(org, since).await?,
        events_last_24h: ctx.events.count_since(org, since).await?,
    }))
}

/// GET /admin-console/usage-heatmap?days=7
async fn heatmap(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(query): Query<HeatmapQuery>,
) -> ModerationResult<Json<HeatmapResponse>> {
    authorize(&ctx, &auth, &meta, Permission::ViewReports).await?;

    let days = query.days.unwrap_or(7);
    if !(1..=90).contains(&days) {
        return Err(ModerationError::Validation("days must be between 1 and 90".to_string()));
    }

    let since = Utc::now() - Duration::days(days);
    let buckets = ctx.events.hourly_counts(&auth.organization_id, since).await?;
    let cells = usage_heatmap(buckets);
    let max_requests = cells.iter().map(|c| c.request_count).max().unwrap_or(0);

    Ok(Json(HeatmapResponse {
        since,
        max_requests,
        cells,
    }))
}
