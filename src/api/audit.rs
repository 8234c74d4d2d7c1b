/// Audit log listing and export endpoints
use crate::{
    api::{audit_entry, authorize},
    auth::{AdminAuthContext, RequestMeta},
    context::AppContext,
    error::ModerationResult,
    moderation::{audit::entries_to_csv, AuditActionType, AuditLogFilter, AuditLogPage, ExportFormat, Permission},
};
use axum::{
    extract::{Query, State},
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;

/// Build audit log routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/moderation/audit-logs", get(list_audit_logs))
        .route("/moderation/audit-logs/export", get(export_audit_logs))
}

/// Export encoding selector, read alongside the list filters
#[derive(Debug, Deserialize)]
pub struct ExportQuery {
    pub format: Option<ExportFormat>,
}

/// GET /moderation/audit-logs
async fn list_audit_logs(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(filter): Query<AuditLogFilter>,
) -> ModerationResult<Json<AuditLogPage>> {
    authorize(&ctx, &auth, &meta, Permission::ViewAuditLogs).await?;
    let page = ctx.audit.list(&auth.organization_id, &filter).await?;
    Ok(Json(page))
}

/// GET /moderation/audit-logs/export?format=csv|json
async fn export_audit_logs(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Query(export): Query<ExportQuery>,
    Query(filter): Query<AuditLogFilter>,
) -> ModerationResult<Response> {
    authorize(&ctx, &auth, &meta, Permission::ExportAuditLogs).await?;

    let format = export.format.unwrap_or(ExportFormat::Json);
    let entries = ctx
        .audit
        .export_entries(&auth.organization_id, &filter, ctx.config.audit.export_max_rows)
        .await?;

    // Record the export only after the rows are read so it never exports itself
    ctx.audit
        .record(
            audit_entry(&auth, &meta, AuditActionType::AuditLogExported).details(serde_json::json!({
                "format": format,
                "rows": entries.len(),
                "filter": filter,
            })),
        )
        .await?;

    tracing::info!(
        "User {} exported {} audit entries from {}",
        auth.user_id,
        entries.len(),
        auth.organization_id
    );

    let response = match format {
        ExportFormat::Csv => (
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"audit-logs.csv\""),
            ],
            entries_to_csv(&entries),
        )
            .into_response(),
        ExportFormat::Json => Json(entries).into_response(),
    };
    Ok(response)
}
