/// Append-only audit trail of sensitive platform actions
use crate::{
    db::{page_bounds, parse_db_timestamp, to_db_timestamp},
    error::{ModerationError, ModerationResult},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Closed set of auditable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActionType {
    // Moderation
    ClientFlagged,
    FlagResolved,
    FlagExpired,
    TokenBanned,
    AbuseReportCreated,
    AbuseReportResolved,
    AbuseReportNotesUpdated,
    DetectionRun,
    AbuseEventsIngested,
    DetectionConfigUpdated,
    // Audit
    AuditLogViewed,
    AuditLogExported,
    // Access
    RoleGranted,
    RoleRevoked,
    AdminLogin,
    AdminLogout,
    PermissionDenied,
    // Platform
    ApiKeyCreated,
    ApiKeyRevoked,
    ApiKeyRotated,
    OrganizationCreated,
    OrganizationUpdated,
    OrganizationDeleted,
    UserInvited,
    UserRemoved,
    WebhookRegistered,
    WebhookDeleted,
    BillingPlanChanged,
    DataExported,
    SettingsChanged,
}

impl AuditActionType {
    pub const ALL: [AuditActionType; 30] = [
        AuditActionType::ClientFlagged,
        AuditActionType::FlagResolved,
        AuditActionType::FlagExpired,
        AuditActionType::TokenBanned,
        AuditActionType::AbuseReportCreated,
        AuditActionType::AbuseReportResolved,
        AuditActionType::AbuseReportNotesUpdated,
        AuditActionType::DetectionRun,
        AuditActionType::AbuseEventsIngested,
        AuditActionType::DetectionConfigUpdated,
        AuditActionType::AuditLogViewed,
        AuditActionType::AuditLogExported,
        AuditActionType::RoleGranted,
        AuditActionType::RoleRevoked,
        AuditActionType::AdminLogin,
        AuditActionType::AdminLogout,
        AuditActionType::PermissionDenied,
        AuditActionType::ApiKeyCreated,
        AuditActionType::ApiKeyRevoked,
        AuditActionType::ApiKeyRotated,
        AuditActionType::OrganizationCreated,
        AuditActionType::OrganizationUpdated,
        AuditActionType::OrganizationDeleted,
        AuditActionType::UserInvited,
        AuditActionType::UserRemoved,
        AuditActionType::WebhookRegistered,
        AuditActionType::WebhookDeleted,
        AuditActionType::BillingPlanChanged,
        AuditActionType::DataExported,
        AuditActionType::SettingsChanged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActionType::ClientFlagged => "client_flagged",
            AuditActionType::FlagResolved => "flag_resolved",
            AuditActionType::FlagExpired => "flag_expired",
            AuditActionType::TokenBanned => "token_banned",
            AuditActionType::AbuseReportCreated => "abuse_report_created",
            AuditActionType::AbuseReportResolved => "abuse_report_resolved",
            AuditActionType::AbuseReportNotesUpdated => "abuse_report_notes_updated",
            AuditActionType::DetectionRun => "detection_run",
            AuditActionType::AbuseEventsIngested => "abuse_events_ingested",
            AuditActionType::DetectionConfigUpdated => "detection_config_updated",
            AuditActionType::AuditLogViewed => "audit_log_viewed",
            AuditActionType::AuditLogExported => "audit_log_exported",
            AuditActionType::RoleGranted => "role_granted",
            AuditActionType::RoleRevoked => "role_revoked",
            AuditActionType::AdminLogin => "admin_login",
            AuditActionType::AdminLogout => "admin_logout",
            AuditActionType::PermissionDenied => "permission_denied",
            AuditActionType::ApiKeyCreated => "api_key_created",
            AuditActionType::ApiKeyRevoked => "api_key_revoked",
            AuditActionType::ApiKeyRotated => "api_key_rotated",
            AuditActionType::OrganizationCreated => "organization_created",
            AuditActionType::OrganizationUpdated => "organization_updated",
            AuditActionType::OrganizationDeleted => "organization_deleted",
            AuditActionType::UserInvited => "user_invited",
            AuditActionType::UserRemoved => "user_removed",
            AuditActionType::WebhookRegistered => "webhook_registered",
            AuditActionType::WebhookDeleted => "webhook_deleted",
            AuditActionType::BillingPlanChanged => "billing_plan_changed",
            AuditActionType::DataExported => "data_exported",
            AuditActionType::SettingsChanged => "settings_changed",
        }
    }

    pub fn from_str(s: &str) -> ModerationResult<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| ModerationError::Validation(format!("Invalid audit action type: {}", s)))
    }
}

/// Immutable audit log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub id: String,
    pub organization_id: String,
    pub action_type: AuditActionType,
    pub actor_id: String,
    pub actor_email: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Data for a new audit record
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub organization_id: String,
    pub action_type: AuditActionType,
    pub actor_id: String,
    pub actor_email: Option<String>,
    pub target_type: Option<String>,
    pub target_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl NewAuditEntry {
    pub fn new(organization_id: &str, action_type: AuditActionType, actor_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            action_type,
            actor_id: actor_id.to_string(),
            actor_email: None,
            target_type: None,
            target_id: None,
            details: None,
            ip_address: None,
            user_agent: None,
            success: true,
            error_message: None,
        }
    }

    pub fn target(mut self, target_type: &str, target_id: impl Into<String>) -> Self {
        self.target_type = Some(target_type.to_string());
        self.target_id = Some(target_id.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.success = false;
        self.error_message = Some(error_message.into());
        self
    }
}

/// Caller an audited change is attributed to
#[derive(Debug, Clone)]
pub struct AuditActor {
    pub organization_id: String,
    pub actor_id: String,
    pub actor_email: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl AuditActor {
    pub fn new(organization_id: &str, actor_id: &str) -> Self {
        Self {
            organization_id: organization_id.to_string(),
            actor_id: actor_id.to_string(),
            actor_email: None,
            ip_address: None,
            user_agent: None,
        }
    }

    /// Entry for an action taken by this actor
    pub fn entry(&self, action_type: AuditActionType) -> NewAuditEntry {
        let mut entry = NewAuditEntry::new(&self.organization_id, action_type, &self.actor_id);
        entry.actor_email = self.actor_email.clone();
        entry.ip_address = self.ip_address.clone();
        entry.user_agent = self.user_agent.clone();
        entry
    }
}

/// Audit log query filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogFilter {
    pub action_type: Option<AuditActionType>,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub success: Option<bool>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// Page of audit log entries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogPage {
    pub logs: Vec<AuditLogEntry>,
    pub total: i64,
}

/// Export encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

const CSV_HEADER: [&str; 13] = [
    "id",
    "organizationId",
    "actionType",
    "actorId",
    "actorEmail",
    "targetType",
    "targetId",
    "details",
    "ipAddress",
    "userAgent",
    "success",
    "errorMessage",
    "createdAt",
];

/// Audit log manager
#[derive(Clone)]
pub struct AuditLogManager {
    db: SqlitePool,
}

impl AuditLogManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Append an entry to the audit trail
    pub async fn record(&self, entry: NewAuditEntry) -> ModerationResult<AuditLogEntry> {
        let mut conn = self.db.acquire().await?;
        insert_entry(&mut conn, entry).await
    }

    /// Append an entry, logging instead of failing the caller
    pub async fn record_best_effort(&self, entry: NewAuditEntry) {
        let action = entry.action_type;
        if let Err(e) = self.record(entry).await {
            tracing::warn!("Failed to write audit entry {}: {}", action.as_str(), e);
        }
    }

    /// List entries of an organization, newest first
    pub async fn list(
        &self,
        organization_id: &str,
        filter: &AuditLogFilter,
    ) -> ModerationResult<AuditLogPage> {
        let (limit, offset) = page_bounds(filter.page, filter.page_size);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM audit_logs");
        push_filters(&mut count, organization_id, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.db).await?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut select, organization_id, filter);
        select.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        select.push_bind(limit);
        select.push(" OFFSET ");
        select.push_bind(offset);

        let rows = select.build().fetch_all(&self.db).await?;
        let logs = rows.into_iter().map(parse_entry).collect::<ModerationResult<Vec<_>>>()?;

        Ok(AuditLogPage { logs, total })
    }

    /// Fetch up to `max_rows` matching entries for export, newest first
    pub async fn export_entries(
        &self,
        organization_id: &str,
        filter: &AuditLogFilter,
        max_rows: i64,
    ) -> ModerationResult<Vec<AuditLogEntry>> {
        let mut select = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut select, organization_id, filter);
        select.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        select.push_bind(max_rows.max(1));

        let rows = select.build().fetch_all(&self.db).await?;
        rows.into_iter().map(parse_entry).collect()
    }

    /// Count entries of an organization created at or after `since`
    pub async fn count_since(&self, organization_id: &str, since: DateTime<Utc>) -> ModerationResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_logs WHERE organization_id = ? AND created_at >= ?",
        )
        .bind(organization_id)
        .bind(to_db_timestamp(since))
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }
}

/// Append an entry on an open connection
///
/// Mutations pass their own transaction so the change and its audit entry
/// commit or roll back together.
pub async fn insert_entry(conn: &mut SqliteConnection, entry: NewAuditEntry) -> ModerationResult<AuditLogEntry> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let details = entry
        .details
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        r#"
        INSERT INTO audit_logs
        (id, organization_id, action_type, actor_id, actor_email, target_type, target_id,
         details, ip_address, user_agent, success, error_message, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&entry.organization_id)
    .bind(entry.action_type.as_str())
    .bind(&entry.actor_id)
    .bind(&entry.actor_email)
    .bind(&entry.target_type)
    .bind(&entry.target_id)
    .bind(&details)
    .bind(&entry.ip_address)
    .bind(&entry.user_agent)
    .bind(entry.success)
    .bind(&entry.error_message)
    .bind(to_db_timestamp(now))
    .execute(&mut *conn)
    .await?;

    crate::metrics::record_audit_entry(entry.action_type.as_str(), entry.success);

    Ok(AuditLogEntry {
        id,
        organization_id: entry.organization_id,
        action_type: entry.action_type,
        actor_id: entry.actor_id,
        actor_email: entry.actor_email,
        target_type: entry.target_type,
        target_id: entry.target_id,
        details: entry.details,
        ip_address: entry.ip_address,
        user_agent: entry.user_agent,
        success: entry.success,
        error_message: entry.error_message,
        created_at: now,
    })
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, organization_id, action_type, actor_id, actor_email, target_type, target_id,
           details, ip_address, user_agent, success, error_message, created_at
    FROM audit_logs"#;

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, organization_id: &str, filter: &AuditLogFilter) {
    builder.push(" WHERE organization_id = ");
    builder.push_bind(organization_id.to_string());

    if let Some(action_type) = filter.action_type {
        builder.push(" AND action_type = ");
        builder.push_bind(action_type.as_str());
    }
    if let Some(actor_id) = &filter.actor_id {
        builder.push(" AND actor_id = ");
        builder.push_bind(actor_id.clone());
    }
    if let Some(target_id) = &filter.target_id {
        builder.push(" AND target_id = ");
        builder.push_bind(target_id.clone());
    }
    if let Some(success) = filter.success {
        builder.push(" AND success = ");
        builder.push_bind(success);
    }
    if let Some(start) = filter.start_date {
        builder.push(" AND created_at >= ");
        builder.push_bind(to_db_timestamp(start));
    }
    if let Some(end) = filter.end_date {
        builder.push(" AND created_at <= ");
        builder.push_bind(to_db_timestamp(end));
    }
}

fn parse_entry(row: SqliteRow) -> ModerationResult<AuditLogEntry> {
    let action_str: String = row.get("action_type");
    let created_at: String = row.get("created_at");
    let details: Option<String> = row.get("details");

    Ok(AuditLogEntry {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        action_type: AuditActionType::from_str(&action_str)?,
        actor_id: row.get("actor_id"),
        actor_email: row.get("actor_email"),
        target_type: row.get("target_type"),
        target_id: row.get("target_id"),
        details: details.as_deref().map(serde_json::from_str).transpose()?,
        ip_address: row.get("ip_address"),
        user_agent: row.get("user_agent"),
        success: row.get("success"),
        error_message: row.get("error_message"),
        created_at: parse_db_timestamp(&created_at)?,
    })
}

/// Encode entries as RFC 4180 CSV with a header row
pub fn entries_to_csv(entries: &[AuditLogEntry]) -> String {
    let mut out = String::new();
    out.push_str(&CSV_HEADER.join(","));
    out.push_str("\r\n");

    for entry in entries {
        let details = entry
            .details
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_default();
        let created_at = to_db_timestamp(entry.created_at);
        let fields = [
            entry.id.as_str(),
            entry.organization_id.as_str(),
            entry.action_type.as_str(),
            entry.actor_id.as_str(),
            entry.actor_email.as_deref().unwrap_or(""),
            entry.target_type.as_deref().unwrap_or(""),
            entry.target_id.as_deref().unwrap_or(""),
            details.as_str(),
            entry.ip_address.as_deref().unwrap_or(""),
            entry.user_agent.as_deref().unwrap_or(""),
            if entry.success { "true" } else { "false" },
            entry.error_message.as_deref().unwrap_or(""),
            created_at.as_str(),
        ];
        let line: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&line.join(","));
        out.push_str("\r\n");
    }

    out
}

fn csv_field(value: &str) -> String {
    // Spreadsheets evaluate cells starting with these as formulas
    if value.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        return format!("\"'{}\"", value.replace('"', "\"\""));
    }
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use serde_json::json;

    #[test]
    fn test_action_type_round_trips_through_str() {
        for action in AuditActionType::ALL {
            assert_eq!(AuditActionType::from_str(action.as_str()).unwrap(), action);
            let wire = serde_json::to_value(action).unwrap();
            assert_eq!(wire, json!(action.as_str()));
        }
        assert!(AuditActionType::from_str("made_up").is_err());
    }

    #[test]
    fn test_csv_quotes_special_fields() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_csv_neutralizes_formula_fields() {
        assert_eq!(csv_field("=HYPERLINK(\"x\")"), "\"'=HYPERLINK(\"\"x\"\")\"");
        assert_eq!(csv_field("+1"), "\"'+1\"");
        assert_eq!(csv_field("-2+3"), "\"'-2+3\"");
        assert_eq!(csv_field("@SUM(A1)"), "\"'@SUM(A1)\"");
        assert_eq!(csv_field("user@example.com"), "user@example.com");

        let mut entry = NewAuditEntry::new("org-1", AuditActionType::ClientFlagged, "user-mod");
        entry.user_agent = Some("=cmd|' /C calc'!A0".to_string());
        let exported = AuditLogEntry {
            id: "a1".to_string(),
            organization_id: entry.organization_id,
            action_type: entry.action_type,
            actor_id: entry.actor_id,
            actor_email: None,
            target_type: None,
            target_id: None,
            details: None,
            ip_address: None,
            user_agent: entry.user_agent,
            success: true,
            error_message: None,
            created_at: Utc::now(),
        };
        let csv = entries_to_csv(&[exported]);
        assert!(csv.contains(",\"'=cmd|' /C calc'!A0\","));
    }

    #[tokio::test]
    async fn test_record_and_filter() {
        let manager = AuditLogManager::new(create_memory_pool().await.unwrap());

        manager
            .record(
                NewAuditEntry::new("org-1", AuditActionType::ClientFlagged, "user-mod")
                    .target("client", "client-42")
                    .details(json!({"flagType": "warning"})),
            )
            .await
            .unwrap();
        manager
            .record(
                NewAuditEntry::new("org-1", AuditActionType::TokenBanned, "user-admin")
                    .target("token", "tok-1")
                    .failed("Token already banned"),
            )
            .await
            .unwrap();
        manager
            .record(NewAuditEntry::new("org-2", AuditActionType::ClientFlagged, "user-other"))
            .await
            .unwrap();

        let all = manager.list("org-1", &AuditLogFilter::default()).await.unwrap();
        assert_eq!(all.total, 2);
        assert_eq!(all.logs[0].action_type, AuditActionType::TokenBanned);

        let failed = manager
            .list(
                "org-1",
                &AuditLogFilter {
                    success: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.total, 1);
        assert_eq!(failed.logs[0].error_message.as_deref(), Some("Token already banned"));

        let by_target = manager
            .list(
                "org-1",
                &AuditLogFilter {
                    target_id: Some("client-42".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_target.logs.len(), 1);
        assert_eq!(by_target.logs[0].details, Some(json!({"flagType": "warning"})));
    }

    #[tokio::test]
    async fn test_entries_cannot_be_modified() {
        let pool = create_memory_pool().await.unwrap();
        let manager = AuditLogManager::new(pool.clone());
        let entry = manager
            .record(NewAuditEntry::new("org-1", AuditActionType::RoleGranted, "user-root"))
            .await
            .unwrap();

        let update = sqlx::query("UPDATE audit_logs SET actor_id = 'someone' WHERE id = ?")
            .bind(&entry.id)
            .execute(&pool)
            .await;
        assert!(update.is_err());

        let delete = sqlx::query("DELETE FROM audit_logs WHERE id = ?")
            .bind(&entry.id)
            .execute(&pool)
            .await;
        assert!(delete.is_err());
    }

    #[tokio::test]
    async fn test_export_csv_has_header_and_rows() {
        let manager = AuditLogManager::new(create_memory_pool().await.unwrap());
        for _ in 0..3 {
            manager
                .record(NewAuditEntry::new("org-1", AuditActionType::SettingsChanged, "user-a"))
                .await
                .unwrap();
        }

        let entries = manager
            .export_entries("org-1", &AuditLogFilter::default(), 2)
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);

        let csv = entries_to_csv(&entries);
        let lines: Vec<&str> = csv.split("\r\n").filter(|l| !l.is_empty()).collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id,organizationId,actionType"));
        assert!(lines[1].contains("settings_changed"));
    }
}
