/// Abuse report lifecycle
use crate::{
    db::{page_bounds, parse_db_timestamp, parse_optional_timestamp, to_db_timestamp},
    error::{ModerationError, ModerationResult},
    moderation::{
        audit::{insert_entry, AuditActionType, AuditActor},
        events::{AbuseDetectionMetrics, AbuseSubject},
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// Categorical abuse classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AbuseScore {
    Normal,
    Suspicious,
    Abusive,
}

impl AbuseScore {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseScore::Normal => "normal",
            AbuseScore::Suspicious => "suspicious",
            AbuseScore::Abusive => "abusive",
        }
    }

    pub fn from_str(s: &str) -> ModerationResult<Self> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(AbuseScore::Normal),
            "suspicious" => Ok(AbuseScore::Suspicious),
            "abusive" => Ok(AbuseScore::Abusive),
            _ => Err(ModerationError::Validation(format!("Invalid abuse score: {}", s))),
        }
    }
}

/// Detected abuse pattern tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbusePatternType {
    RateLimitAbuse,
    MalformedPayloadFlood,
    CredentialStuffing,
    TokenReuse,
    WebhookFailureStorm,
    BurstTraffic,
    HighErrorRate,
}

impl AbusePatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbusePatternType::RateLimitAbuse => "rate_limit_abuse",
            AbusePatternType::MalformedPayloadFlood => "malformed_payload_flood",
            AbusePatternType::CredentialStuffing => "credential_stuffing",
            AbusePatternType::TokenReuse => "token_reuse",
            AbusePatternType::WebhookFailureStorm => "webhook_failure_storm",
            AbusePatternType::BurstTraffic => "burst_traffic",
            AbusePatternType::HighErrorRate => "high_error_rate",
        }
    }
}

/// Abuse report derived from a metrics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseReport {
    pub id: String,
    pub organization_id: String,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub token_id: Option<String>,
    pub abuse_score: AbuseScore,
    pub severity: u8,
    pub patterns: Vec<AbusePatternType>,
    pub metrics: AbuseDetectionMetrics,
    pub is_flagged: bool,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Report list filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseReportFilter {
    pub abuse_score: Option<AbuseScore>,
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub token_id: Option<String>,
    pub is_resolved: Option<bool>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// Page of reports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseReportPage {
    pub reports: Vec<AbuseReport>,
    pub total: i64,
}

/// Abuse report manager
#[derive(Clone)]
pub struct AbuseReportManager {
    db: SqlitePool,
}

impl AbuseReportManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Store a new report for the metrics' subject on an open connection
    pub async fn create_report(
        conn: &mut SqliteConnection,
        metrics: AbuseDetectionMetrics,
        abuse_score: AbuseScore,
        severity: u8,
        patterns: Vec<AbusePatternType>,
    ) -> ModerationResult<AbuseReport> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let subject = metrics.subject.clone();

        sqlx::query(
            r#"
            INSERT INTO abuse_reports
            (id, organization_id, client_id, ip_address, token_id, abuse_score, severity,
             patterns, metrics, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&metrics.organization_id)
        .bind(&subject.client_id)
        .bind(&subject.ip_address)
        .bind(&subject.token_id)
        .bind(abuse_score.as_str())
        .bind(i64::from(severity))
        .bind(serde_json::to_string(&patterns)?)
        .bind(serde_json::to_string(&metrics)?)
        .bind(to_db_timestamp(now))
        .execute(&mut *conn)
        .await?;

        Ok(AbuseReport {
            id,
            organization_id: metrics.organization_id.clone(),
            client_id: subject.client_id,
            ip_address: subject.ip_address,
            token_id: subject.token_id,
            abuse_score,
            severity,
            patterns,
            metrics,
            is_flagged: false,
            is_resolved: false,
            resolved_by: None,
            resolved_at: None,
            notes: None,
            created_at: now,
        })
    }

    /// Get a report of an organization
    pub async fn get_report(&self, organization_id: &str, report_id: &str) -> ModerationResult<AbuseReport> {
        let mut conn = self.db.acquire().await?;
        fetch_report(&mut conn, organization_id, report_id)
            .await?
            .ok_or_else(|| report_not_found(report_id))
    }

    /// List reports with filters, newest first
    pub async fn list_reports(
        &self,
        organization_id: &str,
        filter: &AbuseReportFilter,
    ) -> ModerationResult<AbuseReportPage> {
        let (limit, offset) = page_bounds(filter.page, filter.page_size);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM abuse_reports");
        push_filters(&mut count, organization_id, filter);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.db).await?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut select, organization_id, filter);
        select.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        select.push_bind(limit);
        select.push(" OFFSET ");
        select.push_bind(offset);

        let rows = select.build().fetch_all(&self.db).await?;
        let reports = rows.into_iter().map(parse_report).collect::<ModerationResult<Vec<_>>>()?;

        Ok(AbuseReportPage { reports, total })
    }

    /// Resolve a report; resolved reports only accept note changes afterwards
    pub async fn resolve_report(
        &self,
        actor: &AuditActor,
        report_id: &str,
        notes: Option<&str>,
    ) -> ModerationResult<AbuseReport> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE abuse_reports
            SET is_resolved = 1,
                resolved_by = ?,
                resolved_at = ?,
                notes = COALESCE(?, notes)
            WHERE organization_id = ? AND id = ? AND is_resolved = 0
            "#,
        )
        .bind(&actor.actor_id)
        .bind(to_db_timestamp(Utc::now()))
        .bind(notes)
        .bind(&actor.organization_id)
        .bind(report_id)
        .execute(&mut *tx)
        .await?;

        let report = fetch_report(&mut tx, &actor.organization_id, report_id)
            .await?
            .ok_or_else(|| report_not_found(report_id))?;
        if result.rows_affected() == 0 {
            return Err(ModerationError::Conflict(format!(
                "Abuse report {} was already resolved by {}",
                report.id,
                report.resolved_by.as_deref().unwrap_or("unknown")
            )));
        }

        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::AbuseReportResolved)
                .target("abuse_report", report.id.as_str())
                .details(serde_json::json!({
                    "abuseScore": report.abuse_score,
                    "notes": report.notes,
                })),
        )
        .await?;
        tx.commit().await?;

        crate::metrics::record_report_resolved(report.abuse_score.as_str());
        Ok(report)
    }

    /// Replace the notes of a report
    pub async fn update_notes(&self, actor: &AuditActor, report_id: &str, notes: &str) -> ModerationResult<AbuseReport> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query("UPDATE abuse_reports SET notes = ? WHERE organization_id = ? AND id = ?")
            .bind(notes)
            .bind(&actor.organization_id)
            .bind(report_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(report_not_found(report_id));
        }

        let report = fetch_report(&mut tx, &actor.organization_id, report_id)
            .await?
            .ok_or_else(|| report_not_found(report_id))?;
        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::AbuseReportNotesUpdated)
                .target("abuse_report", report.id.as_str()),
        )
        .await?;
        tx.commit().await?;

        Ok(report)
    }

    /// Mark an unresolved report as flagged on an open connection
    pub async fn mark_flagged(
        conn: &mut SqliteConnection,
        organization_id: &str,
        report_id: &str,
    ) -> ModerationResult<()> {
        let result = sqlx::query(
            "UPDATE abuse_reports SET is_flagged = 1 WHERE organization_id = ? AND id = ? AND is_resolved = 0",
        )
        .bind(organization_id)
        .bind(report_id)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() == 0 {
            let existing = fetch_report(conn, organization_id, report_id)
                .await?
                .ok_or_else(|| report_not_found(report_id))?;
            if existing.is_resolved {
                return Err(ModerationError::Conflict(format!(
                    "Abuse report {} is resolved and can no longer change",
                    report_id
                )));
            }
        }

        Ok(())
    }

    /// Whether the subject already has an unresolved report created at or after `since`
    pub async fn has_open_report(
        &self,
        organization_id: &str,
        subject: &AbuseSubject,
        since: DateTime<Utc>,
    ) -> ModerationResult<bool> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(*) FROM abuse_reports WHERE is_resolved = 0 AND organization_id = ",
        );
        query.push_bind(organization_id.to_string());
        query.push(" AND created_at >= ");
        query.push_bind(to_db_timestamp(since));
        for (column, value) in [
            ("client_id", &subject.client_id),
            ("ip_address", &subject.ip_address),
            ("token_id", &subject.token_id),
        ] {
            query.push(format!(" AND {} ", column));
            match value {
                Some(v) => {
                    query.push("= ");
                    query.push_bind(v.clone());
                }
                None => {
                    query.push("IS NULL");
                }
            }
        }

        let count = query.build_query_scalar::<i64>().fetch_one(&self.db).await?;
        Ok(count > 0)
    }

    /// Unresolved report counts grouped by score
    pub async fn open_counts_by_score(&self, organization_id: &str) -> ModerationResult<Vec<(AbuseScore, i64)>> {
        let rows = sqlx::query(
            r#"
            SELECT abuse_score, COUNT(*) AS cnt
            FROM abuse_reports
            WHERE organization_id = ? AND is_resolved = 0
            GROUP BY abuse_score
            ORDER BY abuse_score
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter()
            .map(|row| {
                let score: String = row.get("abuse_score");
                Ok((AbuseScore::from_str(&score)?, row.get("cnt")))
            })
            .collect()
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, organization_id, client_id, ip_address, token_id, abuse_score, severity,
           patterns, metrics, is_flagged, is_resolved, resolved_by, resolved_at, notes, created_at
    FROM abuse_reports"#;

async fn fetch_report(
    conn: &mut SqliteConnection,
    organization_id: &str,
    report_id: &str,
) -> ModerationResult<Option<AbuseReport>> {
    let row = sqlx::query(&format!("{} WHERE organization_id = ? AND id = ?", SELECT_COLUMNS))
        .bind(organization_id)
        .bind(report_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(parse_report).transpose()
}

fn report_not_found(report_id: &str) -> ModerationError {
    ModerationError::NotFound(format!("Abuse report {} not found", report_id))
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, organization_id: &str, filter: &AbuseReportFilter) {
    builder.push(" WHERE organization_id = ");
    builder.push_bind(organization_id.to_string());

    if let Some(score) = filter.abuse_score {
        builder.push(" AND abuse_score = ");
        builder.push_bind(score.as_str());
    }
    if let Some(client_id) = filter.client_id.as_deref().filter(|s| !s.is_empty()) {
        builder.push(" AND client_id = ");
        builder.push_bind(client_id.to_string());
    }
    if let Some(ip_address) = filter.ip_address.as_deref().filter(|s| !s.is_empty()) {
        builder.push(" AND ip_address = ");
        builder.push_bind(ip_address.to_string());
    }
    if let Some(token_id) = filter.token_id.as_deref().filter(|s| !s.is_empty()) {
        builder.push(" AND token_id = ");
        builder.push_bind(token_id.to_string());
    }
    if let Some(resolved) = filter.is_resolved {
        builder.push(" AND is_resolved = ");
        builder.push_bind(resolved);
    }
}

fn parse_report(row: SqliteRow) -> ModerationResult<AbuseReport> {
    let score: String = row.get("abuse_score");
    let severity: i64 = row.get("severity");
    let patterns: String = row.get("patterns");
    let metrics: String = row.get("metrics");
    let created_at: String = row.get("created_at");

    Ok(AbuseReport {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        client_id: row.get("client_id"),
        ip_address: row.get("ip_address"),
        token_id: row.get("token_id"),
        abuse_score: AbuseScore::from_str(&score)?,
        severity: severity.clamp(0, 100) as u8,
        patterns: serde_json::from_str(&patterns)?,
        metrics: serde_json::from_str(&metrics)?,
        is_flagged: row.get("is_flagged"),
        is_resolved: row.get("is_resolved"),
        resolved_by: row.get("resolved_by"),
        resolved_at: parse_optional_timestamp(row.get("resolved_at"))?,
        notes: row.get("notes"),
        created_at: parse_db_timestamp(&created_at)?,
    })
}
