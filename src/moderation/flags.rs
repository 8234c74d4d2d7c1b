/// Moderation flags on clients, tokens and IP addresses
use crate::{
    db::{page_bounds, parse_db_timestamp, parse_optional_timestamp, to_db_timestamp},
    error::{ModerationError, ModerationResult},
    moderation::{
        audit::{insert_entry, AuditActionType, AuditActor},
        events::AbuseSubject,
    },
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;
use validator::Validate;

/// Flag types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    /// Informational, no enforcement
    Warning,
    /// Reduced limits
    Restriction,
    /// Temporarily blocked
    Suspension,
    /// Blocked
    Ban,
}

impl FlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagType::Warning => "warning",
            FlagType::Restriction => "restriction",
            FlagType::Suspension => "suspension",
            FlagType::Ban => "ban",
        }
    }

    pub fn from_str(s: &str) -> ModerationResult<Self> {
        match s.to_lowercase().as_str() {
            "warning" => Ok(FlagType::Warning),
            "restriction" => Ok(FlagType::Restriction),
            "suspension" => Ok(FlagType::Suspension),
            "ban" => Ok(FlagType::Ban),
            _ => Err(ModerationError::Validation(format!("Invalid flag type: {}", s))),
        }
    }

    /// Whether an active flag of this type restricts the subject
    pub fn is_restrictive(&self) -> bool {
        !matches!(self, FlagType::Warning)
    }
}

/// Flag severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FlagSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlagSeverity::Low => "low",
            FlagSeverity::Medium => "medium",
            FlagSeverity::High => "high",
            FlagSeverity::Critical => "critical",
        }
    }

    pub fn from_str(s: &str) -> ModerationResult<Self> {
        match s.to_lowercase().as_str() {
            "low" => Ok(FlagSeverity::Low),
            "medium" => Ok(FlagSeverity::Medium),
            "high" => Ok(FlagSeverity::High),
            "critical" => Ok(FlagSeverity::Critical),
            _ => Err(ModerationError::Validation(format!("Invalid flag severity: {}", s))),
        }
    }
}

/// Moderation flag
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModerationFlag {
    pub id: String,
    pub organization_id: String,
    pub client_id: Option<String>,
    pub token_id: Option<String>,
    pub ip_address: Option<String>,
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    pub reason: String,
    pub description: String,
    pub abuse_report_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
}

impl ModerationFlag {
    /// Unresolved and not past its expiry
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_resolved && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Manual flag submission
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FlagClientRequest {
    pub client_id: Option<String>,
    pub token_id: Option<String>,
    pub ip_address: Option<String>,
    pub flag_type: FlagType,
    pub severity: FlagSeverity,
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub reason: String,
    #[validate(length(min = 10, max = 2000, message = "must be between 10 and 2000 characters"))]
    pub description: String,
    #[validate(range(min = 1, max = 8760, message = "must be between 1 and 8760 hours"))]
    pub expires_in_hours: Option<i64>,
    pub abuse_report_id: Option<String>,
}

impl FlagClientRequest {
    /// Run every check that must pass before the flag is written
    ///
    /// Returns the normalized subject the flag applies to.
    pub fn check(&self) -> ModerationResult<AbuseSubject> {
        let subject = AbuseSubject {
            client_id: self.client_id.clone(),
            ip_address: self.ip_address.clone(),
            token_id: self.token_id.clone(),
        }
        .require_identifier()?;

        if self.reason.trim().is_empty() {
            return Err(ModerationError::Validation(
                "reason must contain at least 1 non-blank character".to_string(),
            ));
        }

        self.validate()?;
        Ok(subject)
    }
}

/// Result of a manual flag submission
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagClientResponse {
    pub flag_id: String,
}

/// Token ban submission
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BanTokenRequest {
    #[validate(length(min = 1, message = "is required"))]
    pub token_id: String,
    #[validate(length(min = 1, max = 200, message = "must be between 1 and 200 characters"))]
    pub reason: String,
    #[validate(length(max = 2000, message = "must be at most 2000 characters"))]
    pub description: Option<String>,
    #[validate(range(min = 1, max = 8760, message = "must be between 1 and 8760 hours"))]
    pub expires_in_hours: Option<i64>,
}

/// Result of a token ban
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanTokenResponse {
    pub success: bool,
    pub flag_id: String,
    pub token_id: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Restriction state of a subject
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestrictionStatus {
    pub restricted: bool,
    pub flags: Vec<ModerationFlag>,
}

/// Flag list filters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagFilter {
    pub active_only: Option<bool>,
    pub flag_type: Option<FlagType>,
    pub client_id: Option<String>,
    pub token_id: Option<String>,
    pub ip_address: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

/// Page of flags
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagPage {
    pub flags: Vec<ModerationFlag>,
    pub total: i64,
}

/// Fields of a flag about to be written
struct NewFlag<'a> {
    subject: &'a AbuseSubject,
    flag_type: FlagType,
    severity: FlagSeverity,
    reason: &'a str,
    description: &'a str,
    expires_in: Option<Duration>,
    abuse_report_id: Option<&'a str>,
    created_by: &'a str,
}

/// Moderation flag manager
#[derive(Clone)]
pub struct FlagManager {
    db: SqlitePool,
}

impl FlagManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Create a flag from a manual submission
    pub async fn flag_client(&self, actor: &AuditActor, request: &FlagClientRequest) -> ModerationResult<ModerationFlag> {
        let subject = request.check()?;

        let mut tx = self.db.begin().await?;
        let flag = insert_flag(
            &mut tx,
            &actor.organization_id,
            NewFlag {
                subject: &subject,
                flag_type: request.flag_type,
                severity: request.severity,
                reason: request.reason.trim(),
                description: &request.description,
                expires_in: request.expires_in_hours.map(Duration::hours),
                abuse_report_id: request.abuse_report_id.as_deref().filter(|s| !s.is_empty()),
                created_by: &actor.actor_id,
            },
        )
        .await?;

        let (target_type, target_id) = subject.target();
        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::ClientFlagged)
                .target(target_type, target_id)
                .details(serde_json::json!({
                    "flagId": flag.id,
                    "flagType": flag.flag_type,
                    "severity": flag.severity,
                    "reason": flag.reason,
                    "expiresAt": flag.expires_at,
                    "abuseReportId": flag.abuse_report_id,
                })),
        )
        .await?;
        tx.commit().await?;

        crate::metrics::record_moderation_action(flag.flag_type.as_str(), target_type);
        Ok(flag)
    }

    /// Restriction flag raised by the detector, written on its transaction
    pub async fn auto_flag(
        conn: &mut SqliteConnection,
        organization_id: &str,
        subject: &AbuseSubject,
        abuse_report_id: &str,
        description: &str,
        duration: Duration,
    ) -> ModerationResult<ModerationFlag> {
        insert_flag(
            conn,
            organization_id,
            NewFlag {
                subject,
                flag_type: FlagType::Restriction,
                severity: FlagSeverity::High,
                reason: "Automatic abuse detection",
                description,
                expires_in: Some(duration),
                abuse_report_id: Some(abuse_report_id),
                created_by: SYSTEM_ACTOR,
            },
        )
        .await
    }

    /// Ban a token; fails when the token already has an active ban
    pub async fn ban_token(&self, actor: &AuditActor, request: &BanTokenRequest) -> ModerationResult<BanTokenResponse> {
        request.validate()?;
        let token_id = request.token_id.trim();
        if token_id.is_empty() || request.reason.trim().is_empty() {
            return Err(ModerationError::Validation(
                "tokenId and reason must not be blank".to_string(),
            ));
        }

        let subject = AbuseSubject::token(token_id);
        let description = request
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Token {} banned", token_id));

        let mut tx = self.db.begin().await?;
        let flag = insert_flag(
            &mut tx,
            &actor.organization_id,
            NewFlag {
                subject: &subject,
                flag_type: FlagType::Ban,
                severity: FlagSeverity::Critical,
                reason: request.reason.trim(),
                description: &description,
                expires_in: request.expires_in_hours.map(Duration::hours),
                abuse_report_id: None,
                created_by: &actor.actor_id,
            },
        )
        .await?;

        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::TokenBanned)
                .target("token", token_id)
                .details(serde_json::json!({
                    "flagId": flag.id,
                    "reason": flag.reason,
                    "expiresAt": flag.expires_at,
                })),
        )
        .await?;
        tx.commit().await?;

        crate::metrics::record_moderation_action(FlagType::Ban.as_str(), "token");
        Ok(BanTokenResponse {
            success: true,
            flag_id: flag.id,
            token_id: token_id.to_string(),
            banned_at: flag.created_at,
            expires_at: flag.expires_at,
        })
    }

    /// Get a flag of an organization
    pub async fn get_flag(&self, organization_id: &str, flag_id: &str) -> ModerationResult<ModerationFlag> {
        let mut conn = self.db.acquire().await?;
        fetch_flag(&mut conn, organization_id, flag_id)
            .await?
            .ok_or_else(|| flag_not_found(flag_id))
    }

    /// List flags with filters, newest first
    pub async fn list_flags(&self, organization_id: &str, filter: &FlagFilter) -> ModerationResult<FlagPage> {
        let (limit, offset) = page_bounds(filter.page, filter.page_size);
        let now = to_db_timestamp(Utc::now());

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM moderation_flags");
        push_filters(&mut count, organization_id, filter, &now);
        let total = count.build_query_scalar::<i64>().fetch_one(&self.db).await?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        push_filters(&mut select, organization_id, filter, &now);
        select.push(" ORDER BY created_at DESC, id DESC LIMIT ");
        select.push_bind(limit);
        select.push(" OFFSET ");
        select.push_bind(offset);

        let rows = select.build().fetch_all(&self.db).await?;
        let flags = rows.into_iter().map(parse_flag).collect::<ModerationResult<Vec<_>>>()?;

        Ok(FlagPage { flags, total })
    }

    /// Resolve a flag
    pub async fn resolve_flag(
        &self,
        actor: &AuditActor,
        flag_id: &str,
        notes: Option<&str>,
    ) -> ModerationResult<ModerationFlag> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE moderation_flags
            SET is_resolved = 1,
                resolved_by = ?,
                resolved_at = ?,
                resolution_notes = ?
            WHERE organization_id = ? AND id = ? AND is_resolved = 0
            "#,
        )
        .bind(&actor.actor_id)
        .bind(to_db_timestamp(Utc::now()))
        .bind(notes)
        .bind(&actor.organization_id)
        .bind(flag_id)
        .execute(&mut *tx)
        .await?;

        let flag = fetch_flag(&mut tx, &actor.organization_id, flag_id)
            .await?
            .ok_or_else(|| flag_not_found(flag_id))?;
        if result.rows_affected() == 0 {
            return Err(ModerationError::Conflict(format!(
                "Moderation flag {} is already resolved",
                flag_id
            )));
        }

        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::FlagResolved)
                .target("moderation_flag", flag.id.as_str())
                .details(serde_json::json!({ "notes": flag.resolution_notes })),
        )
        .await?;
        tx.commit().await?;

        Ok(flag)
    }

    /// Unresolved, unexpired flags matching any identifier of the subject
    pub async fn active_flags_for(
        &self,
        organization_id: &str,
        subject: &AbuseSubject,
    ) -> ModerationResult<Vec<ModerationFlag>> {
        let subject = subject.clone().require_identifier()?;

        let mut query = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        query.push(" WHERE organization_id = ");
        query.push_bind(organization_id.to_string());
        query.push(" AND is_resolved = 0 AND (expires_at IS NULL OR expires_at > ");
        query.push_bind(to_db_timestamp(Utc::now()));
        query.push(") AND (");

        let mut keys = query.separated(" OR ");
        for (column, value) in [
            ("client_id", &subject.client_id),
            ("token_id", &subject.token_id),
            ("ip_address", &subject.ip_address),
        ] {
            if let Some(value) = value {
                keys.push(format!("{} = ", column));
                keys.push_bind_unseparated(value.clone());
            }
        }
        query.push(") ORDER BY created_at DESC");

        let rows = query.build().fetch_all(&self.db).await?;
        rows.into_iter().map(parse_flag).collect()
    }

    /// Whether the subject is currently restricted, with the matching flags
    pub async fn check_restriction(
        &self,
        organization_id: &str,
        subject: &AbuseSubject,
    ) -> ModerationResult<RestrictionStatus> {
        let flags = self.active_flags_for(organization_id, subject).await?;
        let now = Utc::now();
        let restricted = flags.iter().any(|f| f.is_active(now) && f.flag_type.is_restrictive());
        Ok(RestrictionStatus { restricted, flags })
    }

    /// Resolve flags whose expiry has passed, auditing each one
    ///
    /// Returns `(organization_id, flag_id)` pairs.
    pub async fn expire_flags(&self, now: DateTime<Utc>) -> ModerationResult<Vec<(String, String)>> {
        let now = to_db_timestamp(now);
        let mut tx = self.db.begin().await?;
        let rows = sqlx::query(
            r#"
            UPDATE moderation_flags
            SET is_resolved = 1,
                resolved_by = ?,
                resolved_at = ?,
                resolution_notes = 'Expired'
            WHERE is_resolved = 0 AND expires_at IS NOT NULL AND expires_at <= ?
            RETURNING organization_id, id
            "#,
        )
        .bind(SYSTEM_ACTOR)
        .bind(&now)
        .bind(&now)
        .fetch_all(&mut *tx)
        .await?;

        let expired: Vec<(String, String)> = rows
            .into_iter()
            .map(|row| (row.get("organization_id"), row.get("id")))
            .collect();

        for (organization_id, flag_id) in &expired {
            insert_entry(
                &mut tx,
                AuditActor::new(organization_id, SYSTEM_ACTOR)
                    .entry(AuditActionType::FlagExpired)
                    .target("moderation_flag", flag_id.as_str()),
            )
            .await?;
        }
        tx.commit().await?;

        Ok(expired)
    }

    /// Count active flags of an organization
    pub async fn count_active(&self, organization_id: &str) -> ModerationResult<i64> {
        let count = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM moderation_flags
            WHERE organization_id = ? AND is_resolved = 0
              AND (expires_at IS NULL OR expires_at > ?)
            "#,
        )
        .bind(organization_id)
        .bind(to_db_timestamp(Utc::now()))
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }
}

/// Actor recorded for automated changes
pub const SYSTEM_ACTOR: &str = "system";

const SELECT_COLUMNS: &str = r#"
    SELECT id, organization_id, client_id, token_id, ip_address, flag_type, severity,
           reason, description, abuse_report_id, created_by, created_at, expires_at,
           is_resolved, resolved_by, resolved_at, resolution_notes
    FROM moderation_flags"#;

/// Write a flag on an open connection
///
/// A ban on a token that already has an active ban inserts nothing and
/// fails with `Conflict`. The check runs inside the INSERT itself, so it
/// holds under concurrent writers.
async fn insert_flag(
    conn: &mut SqliteConnection,
    organization_id: &str,
    new: NewFlag<'_>,
) -> ModerationResult<ModerationFlag> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let expires_at = new.expires_in.map(|d| now + d);

    let result = sqlx::query(
        r#"
        INSERT INTO moderation_flags
        (id, organization_id, client_id, token_id, ip_address, flag_type, severity,
         reason, description, abuse_report_id, created_by, created_at, expires_at)
        SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13
        WHERE NOT (
            ?6 = 'ban' AND ?4 IS NOT NULL AND EXISTS (
                SELECT 1 FROM moderation_flags
                WHERE organization_id = ?2 AND token_id = ?4 AND flag_type = 'ban'
                  AND is_resolved = 0 AND (expires_at IS NULL OR expires_at > ?12)
            )
        )
        "#,
    )
    .bind(&id)
    .bind(organization_id)
    .bind(&new.subject.client_id)
    .bind(&new.subject.token_id)
    .bind(&new.subject.ip_address)
    .bind(new.flag_type.as_str())
    .bind(new.severity.as_str())
    .bind(new.reason)
    .bind(new.description)
    .bind(new.abuse_report_id)
    .bind(new.created_by)
    .bind(to_db_timestamp(now))
    .bind(expires_at.map(to_db_timestamp))
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ModerationError::Conflict(format!(
            "Token {} is already banned",
            new.subject.token_id.as_deref().unwrap_or_default()
        )));
    }

    Ok(ModerationFlag {
        id,
        organization_id: organization_id.to_string(),
        client_id: new.subject.client_id.clone(),
        token_id: new.subject.token_id.clone(),
        ip_address: new.subject.ip_address.clone(),
        flag_type: new.flag_type,
        severity: new.severity,
        reason: new.reason.to_string(),
        description: new.description.to_string(),
        abuse_report_id: new.abuse_report_id.map(str::to_string),
        created_by: new.created_by.to_string(),
        created_at: now,
        expires_at,
        is_resolved: false,
        resolved_by: None,
        resolved_at: None,
        resolution_notes: None,
    })
}

async fn fetch_flag(
    conn: &mut SqliteConnection,
    organization_id: &str,
    flag_id: &str,
) -> ModerationResult<Option<ModerationFlag>> {
    let row = sqlx::query(&format!("{} WHERE organization_id = ? AND id = ?", SELECT_COLUMNS))
        .bind(organization_id)
        .bind(flag_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.map(parse_flag).transpose()
}

fn flag_not_found(flag_id: &str) -> ModerationError {
    ModerationError::NotFound(format!("Moderation flag {} not found", flag_id))
}

fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, organization_id: &str, filter: &FlagFilter, now: &str) {
    builder.push(" WHERE organization_id = ");
    builder.push_bind(organization_id.to_string());

    if filter.active_only.unwrap_or(false) {
        builder.push(" AND is_resolved = 0 AND (expires_at IS NULL OR expires_at > ");
        builder.push_bind(now.to_string());
        builder.push(")");
    }
    if let Some(flag_type) = filter.flag_type {
        builder.push(" AND flag_type = ");
        builder.push_bind(flag_type.as_str());
    }
    for (column, value) in [
        ("client_id", &filter.client_id),
        ("token_id", &filter.token_id),
        ("ip_address", &filter.ip_address),
    ] {
        if let Some(value) = value.as_deref().filter(|s| !s.is_empty()) {
            builder.push(format!(" AND {} = ", column));
            builder.push_bind(value.to_string());
        }
    }
}

fn parse_flag(row: SqliteRow) -> ModerationResult<ModerationFlag> {
    let flag_type: String = row.get("flag_type");
    let severity: String = row.get("severity");
    let created_at: String = row.get("created_at");

    Ok(ModerationFlag {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        client_id: row.get("client_id"),
        token_id: row.get("token_id"),
        ip_address: row.get("ip_address"),
        flag_type: FlagType::from_str(&flag_type)?,
        severity: FlagSeverity::from_str(&severity)?,
        reason: row.get("reason"),
        description: row.get("description"),
        abuse_report_id: row.get("abuse_report_id"),
        created_by: row.get("created_by"),
        created_at: parse_db_timestamp(&created_at)?,
        expires_at: parse_optional_timestamp(row.get("expires_at"))?,
        is_resolved: row.get("is_resolved"),
        resolved_by: row.get("resolved_by"),
        resolved_at: parse_optional_timestamp(row.get("resolved_at"))?,
        resolution_notes: row.get("resolution_notes"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{create_memory_pool, create_pool, reject_audit_writes, run_migrations, DatabaseOptions},
        moderation::audit::{AuditLogFilter, AuditLogManager},
    };

    fn actor(organization_id: &str, user_id: &str) -> AuditActor {
        AuditActor::new(organization_id, user_id)
    }

    fn ban(token_id: &str) -> BanTokenRequest {
        BanTokenRequest {
            token_id: token_id.to_string(),
            reason: "Leaked credentials".to_string(),
            description: None,
            expires_in_hours: None,
        }
    }

    fn request() -> FlagClientRequest {
        FlagClientRequest {
            client_id: Some("client-1".to_string()),
            token_id: None,
            ip_address: None,
            flag_type: FlagType::Restriction,
            severity: FlagSeverity::Medium,
            reason: "Scraping".to_string(),
            description: "Repeated scraping of campaign endpoints".to_string(),
            expires_in_hours: Some(24),
            abuse_report_id: None,
        }
    }

    async fn manager() -> FlagManager {
        FlagManager::new(create_memory_pool().await.unwrap())
    }

    #[test]
    fn test_request_requires_an_identifier() {
        let req = FlagClientRequest {
            client_id: Some(String::new()),
            token_id: Some("   ".to_string()),
            ip_address: None,
            ..request()
        };
        let err = req.check().unwrap_err();
        assert!(matches!(err, ModerationError::Validation(_)));
        assert!(err.to_string().contains("clientId"));
    }

    #[test]
    fn test_request_reason_and_description_lengths() {
        let empty_reason = FlagClientRequest {
            reason: String::new(),
            ..request()
        };
        assert!(empty_reason.check().is_err());

        let blank_reason = FlagClientRequest {
            reason: "   ".to_string(),
            ..request()
        };
        assert!(blank_reason.check().is_err());

        let one_char = FlagClientRequest {
            reason: "x".to_string(),
            ..request()
        };
        assert!(one_char.check().is_ok());

        let short_description = FlagClientRequest {
            description: "too short".to_string(),
            ..request()
        };
        assert!(short_description.check().is_err());

        let bad_expiry = FlagClientRequest {
            expires_in_hours: Some(0),
            ..request()
        };
        assert!(bad_expiry.check().is_err());
    }

    #[test]
    fn test_flag_type_strings() {
        assert_eq!(FlagType::from_str("BAN").unwrap(), FlagType::Ban);
        assert!(FlagType::from_str("mute").is_err());
        assert!(!FlagType::Warning.is_restrictive());
        assert!(FlagType::Suspension.is_restrictive());
        assert!(FlagSeverity::Critical > FlagSeverity::High);
    }

    #[tokio::test]
    async fn test_flag_and_check_restriction() {
        let manager = manager().await;
        let flag = manager.flag_client(&actor("org-1", "user-mod"), &request()).await.unwrap();
        assert!(flag.expires_at.is_some());

        let status = manager
            .check_restriction(
                "org-1",
                &AbuseSubject {
                    client_id: Some("client-1".into()),
                    ip_address: Some("10.0.0.1".into()),
                    token_id: None,
                },
            )
            .await
            .unwrap();
        assert!(status.restricted);
        assert_eq!(status.flags.len(), 1);

        // Tenant isolation
        let other = manager
            .check_restriction("org-2", &AbuseSubject::client("client-1"))
            .await
            .unwrap();
        assert!(!other.restricted);
    }

    #[tokio::test]
    async fn test_warning_does_not_restrict() {
        let manager = manager().await;
        let warning = FlagClientRequest {
            flag_type: FlagType::Warning,
            ..request()
        };
        manager.flag_client(&actor("org-1", "user-mod"), &warning).await.unwrap();

        let status = manager
            .check_restriction("org-1", &AbuseSubject::client("client-1"))
            .await
            .unwrap();
        assert!(!status.restricted);
        assert_eq!(status.flags.len(), 1);
    }

    #[tokio::test]
    async fn test_resolve_flag_twice_conflicts() {
        let manager = manager().await;
        let flag = manager.flag_client(&actor("org-1", "user-mod"), &request()).await.unwrap();

        let resolved = manager
            .resolve_flag(&actor("org-1", "user-admin"), &flag.id, Some("Appeal accepted"))
            .await
            .unwrap();
        assert!(resolved.is_resolved);
        assert_eq!(resolved.resolution_notes.as_deref(), Some("Appeal accepted"));

        let again = manager.resolve_flag(&actor("org-1", "user-admin"), &flag.id, None).await;
        assert!(matches!(again, Err(ModerationError::Conflict(_))));

        let missing = manager.resolve_flag(&actor("org-1", "user-admin"), "nope", None).await;
        assert!(matches!(missing, Err(ModerationError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_ban_token_conflicts_while_active() {
        let manager = manager().await;
        let token_ban = ban("tok-1");

        let response = manager.ban_token(&actor("org-1", "user-admin"), &token_ban).await.unwrap();
        assert!(response.success);
        assert_eq!(response.token_id, "tok-1");
        assert!(response.expires_at.is_none());

        let flag = manager.get_flag("org-1", &response.flag_id).await.unwrap();
        assert_eq!(flag.flag_type, FlagType::Ban);
        assert_eq!(flag.severity, FlagSeverity::Critical);

        let again = manager.ban_token(&actor("org-1", "user-admin"), &token_ban).await;
        assert!(matches!(again, Err(ModerationError::Conflict(_))));

        // A different tenant may ban the same token id
        assert!(manager.ban_token(&actor("org-2", "user-admin"), &token_ban).await.is_ok());
    }

    #[tokio::test]
    async fn test_expire_flags() {
        let manager = manager().await;
        let flag = manager.flag_client(&actor("org-1", "user-mod"), &request()).await.unwrap();
        let permanent = FlagClientRequest {
            expires_in_hours: None,
            client_id: Some("client-2".into()),
            ..request()
        };
        manager.flag_client(&actor("org-1", "user-mod"), &permanent).await.unwrap();

        let expired = manager.expire_flags(Utc::now() + Duration::hours(25)).await.unwrap();
        assert_eq!(expired, vec![("org-1".to_string(), flag.id.clone())]);

        let stored = manager.get_flag("org-1", &flag.id).await.unwrap();
        assert!(stored.is_resolved);
        assert_eq!(stored.resolved_by.as_deref(), Some(SYSTEM_ACTOR));
        assert_eq!(manager.count_active("org-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_flags_filters() {
        let manager = manager().await;
        let first = manager.flag_client(&actor("org-1", "user-mod"), &request()).await.unwrap();
        let warning = FlagClientRequest {
            flag_type: FlagType::Warning,
            client_id: Some("client-2".into()),
            ..request()
        };
        manager.flag_client(&actor("org-1", "user-mod"), &warning).await.unwrap();
        manager.resolve_flag(&actor("org-1", "user-mod"), &first.id, None).await.unwrap();

        let all = manager.list_flags("org-1", &FlagFilter::default()).await.unwrap();
        assert_eq!(all.total, 2);

        let active = manager
            .list_flags(
                "org-1",
                &FlagFilter {
                    active_only: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(active.total, 1);
        assert_eq!(active.flags[0].flag_type, FlagType::Warning);

        let by_client = manager
            .list_flags(
                "org-1",
                &FlagFilter {
                    client_id: Some("client-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_client.flags[0].id, first.id);
    }

    #[tokio::test]
    async fn test_flag_and_ban_are_audited() {
        let pool = create_memory_pool().await.unwrap();
        let manager = FlagManager::new(pool.clone());
        let audit = AuditLogManager::new(pool);

        let flag = manager.flag_client(&actor("org-1", "user-mod"), &request()).await.unwrap();
        manager.ban_token(&actor("org-1", "user-admin"), &ban("tok-1")).await.unwrap();
        manager
            .resolve_flag(&actor("org-1", "user-admin"), &flag.id, None)
            .await
            .unwrap();

        let logs = audit.list("org-1", &AuditLogFilter::default()).await.unwrap();
        let actions: Vec<AuditActionType> = logs.logs.iter().map(|l| l.action_type).collect();
        assert_eq!(logs.total, 3);
        assert!(actions.contains(&AuditActionType::ClientFlagged));
        assert!(actions.contains(&AuditActionType::TokenBanned));
        assert!(actions.contains(&AuditActionType::FlagResolved));

        let flagged = logs
            .logs
            .iter()
            .find(|l| l.action_type == AuditActionType::ClientFlagged)
            .unwrap();
        assert_eq!(flagged.target_id.as_deref(), Some("client-1"));
        assert_eq!(flagged.details.as_ref().unwrap()["flagId"], flag.id.as_str());
    }

    #[tokio::test]
    async fn test_ban_via_flag_request_counts_as_active_ban() {
        let manager = manager().await;
        let token_ban = FlagClientRequest {
            client_id: None,
            token_id: Some("tok-7".into()),
            flag_type: FlagType::Ban,
            ..request()
        };
        manager.flag_client(&actor("org-1", "user-mod"), &token_ban).await.unwrap();

        let again = manager.ban_token(&actor("org-1", "user-admin"), &ban("tok-7")).await;
        assert!(matches!(again, Err(ModerationError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_mutations_roll_back_when_audit_fails() {
        let pool = create_memory_pool().await.unwrap();
        let manager = FlagManager::new(pool.clone());
        let flag = manager.flag_client(&actor("org-1", "user-mod"), &request()).await.unwrap();
        reject_audit_writes(&pool).await;

        let banned = manager.ban_token(&actor("org-1", "user-admin"), &ban("tok-1")).await;
        assert!(matches!(banned, Err(ModerationError::Database(_))));
        let status = manager
            .check_restriction("org-1", &AbuseSubject::token("tok-1"))
            .await
            .unwrap();
        assert!(status.flags.is_empty());

        let resolved = manager.resolve_flag(&actor("org-1", "user-admin"), &flag.id, None).await;
        assert!(resolved.is_err());
        assert!(!manager.get_flag("org-1", &flag.id).await.unwrap().is_resolved);

        let expired = manager.expire_flags(Utc::now() + Duration::hours(25)).await;
        assert!(expired.is_err());
        assert_eq!(manager.count_active("org-1").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_bans_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("flags.sqlite"), DatabaseOptions::default())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let manager = FlagManager::new(pool);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.ban_token(&actor("org-1", "user-admin"), &ban("tok-1")).await })
            })
            .collect();

        let (mut banned, mut conflicts) = (0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => banned += 1,
                Err(ModerationError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected ban error: {}", e),
            }
        }
        assert_eq!((banned, conflicts), (1, 7));

        let active = manager
            .list_flags(
                "org-1",
                &FlagFilter {
                    active_only: Some(true),
                    token_id: Some("tok-1".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(active.total, 1);
    }
}
