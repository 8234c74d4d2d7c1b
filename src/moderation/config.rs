/// Per-organization abuse detection thresholds
use crate::{
    db::{parse_db_timestamp, to_db_timestamp},
    error::{ModerationError, ModerationResult},
    moderation::audit::{insert_entry, AuditActionType, AuditActor},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use validator::Validate;

/// Thresholds that parameterize abuse scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct AbuseDetectionConfig {
    #[validate(range(min = 1, max = 1440, message = "must be between 1 and 1440 minutes"))]
    pub time_window_minutes: i64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub rate_limit_violation_threshold: i64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub malformed_payload_threshold: i64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub auth_failure_threshold: i64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub token_reuse_threshold: i64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub webhook_failure_threshold: i64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub request_volume_threshold: i64,
    #[validate(range(min = 0.0, max = 100.0, message = "must be a percentage"))]
    pub error_rate_percent_threshold: f64,
    #[validate(range(min = 1, message = "must be at least 1"))]
    pub min_requests_for_error_rate: i64,
    #[validate(range(min = 1, max = 100, message = "must be between 1 and 100"))]
    pub suspicious_severity_threshold: i64,
    #[validate(range(min = 1, max = 100, message = "must be between 1 and 100"))]
    pub abusive_severity_threshold: i64,
    pub auto_flag_enabled: bool,
    #[validate(range(min = 1, max = 8760, message = "must be between 1 and 8760 hours"))]
    pub auto_flag_duration_hours: i64,
}

impl Default for AbuseDetectionConfig {
    fn default() -> Self {
        Self {
            time_window_minutes: 60,
            rate_limit_violation_threshold: 10,
            malformed_payload_threshold: 20,
            auth_failure_threshold: 5,
            token_reuse_threshold: 3,
            webhook_failure_threshold: 15,
            request_volume_threshold: 1000,
            error_rate_percent_threshold: 25.0,
            min_requests_for_error_rate: 20,
            suspicious_severity_threshold: 30,
            abusive_severity_threshold: 70,
            auto_flag_enabled: false,
            auto_flag_duration_hours: 24,
        }
    }
}

impl AbuseDetectionConfig {
    /// Field ranges plus the ordering between the two severity cut-offs
    pub fn check(&self) -> ModerationResult<()> {
        self.validate()?;
        if self.suspicious_severity_threshold >= self.abusive_severity_threshold {
            return Err(ModerationError::Validation(
                "suspiciousSeverityThreshold must be lower than abusiveSeverityThreshold".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stored config plus its change metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDetectionConfig {
    pub organization_id: String,
    pub config: AbuseDetectionConfig,
    pub updated_by: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Detection config manager
#[derive(Clone)]
pub struct DetectionConfigManager {
    db: SqlitePool,
}

impl DetectionConfigManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Config of an organization, defaults when never set
    pub async fn get(&self, organization_id: &str) -> ModerationResult<StoredDetectionConfig> {
        let row = sqlx::query(
            "SELECT config, updated_by, updated_at FROM abuse_detection_config WHERE organization_id = ?",
        )
        .bind(organization_id)
        .fetch_optional(&self.db)
        .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("config");
                let updated_at: String = row.get("updated_at");
                Ok(StoredDetectionConfig {
                    organization_id: organization_id.to_string(),
                    config: serde_json::from_str(&raw)?,
                    updated_by: row.get("updated_by"),
                    updated_at: Some(parse_db_timestamp(&updated_at)?),
                })
            }
            None => Ok(StoredDetectionConfig {
                organization_id: organization_id.to_string(),
                config: AbuseDetectionConfig::default(),
                updated_by: None,
                updated_at: None,
            }),
        }
    }

    /// Validate and store a new config, auditing the change
    pub async fn update(
        &self,
        actor: &AuditActor,
        config: AbuseDetectionConfig,
    ) -> ModerationResult<StoredDetectionConfig> {
        config.check()?;

        let organization_id = actor.organization_id.as_str();
        let previous = self.get(organization_id).await?.config;
        let now = Utc::now();

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO abuse_detection_config (organization_id, config, updated_by, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(organization_id) DO UPDATE SET
                config = excluded.config,
                updated_by = excluded.updated_by,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(organization_id)
        .bind(serde_json::to_string(&config)?)
        .bind(&actor.actor_id)
        .bind(to_db_timestamp(now))
        .execute(&mut *tx)
        .await?;

        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::DetectionConfigUpdated)
                .target("abuse_detection_config", organization_id)
                .details(serde_json::json!({
                    "previous": previous,
                    "current": config,
                })),
        )
        .await?;
        tx.commit().await?;

        Ok(StoredDetectionConfig {
            organization_id: organization_id.to_string(),
            config,
            updated_by: Some(actor.actor_id.clone()),
            updated_at: Some(now),
        })
    }
}
