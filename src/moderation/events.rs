/// Abuse signal events and trailing-window metrics
///
/// The platform API reports individual abuse signals (rate limit hits,
/// malformed payloads, failed authentications, ...) here. Detection reads
/// them back as counters over a fixed trailing window. Each request is
/// reported once: as `request` when it succeeded, or with its failure kind.
use crate::{
    db::to_db_timestamp,
    error::{ModerationError, ModerationResult},
    moderation::audit::{insert_entry, AuditActionType, AuditActor},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

/// Kind of abuse signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbuseEventKind {
    /// Any request, used for volume and error-rate computations
    Request,
    RateLimitViolation,
    MalformedPayload,
    AuthFailure,
    TokenReuse,
    WebhookFailure,
}

impl AbuseEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AbuseEventKind::Request => "request",
            AbuseEventKind::RateLimitViolation => "rate_limit_violation",
            AbuseEventKind::MalformedPayload => "malformed_payload",
            AbuseEventKind::AuthFailure => "auth_failure",
            AbuseEventKind::TokenReuse => "token_reuse",
            AbuseEventKind::WebhookFailure => "webhook_failure",
        }
    }
}

/// Identity an abuse signal or metric snapshot is keyed by
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseSubject {
    pub client_id: Option<String>,
    pub ip_address: Option<String>,
    pub token_id: Option<String>,
}

impl AbuseSubject {
    pub fn client(client_id: &str) -> Self {
        Self {
            client_id: Some(client_id.to_string()),
            ..Default::default()
        }
    }

    pub fn ip(ip_address: &str) -> Self {
        Self {
            ip_address: Some(ip_address.to_string()),
            ..Default::default()
        }
    }

    pub fn token(token_id: &str) -> Self {
        Self {
            token_id: Some(token_id.to_string()),
            ..Default::default()
        }
    }

    /// Drop blank identifiers so `""` counts as absent
    pub fn normalized(self) -> Self {
        fn clean(value: Option<String>) -> Option<String> {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        }
        Self {
            client_id: clean(self.client_id),
            ip_address: clean(self.ip_address),
            token_id: clean(self.token_id),
        }
    }

    pub fn has_identifier(&self) -> bool {
        self.client_id.is_some() || self.ip_address.is_some() || self.token_id.is_some()
    }

    /// Normalize and require at least one identifier
    pub fn require_identifier(self) -> ModerationResult<Self> {
        let subject = self.normalized();
        if !subject.has_identifier() {
            return Err(ModerationError::Validation(
                "At least one of clientId, ipAddress or tokenId is required".to_string(),
            ));
        }
        Ok(subject)
    }

    /// Audit target for the most specific identifier: client, then token, then IP
    pub fn target(&self) -> (&'static str, String) {
        if let Some(client_id) = &self.client_id {
            ("client", client_id.clone())
        } else if let Some(token_id) = &self.token_id {
            ("token", token_id.clone())
        } else {
            ("ip", self.ip_address.clone().unwrap_or_default())
        }
    }
}

/// Single reported abuse signal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseEvent {
    pub kind: AbuseEventKind,
    #[serde(flatten)]
    pub subject: AbuseSubject,
    pub occurred_at: Option<DateTime<Utc>>,
}

/// Counter snapshot over a trailing window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseDetectionMetrics {
    pub organization_id: String,
    #[serde(flatten)]
    pub subject: AbuseSubject,
    pub time_window_minutes: i64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub total_requests: i64,
    pub rate_limit_violations: i64,
    pub malformed_payloads: i64,
    pub auth_failures: i64,
    pub token_reuse_count: i64,
    pub webhook_failures: i64,
}

impl AbuseDetectionMetrics {
    /// Failed requests (rate limited, malformed, unauthenticated)
    pub fn error_count(&self) -> i64 {
        self.rate_limit_violations + self.malformed_payloads + self.auth_failures
    }

    /// Failed share of all requests as a percentage
    pub fn error_rate_percent(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.error_count() as f64 / self.total_requests as f64 * 100.0
    }
}

/// Abuse event store
#[derive(Clone)]
pub struct AbuseEventStore {
    db: SqlitePool,
}

impl AbuseEventStore {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Persist a batch of events for the actor's organization
    ///
    /// Every event must carry at least one identifier; the batch is rejected
    /// as a whole otherwise. The batch and its audit entry commit together.
    pub async fn record_batch(&self, actor: &AuditActor, events: Vec<AbuseEvent>) -> ModerationResult<u64> {
        let organization_id = actor.organization_id.as_str();
        let now = Utc::now();
        let mut prepared = Vec::with_capacity(events.len());
        for (idx, event) in events.into_iter().enumerate() {
            let subject = event.subject.require_identifier().map_err(|_| {
                ModerationError::Validation(format!("Event {} has no clientId, ipAddress or tokenId", idx))
            })?;
            prepared.push((event.kind, subject, event.occurred_at.unwrap_or(now)));
        }

        let mut tx = self.db.begin().await?;
        for (kind, subject, occurred_at) in &prepared {
            sqlx::query(
                r#"
                INSERT INTO abuse_events (organization_id, kind, client_id, ip_address, token_id, occurred_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(organization_id)
            .bind(kind.as_str())
            .bind(&subject.client_id)
            .bind(&subject.ip_address)
            .bind(&subject.token_id)
            .bind(to_db_timestamp(*occurred_at))
            .execute(&mut *tx)
            .await?;
        }

        let count = prepared.len() as u64;
        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::AbuseEventsIngested)
                .details(serde_json::json!({ "accepted": count })),
        )
        .await?;
        tx.commit().await?;

        crate::metrics::record_events_ingested(count);
        Ok(count)
    }

    /// Count events per kind for a subject over `[now - window, now]`
    ///
    /// Every identifier present on the subject must match.
    pub async fn compute_metrics(
        &self,
        organization_id: &str,
        subject: &AbuseSubject,
        window_minutes: i64,
        now: DateTime<Utc>,
    ) -> ModerationResult<AbuseDetectionMetrics> {
        let subject = subject.clone().require_identifier()?;
        let window_start = now - Duration::minutes(window_minutes);

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT kind, COUNT(*) AS cnt FROM abuse_events WHERE organization_id = ",
        );
        query.push_bind(organization_id.to_string());
        query.push(" AND occurred_at >= ");
        query.push_bind(to_db_timestamp(window_start));
        query.push(" AND occurred_at <= ");
        query.push_bind(to_db_timestamp(now));
        if let Some(client_id) = &subject.client_id {
            query.push(" AND client_id = ");
            query.push_bind(client_id.clone());
        }
        if let Some(ip_address) = &subject.ip_address {
            query.push(" AND ip_address = ");
            query.push_bind(ip_address.clone());
        }
        if let Some(token_id) = &subject.token_id {
            query.push(" AND token_id = ");
            query.push_bind(token_id.clone());
        }
        query.push(" GROUP BY kind");

        let rows = query.build().fetch_all(&self.db).await?;

        let mut metrics = AbuseDetectionMetrics {
            organization_id: organization_id.to_string(),
            subject,
            time_window_minutes: window_minutes,
            window_start,
            window_end: now,
            total_requests: 0,
            rate_limit_violations: 0,
            malformed_payloads: 0,
            auth_failures: 0,
            token_reuse_count: 0,
            webhook_failures: 0,
        };

        for row in rows {
            let kind: String = row.get("kind");
            let count: i64 = row.get("cnt");
            metrics.total_requests += count;
            match kind.as_str() {
                "rate_limit_violation" => metrics.rate_limit_violations += count,
                "malformed_payload" => metrics.malformed_payloads += count,
                "auth_failure" => metrics.auth_failures += count,
                "token_reuse" => metrics.token_reuse_count += count,
                "webhook_failure" => metrics.webhook_failures += count,
                _ => {}
            }
        }

        Ok(metrics)
    }

    /// Distinct single-key subjects with events at or after `since`
    pub async fn active_subjects(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> ModerationResult<Vec<AbuseSubject>> {
        let since = to_db_timestamp(since);
        let mut subjects = Vec::new();

        for (column, make) in [
            ("client_id", AbuseSubject::client as fn(&str) -> AbuseSubject),
            ("ip_address", AbuseSubject::ip),
            ("token_id", AbuseSubject::token),
        ] {
            let sql = format!(
                "SELECT DISTINCT {col} FROM abuse_events \
                 WHERE organization_id = ? AND occurred_at >= ? AND {col} IS NOT NULL \
                 ORDER BY {col}",
                col = column
            );
            let values: Vec<String> = sqlx::query_scalar(&sql)
                .bind(organization_id)
                .bind(&since)
                .fetch_all(&self.db)
                .await?;
            subjects.extend(values.iter().map(|v| make(v)));
        }

        Ok(subjects)
    }

    /// Organizations with events at or after `since`
    pub async fn active_organizations(&self, since: DateTime<Utc>) -> ModerationResult<Vec<String>> {
        let orgs = sqlx::query_scalar(
            "SELECT DISTINCT organization_id FROM abuse_events WHERE occurred_at >= ? ORDER BY organization_id",
        )
        .bind(to_db_timestamp(since))
        .fetch_all(&self.db)
        .await?;
        Ok(orgs)
    }

    /// Number of events of an organization at or after `since`
    pub async fn count_since(&self, organization_id: &str, since: DateTime<Utc>) -> ModerationResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM abuse_events WHERE organization_id = ? AND occurred_at >= ?",
        )
        .bind(organization_id)
        .bind(to_db_timestamp(since))
        .fetch_one(&self.db)
        .await?;
        Ok(count)
    }

    /// Event counts since `since` bucketed by UTC weekday and hour
    ///
    /// Returns `(day, hour, count)` with day 0 = Monday. Empty buckets are
    /// omitted.
    pub async fn hourly_counts(
        &self,
        organization_id: &str,
        since: DateTime<Utc>,
    ) -> ModerationResult<Vec<(u32, u32, u64)>> {
        let rows = sqlx::query(
            r#"
            SELECT CAST(strftime('%w', occurred_at) AS INTEGER) AS dow,
                   CAST(strftime('%H', occurred_at) AS INTEGER) AS hour,
                   COUNT(*) AS cnt
            FROM abuse_events
            WHERE organization_id = ? AND occurred_at >= ?
            GROUP BY dow, hour
            ORDER BY dow, hour
            "#,
        )
        .bind(organization_id)
        .bind(to_db_timestamp(since))
        .fetch_all(&self.db)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let dow: i64 = row.get("dow");
                let hour: i64 = row.get("hour");
                let count: i64 = row.get("cnt");
                // strftime counts from Sunday
                (((dow + 6) % 7) as u32, hour as u32, count as u64)
            })
            .collect())
    }

    /// Delete events older than `cutoff`
    pub async fn prune_before(&self, cutoff: DateTime<Utc>) -> ModerationResult<u64> {
        let result = sqlx::query("DELETE FROM abuse_events WHERE occurred_at < ?")
            .bind(to_db_timestamp(cutoff))
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}
