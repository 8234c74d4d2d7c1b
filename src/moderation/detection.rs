/// Abuse scoring and detection runs
///
/// Each counter is compared against its configured threshold as a ratio.
/// A ratio of 1 or more tags the matching pattern. Severity grows with the
/// largest ratio plus a bonus for every additional pattern:
///
/// ```text
/// severity = clamp(round(peak_ratio * 50) + 10 * (patterns - 1), 0, 100)
/// ```
///
/// so a single counter sitting exactly on its threshold scores 50, and
/// twice the threshold scores 100.
use crate::{
    error::ModerationResult,
    moderation::{
        audit::{insert_entry, AuditActionType, AuditActor, AuditLogManager},
        config::{AbuseDetectionConfig, DetectionConfigManager},
        events::{AbuseDetectionMetrics, AbuseEventStore, AbuseSubject},
        flags::{FlagManager, FlagType, SYSTEM_ACTOR},
        reports::{AbusePatternType, AbuseReport, AbuseReportManager, AbuseScore},
    },
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

/// Longest window a config may request, used to find tenants worth sweeping
const MAX_WINDOW_MINUTES: i64 = 1440;

/// Outcome of scoring one metrics snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbuseAssessment {
    pub abuse_score: AbuseScore,
    pub severity: u8,
    pub patterns: Vec<AbusePatternType>,
}

/// Score a metrics snapshot against a config
pub fn assess(metrics: &AbuseDetectionMetrics, config: &AbuseDetectionConfig) -> AbuseAssessment {
    let mut ratios: Vec<(AbusePatternType, f64)> = vec![
        (
            AbusePatternType::RateLimitAbuse,
            ratio(metrics.rate_limit_violations, config.rate_limit_violation_threshold),
        ),
        (
            AbusePatternType::MalformedPayloadFlood,
            ratio(metrics.malformed_payloads, config.malformed_payload_threshold),
        ),
        (
            AbusePatternType::CredentialStuffing,
            ratio(metrics.auth_failures, config.auth_failure_threshold),
        ),
        (
            AbusePatternType::TokenReuse,
            ratio(metrics.token_reuse_count, config.token_reuse_threshold),
        ),
        (
            AbusePatternType::WebhookFailureStorm,
            ratio(metrics.webhook_failures, config.webhook_failure_threshold),
        ),
        (
            AbusePatternType::BurstTraffic,
            ratio(metrics.total_requests, config.request_volume_threshold),
        ),
    ];

    // Error rate is noise on tiny samples
    if metrics.total_requests >= config.min_requests_for_error_rate {
        let rate = metrics.error_rate_percent();
        let error_ratio = if config.error_rate_percent_threshold > 0.0 {
            rate / config.error_rate_percent_threshold
        } else if rate > 0.0 {
            1.0
        } else {
            0.0
        };
        ratios.push((AbusePatternType::HighErrorRate, error_ratio));
    }

    let peak = ratios.iter().map(|(_, r)| *r).fold(0.0_f64, f64::max);
    let patterns: Vec<AbusePatternType> = ratios
        .iter()
        .filter(|(_, r)| *r >= 1.0)
        .map(|(p, _)| *p)
        .collect();

    let bonus = 10.0 * patterns.len().saturating_sub(1) as f64;
    let severity = ((peak * 50.0).round() + bonus).clamp(0.0, 100.0) as u8;

    let abuse_score = if i64::from(severity) >= config.abusive_severity_threshold {
        AbuseScore::Abusive
    } else if i64::from(severity) >= config.suspicious_severity_threshold {
        AbuseScore::Suspicious
    } else {
        AbuseScore::Normal
    };

    AbuseAssessment {
        abuse_score,
        severity,
        patterns,
    }
}

fn ratio(count: i64, threshold: i64) -> f64 {
    if threshold <= 0 {
        return 0.0;
    }
    count.max(0) as f64 / threshold as f64
}

/// Counters of one detection run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionSummary {
    pub organization_id: String,
    pub subjects_evaluated: usize,
    pub reports_created: usize,
    pub flags_created: usize,
    pub duplicates_skipped: usize,
}

/// Runs detection over recent abuse events
#[derive(Clone)]
pub struct AbuseDetector {
    db: SqlitePool,
    events: AbuseEventStore,
    config: DetectionConfigManager,
    reports: AbuseReportManager,
    audit: AuditLogManager,
}

impl AbuseDetector {
    pub fn new(
        db: SqlitePool,
        events: AbuseEventStore,
        config: DetectionConfigManager,
        reports: AbuseReportManager,
        audit: AuditLogManager,
    ) -> Self {
        Self {
            db,
            events,
            config,
            reports,
            audit,
        }
    }

    /// Evaluate every active subject of an organization
    pub async fn run_for_organization(
        &self,
        organization_id: &str,
        now: DateTime<Utc>,
        triggered_by: &str,
    ) -> ModerationResult<DetectionSummary> {
        let config = self.config.get(organization_id).await?.config;
        let window_start = now - Duration::minutes(config.time_window_minutes);
        let subjects = self.events.active_subjects(organization_id, window_start).await?;

        let mut summary = DetectionSummary {
            organization_id: organization_id.to_string(),
            ..Default::default()
        };

        for subject in subjects {
            summary.subjects_evaluated += 1;
            let metrics = self
                .events
                .compute_metrics(organization_id, &subject, config.time_window_minutes, now)
                .await?;
            let assessment = assess(&metrics, &config);
            if assessment.abuse_score == AbuseScore::Normal {
                continue;
            }

            if self
                .reports
                .has_open_report(organization_id, &subject, window_start)
                .await?
            {
                debug!("Open report already covers {:?} in {}", subject, organization_id);
                summary.duplicates_skipped += 1;
                continue;
            }

            let (report, flagged) = self.open_report(&subject, metrics, assessment, &config).await?;
            summary.reports_created += 1;
            if flagged {
                summary.flags_created += 1;
            }

            info!(
                "Abuse report {} ({}, severity {}) for {:?} in {}",
                report.id,
                report.abuse_score.as_str(),
                report.severity,
                subject,
                organization_id
            );
        }

        self.audit
            .record(
                AuditActor::new(organization_id, triggered_by)
                    .entry(AuditActionType::DetectionRun)
                    .details(serde_json::json!({
                        "subjectsEvaluated": summary.subjects_evaluated,
                        "reportsCreated": summary.reports_created,
                        "flagsCreated": summary.flags_created,
                        "duplicatesSkipped": summary.duplicates_skipped,
                    })),
            )
            .await?;

        crate::metrics::record_detection_run(summary.reports_created as u64, summary.flags_created as u64);
        Ok(summary)
    }

    /// Store a report, its auto flag and their audit entries in one transaction
    ///
    /// Returns the report and whether a flag was raised.
    async fn open_report(
        &self,
        subject: &AbuseSubject,
        metrics: AbuseDetectionMetrics,
        assessment: AbuseAssessment,
        config: &AbuseDetectionConfig,
    ) -> ModerationResult<(AbuseReport, bool)> {
        let system = AuditActor::new(&metrics.organization_id, SYSTEM_ACTOR);

        let mut tx = self.db.begin().await?;
        let report = AbuseReportManager::create_report(
            &mut tx,
            metrics,
            assessment.abuse_score,
            assessment.severity,
            assessment.patterns,
        )
        .await?;
        insert_entry(
            &mut tx,
            system
                .entry(AuditActionType::AbuseReportCreated)
                .target("abuse_report", report.id.as_str())
                .details(serde_json::json!({
                    "abuseScore": report.abuse_score,
                    "severity": report.severity,
                    "patterns": report.patterns,
                })),
        )
        .await?;

        let flag = if report.abuse_score == AbuseScore::Abusive && config.auto_flag_enabled {
            let flag = FlagManager::auto_flag(
                &mut tx,
                &report.organization_id,
                subject,
                &report.id,
                &format!("Abusive traffic detected, see abuse report {}", report.id),
                Duration::hours(config.auto_flag_duration_hours),
            )
            .await?;
            AbuseReportManager::mark_flagged(&mut tx, &report.organization_id, &report.id).await?;
            insert_entry(
                &mut tx,
                system
                    .entry(AuditActionType::ClientFlagged)
                    .target("moderation_flag", flag.id.as_str())
                    .details(serde_json::json!({
                        "flagType": flag.flag_type,
                        "abuseReportId": report.id,
                        "expiresAt": flag.expires_at,
                    })),
            )
            .await?;
            Some(flag)
        } else {
            None
        };
        tx.commit().await?;

        crate::metrics::record_report_created(report.abuse_score.as_str());
        if flag.is_some() {
            crate::metrics::record_moderation_action(FlagType::Restriction.as_str(), subject.target().0);
        }
        Ok((report, flag.is_some()))
    }

    /// Sweep every organization with recent events
    ///
    /// Failures for one organization are logged and do not stop the sweep.
    pub async fn run_all(&self, now: DateTime<Utc>) -> ModerationResult<Vec<DetectionSummary>> {
        let organizations = self
            .events
            .active_organizations(now - Duration::minutes(MAX_WINDOW_MINUTES))
            .await?;

        let mut summaries = Vec::with_capacity(organizations.len());
        for organization_id in organizations {
            match self.run_for_organization(&organization_id, now, SYSTEM_ACTOR).await {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!("Detection failed for {}: {}", organization_id, e),
            }
        }
        Ok(summaries)
    }
}
