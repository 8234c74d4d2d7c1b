/// Periodic background jobs
use crate::context::AppContext;
use std::{sync::Arc, time::Instant};
use tokio::time::{interval, Duration};
use tracing::{debug, error, info};

pub mod tasks;

const FLAG_EXPIRY_PERIOD: Duration = Duration::from_secs(15 * 60);
const EVENT_RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Background job kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Score recent abuse events of every organization
    AbuseDetection,
    /// Resolve flags past their expiry
    FlagExpiry,
    /// Drop abuse events past retention
    EventRetention,
    HealthCheck,
}

impl Job {
    pub fn as_str(&self) -> &'static str {
        match self {
            Job::AbuseDetection => "abuse_detection",
            Job::FlagExpiry => "flag_expiry",
            Job::EventRetention => "event_retention",
            Job::HealthCheck => "health_check",
        }
    }
}

/// Job scheduler for background tasks
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        let detection = &self.context.config.detection;
        if detection.enabled {
            self.spawn(Job::AbuseDetection, Duration::from_secs(detection.interval_secs));
        } else {
            info!("Abuse detection sweep disabled");
        }

        self.spawn(Job::FlagExpiry, FLAG_EXPIRY_PERIOD);
        self.spawn(Job::EventRetention, EVENT_RETENTION_PERIOD);
        self.spawn(Job::HealthCheck, HEALTH_CHECK_PERIOD);

        info!("Background jobs started");
    }

    fn spawn(self: &Arc<Self>, job: Job, period: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                scheduler.run_once(job).await;
            }
        });
    }

    /// Run one job to completion, returning whether it succeeded
    pub async fn run_once(&self, job: Job) -> bool {
        let ctx = &self.context;
        crate::metrics::BACKGROUND_JOBS_ACTIVE.inc();
        let start = Instant::now();

        let outcome = match job {
            Job::AbuseDetection => tasks::run_abuse_detection(ctx).await.map(|summaries| {
                let reports: usize = summaries.iter().map(|s| s.reports_created).sum();
                let flags: usize = summaries.iter().map(|s| s.flags_created).sum();
                info!(
                    "Detection sweep over {} organizations: {} reports, {} flags",
                    summaries.len(),
                    reports,
                    flags
                );
            }),
            Job::FlagExpiry => tasks::expire_flags(ctx).await.map(|count| {
                if count > 0 {
                    info!("Resolved {} expired moderation flags", count);
                }
            }),
            Job::EventRetention => tasks::prune_abuse_events(ctx).await.map(|count| {
                info!("Pruned {} abuse events past retention", count);
            }),
            Job::HealthCheck => tasks::health_check(ctx).await,
        };

        crate::metrics::BACKGROUND_JOBS_ACTIVE.dec();
        let status = match &outcome {
            Ok(()) => "success",
            Err(e) => {
                error!("Background job {} failed: {}", job.as_str(), e);
                "failure"
            }
        };
        let elapsed = start.elapsed().as_secs_f64();
        debug!(job = job.as_str(), status, elapsed, "background job finished");
        crate::metrics::record_background_job(job.as_str(), status, elapsed);

        outcome.is_ok()
    }
}
