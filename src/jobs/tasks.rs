/// Background task implementations
use crate::{
    context::AppContext,
    error::ModerationResult,
    moderation::DetectionSummary,
};
use chrono::{Duration, Utc};

/// Run detection for every organization with recent events
pub async fn run_abuse_detection(ctx: &AppContext) -> ModerationResult<Vec<DetectionSummary>> {
    ctx.detector.run_all(Utc::now()).await
}

/// Resolve flags whose expiry has passed
pub async fn expire_flags(ctx: &AppContext) -> ModerationResult<usize> {
    let expired = ctx.flags.expire_flags(Utc::now()).await?;
    for _ in &expired {
        crate::metrics::record_moderation_action("flag_expired", "flag");
    }
    Ok(expired.len())
}

/// Delete abuse events older than the retention window
pub async fn prune_abuse_events(ctx: &AppContext) -> ModerationResult<u64> {
    let cutoff = Utc::now() - Duration::days(ctx.config.detection.event_retention_days);
    ctx.events.prune_before(cutoff).await
}

/// Health check - verify all systems are operational
pub async fn health_check(ctx: &AppContext) -> ModerationResult<()> {
    crate::db::test_connection(&ctx.db).await?;
    crate::metrics::record_pool_state(ctx.db.size(), ctx.db.num_idle());
    crate::metrics::UPTIME_SECONDS.set(ctx.started_at.elapsed().as_secs_f64());
    Ok(())
}
