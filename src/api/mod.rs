/// API routes and handlers
pub mod admin_access;
pub mod admin_console;
pub mod audit;
pub mod health;
pub mod middleware;
pub mod moderation;

use crate::{
    auth::{AdminAuthContext, RequestMeta},
    context::AppContext,
    error::ModerationResult,
    moderation::{AuditActionType, AuditActor, NewAuditEntry, Permission},
};
use axum::Router;

/// Build API routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .merge(health::routes())
        .merge(moderation::routes())
        .merge(audit::routes())
        .merge(admin_access::routes())
        .merge(admin_console::routes())
}

/// The authenticated caller as the actor of audited changes
pub(crate) fn audit_actor(auth: &AdminAuthContext, meta: &RequestMeta) -> AuditActor {
    AuditActor {
        organization_id: auth.organization_id.clone(),
        actor_id: auth.user_id.clone(),
        actor_email: auth.email.clone(),
        ip_address: meta.ip_address.clone(),
        user_agent: meta.user_agent.clone(),
    }
}

/// Audit entry attributed to the authenticated caller
pub(crate) fn audit_entry(auth: &AdminAuthContext, meta: &RequestMeta, action: AuditActionType) -> NewAuditEntry {
    audit_actor(auth, meta).entry(action)
}

/// Check a permission, recording denied attempts in the audit log
pub(crate) async fn authorize(
    ctx: &AppContext,
    auth: &AdminAuthContext,
    meta: &RequestMeta,
    permission: Permission,
) -> ModerationResult<()> {
    if let Err(e) = auth.require(permission) {
        ctx.audit
            .record_best_effort(
                audit_entry(auth, meta, AuditActionType::PermissionDenied)
                    .details(serde_json::json!({ "permission": permission.as_str() }))
                    .failed(e.to_string()),
            )
            .await;
        return Err(e);
    }
    Ok(())
}
