/// Moderator access endpoints: own permissions and role management
use crate::{
    api::{audit_actor, authorize},
    auth::{AdminAuthContext, RequestMeta},
    context::AppContext,
    error::{ModerationError, ModerationResult},
    moderation::{ModeratorPermissions, Permission, Role, RoleAssignment},
};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

/// Build admin access routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/admin-access/permissions", get(get_permissions))
        .route("/admin-access/roles", get(list_roles))
        .route("/admin-access/roles/grant", post(grant_role))
        .route("/admin-access/roles/revoke", post(revoke_role))
}

/// Caller identity and capabilities
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsResponse {
    pub user_id: String,
    pub organization_id: String,
    pub role: Role,
    pub permissions: ModeratorPermissions,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantRoleRequest {
    pub user_id: String,
    pub role: Role,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeRoleRequest {
    pub user_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RolesResponse {
    pub roles: Vec<RoleAssignment>,
}

/// GET /admin-access/permissions
async fn get_permissions(auth: AdminAuthContext) -> Json<PermissionsResponse> {
    Json(PermissionsResponse {
        user_id: auth.user_id,
        organization_id: auth.organization_id,
        role: auth.role,
        permissions: auth.permissions,
    })
}

/// GET /admin-access/roles
async fn list_roles(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
) -> ModerationResult<Json<RolesResponse>> {
    authorize(&ctx, &auth, &meta, Permission::ManageRoles).await?;
    let roles = ctx.roles.list_active_roles(&auth.organization_id).await?;
    Ok(Json(RolesResponse { roles }))
}

/// POST /admin-access/roles/grant
async fn grant_role(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Json(req): Json<GrantRoleRequest>,
) -> ModerationResult<Json<RoleAssignment>> {
    authorize(&ctx, &auth, &meta, Permission::ManageRoles).await?;

    let user_id = req.user_id.trim();
    if user_id.is_empty() {
        return Err(ModerationError::Validation("userId is required".to_string()));
    }

    let assignment = ctx
        .roles
        .grant_role(&audit_actor(&auth, &meta), user_id, req.role, req.notes)
        .await?;

    tracing::info!(
        "Granted {} to {} in {}",
        assignment.role.as_str(),
        user_id,
        auth.organization_id
    );
    Ok(Json(assignment))
}

/// POST /admin-access/roles/revoke
async fn revoke_role(
    State(ctx): State<AppContext>,
    auth: AdminAuthContext,
    meta: RequestMeta,
    Json(req): Json<RevokeRoleRequest>,
) -> ModerationResult<Json<serde_json::Value>> {
    authorize(&ctx, &auth, &meta, Permission::ManageRoles).await?;

    if req.user_id == auth.user_id {
        return Err(ModerationError::Validation("Cannot revoke your own role".to_string()));
    }

    ctx.roles
        .revoke_role(&audit_actor(&auth, &meta), &req.user_id, req.reason)
        .await?;

    Ok(Json(serde_json::json!({ "success": true })))
}
