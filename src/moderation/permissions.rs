/// Moderator roles and the permission set derived from them
use crate::{
    db::{parse_db_timestamp, parse_optional_timestamp, to_db_timestamp},
    error::{ModerationError, ModerationResult},
    moderation::audit::{insert_entry, AuditActionType, AuditActor},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use uuid::Uuid;

/// Moderator role levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Reviews reports and applies flags
    Moderator,
    /// Bans tokens, edits detection config, exports the audit trail
    Admin,
    /// Full access, can grant/revoke roles
    SuperAdmin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Moderator => "moderator",
            Role::Admin => "admin",
            Role::SuperAdmin => "superadmin",
        }
    }

    pub fn from_str(s: &str) -> ModerationResult<Self> {
        match s.to_lowercase().as_str() {
            "moderator" => Ok(Role::Moderator),
            "admin" => Ok(Role::Admin),
            "superadmin" => Ok(Role::SuperAdmin),
            _ => Err(ModerationError::Validation(format!("Invalid role: {}", s))),
        }
    }

    /// Check if this role can perform actions requiring another role
    pub fn can_act_as(&self, required: Role) -> bool {
        self >= &required
    }

    pub fn permissions(&self) -> ModeratorPermissions {
        ModeratorPermissions::for_role(*self)
    }
}

/// Individual capability checked by handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    ViewReports,
    ResolveReports,
    FlagClients,
    BanTokens,
    ViewAuditLogs,
    ExportAuditLogs,
    EditConfig,
    IngestEvents,
    ManageRoles,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ViewReports => "view reports",
            Permission::ResolveReports => "resolve reports",
            Permission::FlagClients => "flag clients",
            Permission::BanTokens => "ban tokens",
            Permission::ViewAuditLogs => "view audit logs",
            Permission::ExportAuditLogs => "export audit logs",
            Permission::EditConfig => "edit detection config",
            Permission::IngestEvents => "ingest abuse events",
            Permission::ManageRoles => "manage roles",
        }
    }
}

/// Permission set exposed to the admin console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModeratorPermissions {
    pub can_view_reports: bool,
    pub can_resolve_reports: bool,
    pub can_flag_clients: bool,
    pub can_ban_tokens: bool,
    pub can_view_audit_logs: bool,
    pub can_export_audit_logs: bool,
    pub can_edit_config: bool,
    pub can_ingest_events: bool,
    pub can_manage_roles: bool,
}

impl ModeratorPermissions {
    pub fn for_role(role: Role) -> Self {
        let admin = role.can_act_as(Role::Admin);
        Self {
            can_view_reports: true,
            can_resolve_reports: true,
            can_flag_clients: true,
            can_ban_tokens: admin,
            can_view_audit_logs: true,
            can_export_audit_logs: admin,
            can_edit_config: admin,
            can_ingest_events: admin,
            can_manage_roles: role == Role::SuperAdmin,
        }
    }

    pub fn allows(&self, permission: Permission) -> bool {
        match permission {
            Permission::ViewReports => self.can_view_reports,
            Permission::ResolveReports => self.can_resolve_reports,
            Permission::FlagClients => self.can_flag_clients,
            Permission::BanTokens => self.can_ban_tokens,
            Permission::ViewAuditLogs => self.can_view_audit_logs,
            Permission::ExportAuditLogs => self.can_export_audit_logs,
            Permission::EditConfig => self.can_edit_config,
            Permission::IngestEvents => self.can_ingest_events,
            Permission::ManageRoles => self.can_manage_roles,
        }
    }
}

/// Moderator role assignment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub role: Role,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_by: Option<String>,
    pub notes: Option<String>,
}

/// Moderator role manager
#[derive(Clone)]
pub struct RoleManager {
    db: SqlitePool,
}

impl RoleManager {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Grant a role to a user within an organization
    ///
    /// A user holds at most one active role per organization; a second grant
    /// fails with `Conflict` until the first is revoked.
    pub async fn grant_role(
        &self,
        actor: &AuditActor,
        user_id: &str,
        role: Role,
        notes: Option<String>,
    ) -> ModerationResult<RoleAssignment> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        let mut tx = self.db.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO moderator_roles (id, organization_id, user_id, role, granted_by, granted_at, notes)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&actor.organization_id)
        .bind(user_id)
        .bind(role.as_str())
        .bind(&actor.actor_id)
        .bind(to_db_timestamp(now))
        .bind(&notes)
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                ModerationError::Conflict(format!("User {} already has an active role", user_id))
            }
            _ => ModerationError::from(e),
        })?;

        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::RoleGranted)
                .target("user", user_id)
                .details(serde_json::json!({ "role": role })),
        )
        .await?;
        tx.commit().await?;

        Ok(RoleAssignment {
            id,
            organization_id: actor.organization_id.clone(),
            user_id: user_id.to_string(),
            role,
            granted_by: actor.actor_id.clone(),
            granted_at: now,
            revoked: false,
            revoked_at: None,
            revoked_by: None,
            notes,
        })
    }

    /// Revoke the active role of a user
    pub async fn revoke_role(&self, actor: &AuditActor, user_id: &str, reason: Option<String>) -> ModerationResult<()> {
        let mut tx = self.db.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE moderator_roles
            SET revoked = 1,
                revoked_at = ?,
                revoked_by = ?,
                notes = COALESCE(?, notes)
            WHERE organization_id = ? AND user_id = ? AND revoked = 0
            "#,
        )
        .bind(to_db_timestamp(Utc::now()))
        .bind(&actor.actor_id)
        .bind(&reason)
        .bind(&actor.organization_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ModerationError::NotFound(format!(
                "No active role found for {}",
                user_id
            )));
        }

        insert_entry(
            &mut tx,
            actor
                .entry(AuditActionType::RoleRevoked)
                .target("user", user_id)
                .details(serde_json::json!({ "reason": reason })),
        )
        .await?;
        tx.commit().await?;

        Ok(())
    }

    /// Get the active role of a user
    pub async fn get_role(
        &self,
        organization_id: &str,
        user_id: &str,
    ) -> ModerationResult<Option<RoleAssignment>> {
        let row = sqlx::query(
            r#"
            SELECT id, organization_id, user_id, role, granted_by, granted_at,
                   revoked, revoked_at, revoked_by, notes
            FROM moderator_roles
            WHERE organization_id = ? AND user_id = ? AND revoked = 0
            ORDER BY granted_at DESC
            LIMIT 1
            "#,
        )
        .bind(organization_id)
        .bind(user_id)
        .fetch_optional(&self.db)
        .await?;

        row.map(parse_assignment).transpose()
    }

    /// List active role assignments of an organization
    pub async fn list_active_roles(&self, organization_id: &str) -> ModerationResult<Vec<RoleAssignment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization_id, user_id, role, granted_by, granted_at,
                   revoked, revoked_at, revoked_by, notes
            FROM moderator_roles
            WHERE organization_id = ? AND revoked = 0
            ORDER BY granted_at DESC
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.db)
        .await?;

        rows.into_iter().map(parse_assignment).collect()
    }
}

fn parse_assignment(row: SqliteRow) -> ModerationResult<RoleAssignment> {
    let role_str: String = row.get("role");
    let granted_at: String = row.get("granted_at");

    Ok(RoleAssignment {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        user_id: row.get("user_id"),
        role: Role::from_str(&role_str)?,
        granted_by: row.get("granted_by"),
        granted_at: parse_db_timestamp(&granted_at)?,
        revoked: row.get("revoked"),
        revoked_at: parse_optional_timestamp(row.get("revoked_at"))?,
        revoked_by: row.get("revoked_by"),
        notes: row.get("notes"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::{create_memory_pool, create_pool, reject_audit_writes, run_migrations, DatabaseOptions},
        moderation::audit::{AuditLogFilter, AuditLogManager},
    };

    fn root() -> AuditActor {
        AuditActor::new("org-1", "user-root")
    }

    #[test]
    fn test_role_hierarchy() {
        assert!(Role::SuperAdmin > Role::Admin);
        assert!(Role::Admin > Role::Moderator);

        assert!(Role::SuperAdmin.can_act_as(Role::Admin));
        assert!(Role::Admin.can_act_as(Role::Moderator));
        assert!(!Role::Moderator.can_act_as(Role::Admin));
        assert!(!Role::Admin.can_act_as(Role::SuperAdmin));
    }

    #[test]
    fn test_role_from_str() {
        assert_eq!(Role::from_str("moderator").unwrap(), Role::Moderator);
        assert_eq!(Role::from_str("ADMIN").unwrap(), Role::Admin);
        assert_eq!(Role::from_str("superadmin").unwrap(), Role::SuperAdmin);
        assert!(Role::from_str("owner").is_err());
    }

    #[test]
    fn test_permissions_per_role() {
        let moderator = Role::Moderator.permissions();
        assert!(moderator.allows(Permission::FlagClients));
        assert!(moderator.allows(Permission::ViewAuditLogs));
        assert!(!moderator.allows(Permission::BanTokens));
        assert!(!moderator.allows(Permission::ExportAuditLogs));

        let admin = Role::Admin.permissions();
        assert!(admin.allows(Permission::BanTokens));
        assert!(admin.allows(Permission::EditConfig));
        assert!(!admin.allows(Permission::ManageRoles));

        assert!(Role::SuperAdmin.permissions().allows(Permission::ManageRoles));
    }

    #[test]
    fn test_permissions_serialize_camel_case() {
        let json = serde_json::to_value(Role::Moderator.permissions()).unwrap();
        assert_eq!(json["canFlagClients"], true);
        assert_eq!(json["canBanTokens"], false);
    }

    #[tokio::test]
    async fn test_grant_and_revoke_role() {
        let manager = RoleManager::new(create_memory_pool().await.unwrap());

        let assignment = manager
            .grant_role(&root(), "user-alice", Role::Admin, None)
            .await
            .unwrap();
        assert_eq!(assignment.role, Role::Admin);

        // Roles are scoped per organization
        assert!(manager.get_role("org-2", "user-alice").await.unwrap().is_none());

        let duplicate = manager
            .grant_role(&root(), "user-alice", Role::Moderator, None)
            .await;
        assert!(matches!(duplicate, Err(ModerationError::Conflict(_))));

        manager
            .revoke_role(&root(), "user-alice", Some("Rotated".to_string()))
            .await
            .unwrap();
        assert!(manager.get_role("org-1", "user-alice").await.unwrap().is_none());

        let again = manager.revoke_role(&root(), "user-alice", None).await;
        assert!(matches!(again, Err(ModerationError::NotFound(_))));

        // A revoked user can be granted again
        manager
            .grant_role(&root(), "user-alice", Role::Moderator, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_role_changes_are_audited() {
        let pool = create_memory_pool().await.unwrap();
        let manager = RoleManager::new(pool.clone());
        manager
            .grant_role(&root(), "user-alice", Role::Admin, None)
            .await
            .unwrap();
        manager
            .revoke_role(&root(), "user-alice", Some("Left the team".into()))
            .await
            .unwrap();

        let logs = AuditLogManager::new(pool)
            .list(
                "org-1",
                &AuditLogFilter {
                    target_id: Some("user-alice".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(logs.total, 2);
        let granted = logs
            .logs
            .iter()
            .find(|l| l.action_type == AuditActionType::RoleGranted)
            .unwrap();
        assert_eq!(granted.details.as_ref().unwrap()["role"], "admin");
        let revoked = logs
            .logs
            .iter()
            .find(|l| l.action_type == AuditActionType::RoleRevoked)
            .unwrap();
        assert_eq!(revoked.details.as_ref().unwrap()["reason"], "Left the team");
    }

    #[tokio::test]
    async fn test_grant_rolls_back_when_audit_fails() {
        let pool = create_memory_pool().await.unwrap();
        let manager = RoleManager::new(pool.clone());
        reject_audit_writes(&pool).await;

        let result = manager.grant_role(&root(), "user-alice", Role::Admin, None).await;
        assert!(matches!(result, Err(ModerationError::Database(_))));
        assert!(manager.get_role("org-1", "user-alice").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_grants_admit_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_pool(&dir.path().join("roles.sqlite"), DatabaseOptions::default())
            .await
            .unwrap();
        run_migrations(&pool).await.unwrap();
        let manager = RoleManager::new(pool);

        let handles: Vec<_> = [Role::Moderator, Role::Admin, Role::SuperAdmin, Role::Moderator]
            .into_iter()
            .cycle()
            .take(8)
            .map(|role| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.grant_role(&root(), "user-alice", role, None).await })
            })
            .collect();

        let (mut granted, mut conflicts) = (0, 0);
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => granted += 1,
                Err(ModerationError::Conflict(_)) => conflicts += 1,
                Err(e) => panic!("unexpected grant error: {}", e),
            }
        }
        assert_eq!((granted, conflicts), (1, 7));
        assert_eq!(manager.list_active_roles("org-1").await.unwrap().len(), 1);
    }
}
