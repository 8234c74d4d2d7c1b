/// Authentication extractors and utilities
use crate::{
    api::middleware::{client_ip, extract_bearer_token},
    context::AppContext,
    error::{ModerationError, ModerationResult},
    moderation::{ModeratorPermissions, Permission, Role},
};
use async_trait::async_trait;
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;

/// Bearer token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    /// Organization the token is scoped to
    pub org: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub exp: i64,
    pub iat: i64,
}

/// Mint a signed bearer token
pub fn issue_token(
    jwt_secret: &str,
    user_id: &str,
    organization_id: &str,
    email: Option<&str>,
    ttl: Duration,
) -> ModerationResult<String> {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = Utc::now();
    let claims = Claims {
        sub: user_id.to_string(),
        org: organization_id.to_string(),
        email: email.map(str::to_string),
        exp: (now + ttl).timestamp(),
        iat: now.timestamp(),
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .map_err(|e| ModerationError::Internal(format!("Failed to sign token: {}", e)))
}

/// Verify a JWT token with full validation
///
/// This performs:
/// 1. JWT signature verification
/// 2. Expiration checking
/// 3. Claims validation
pub fn verify_token(token: &str, jwt_secret: &str) -> ModerationResult<Claims> {
    use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

    let decoding_key = DecodingKey::from_secret(jwt_secret.as_bytes());
    let mut validation = Validation::new(Algorithm::HS256);
    // Allow some clock skew (5 minutes)
    validation.leeway = 300;

    let data = decode::<Claims>(token, &decoding_key, &validation).map_err(|e| {
        tracing::warn!("JWT verification failed: {}", e);
        match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                ModerationError::Authentication("Token has expired".to_string())
            }
            jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                ModerationError::Authentication("Invalid token signature".to_string())
            }
            _ => ModerationError::Authentication(format!("Invalid token: {}", e)),
        }
    })?;

    let claims = data.claims;
    if claims.sub.trim().is_empty() || claims.org.trim().is_empty() {
        return Err(ModerationError::Authentication(
            "Token is missing the user or organization".to_string(),
        ));
    }
    Ok(claims)
}

/// Moderator authentication context - requires a moderator role
#[derive(Debug, Clone)]
pub struct AdminAuthContext {
    pub user_id: String,
    pub organization_id: String,
    pub email: Option<String>,
    pub role: Role,
    pub permissions: ModeratorPermissions,
}

impl AdminAuthContext {
    /// Fail with 403 unless the caller's role grants `permission`
    pub fn require(&self, permission: Permission) -> ModerationResult<()> {
        if self.permissions.allows(permission) {
            return Ok(());
        }
        tracing::warn!(
            "User {} ({}) denied: {}",
            self.user_id,
            self.role.as_str(),
            permission.as_str()
        );
        Err(ModerationError::Authorization(format!(
            "Role {} cannot {}",
            self.role.as_str(),
            permission.as_str()
        )))
    }
}

#[async_trait]
impl FromRequestParts<AppContext> for AdminAuthContext {
    type Rejection = ModerationError;

    async fn from_request_parts(parts: &mut Parts, state: &AppContext) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| ModerationError::Authentication("Missing authorization header".to_string()))?;

        let claims = verify_token(&token, &state.config.authentication.jwt_secret)?;

        let role = if let Some(assignment) = state.roles.get_role(&claims.org, &claims.sub).await? {
            tracing::debug!("User {} has role {} in {}", claims.sub, assignment.role.as_str(), claims.org);
            assignment.role
        } else if state.config.authentication.admin_user_ids.contains(&claims.sub) {
            // Configured operators act as SuperAdmin in every organization
            Role::SuperAdmin
        } else {
            tracing::warn!("User {} has no moderator role in {}", claims.sub, claims.org);
            return Err(ModerationError::Authorization("Moderator role required".to_string()));
        };

        Ok(AdminAuthContext {
            user_id: claims.sub,
            organization_id: claims.org,
            email: claims.email,
            role,
            permissions: role.permissions(),
        })
    }
}

/// Caller network details recorded on audit entries
#[derive(Debug, Clone, Default)]
pub struct RequestMeta {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

#[async_trait]
impl<S> FromRequestParts<S> for RequestMeta
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_agent = parts
            .headers
            .get("user-agent")
            .and_then(|h| h.to_str().ok())
            .map(str::to_string);

        Ok(RequestMeta {
            ip_address: client_ip(&parts.headers),
            user_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret-that-is-at-least-32-characters";

    #[test]
    fn test_issue_and_verify_token() {
        let token = issue_token(SECRET, "user-1", "org-1", Some("mod@example.com"), Duration::hours(1)).unwrap();
        let claims = verify_token(&token, SECRET).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.org, "org-1");
        assert_eq!(claims.email.as_deref(), Some("mod@example.com"));
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let token = issue_token(SECRET, "user-1", "org-1", None, Duration::hours(1)).unwrap();
        let result = verify_token(&token, "another-secret-that-is-at-least-32-chars");
        assert!(matches!(result, Err(ModerationError::Authentication(_))));
    }

    #[test]
    fn test_rejects_expired_token() {
        // Past the 5 minute leeway
        let token = issue_token(SECRET, "user-1", "org-1", None, Duration::minutes(-10)).unwrap();
        let err = verify_token(&token, SECRET).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn test_rejects_blank_organization() {
        let token = issue_token(SECRET, "user-1", " ", None, Duration::hours(1)).unwrap();
        assert!(verify_token(&token, SECRET).is_err());
    }

    #[test]
    fn test_require_permission() {
        let auth = AdminAuthContext {
            user_id: "user-1".into(),
            organization_id: "org-1".into(),
            email: None,
            role: Role::Moderator,
            permissions: Role::Moderator.permissions(),
        };
        assert!(auth.require(Permission::FlagClients).is_ok());
        assert!(matches!(
            auth.require(Permission::BanTokens),
            Err(ModerationError::Authorization(_))
        ));
    }
}
