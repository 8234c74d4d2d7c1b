//! Shared helpers for the HTTP integration tests
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use pravado_moderation::{
    auth::issue_token,
    config::ServerConfig,
    db::create_memory_pool,
    moderation::{AuditActor, Role},
    server::build_router,
    AppContext,
};
use serde_json::Value;
use tower::ServiceExt;

pub const SECRET: &str = "integration-test-secret-with-32-plus-chars";
pub const ROOT_USER: &str = "user-root";

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.authentication.jwt_secret = SECRET.to_string();
    config.authentication.admin_user_ids = vec![ROOT_USER.to_string()];
    config.rate_limit.enabled = false;
    config.detection.enabled = false;
    config
}

pub async fn test_context() -> AppContext {
    let pool = create_memory_pool().await.unwrap();
    AppContext::with_pool(test_config(), pool)
}

pub async fn test_app() -> (AppContext, Router) {
    let ctx = test_context().await;
    let app = build_router(ctx.clone());
    (ctx, app)
}

/// Grant a role and return a bearer token for the user
pub async fn login(ctx: &AppContext, org: &str, user: &str, role: Role) -> String {
    ctx.roles
        .grant_role(&AuditActor::new(org, ROOT_USER), user, role, None)
        .await
        .unwrap();
    token(org, user)
}

pub fn token(org: &str, user: &str) -> String {
    issue_token(SECRET, user, org, None, chrono::Duration::hours(1)).unwrap()
}

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
}

impl TestResponse {
    pub fn json(&self) -> Value {
        serde_json::from_str(&self.text).unwrap()
    }
}

pub async fn call(app: &Router, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> TestResponse {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

    TestResponse {
        status,
        headers,
        text: String::from_utf8(bytes.to_vec()).unwrap(),
    }
}

pub async fn get(app: &Router, uri: &str, token: &str) -> TestResponse {
    call(app, Method::GET, uri, Some(token), None).await
}

pub async fn post(app: &Router, uri: &str, token: &str, body: Value) -> TestResponse {
    call(app, Method::POST, uri, Some(token), Some(body)).await
}

pub async fn put(app: &Router, uri: &str, token: &str, body: Value) -> TestResponse {
    call(app, Method::PUT, uri, Some(token), Some(body)).await
}
