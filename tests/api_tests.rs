/// HTTP-level tests for the moderation admin API
mod common;

use axum::http::{header, Method, StatusCode};
use common::*;
use pravado_moderation::moderation::Role;
use serde_json::{json, Value};

fn flag_body() -> Value {
    json!({
        "clientId": "client-abc",
        "flagType": "restriction",
        "severity": "high",
        "reason": "Credential stuffing",
        "description": "Repeated failed logins from a single client",
        "expiresInHours": 24
    })
}

fn auth_failures(client_id: &str, count: usize) -> Value {
    let events: Vec<Value> = (0..count)
        .map(|_| json!({ "kind": "auth_failure", "clientId": client_id }))
        .collect();
    json!({ "events": events })
}

#[tokio::test]
async fn test_health_and_unknown_route() {
    let (_ctx, app) = test_app().await;

    let health = call(&app, Method::GET, "/health", None, None).await;
    assert_eq!(health.status, StatusCode::OK);
    assert_eq!(health.json()["status"], "ok");

    let ready = call(&app, Method::GET, "/health/ready", None, None).await;
    assert_eq!(ready.status, StatusCode::OK);

    let missing = call(&app, Method::GET, "/does-not-exist", None, None).await;
    assert_eq!(missing.status, StatusCode::NOT_FOUND);
    assert_eq!(missing.json()["error"], "NotFound");
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let (_ctx, app) = test_app().await;

    let response = call(&app, Method::GET, "/moderation/abuse-reports", None, None).await;
    assert_eq!(response.status, StatusCode::UNAUTHORIZED);
    assert_eq!(response.json()["error"], "AuthenticationRequired");
}

#[tokio::test]
async fn test_user_without_role_is_forbidden() {
    let (_ctx, app) = test_app().await;
    let stranger = token("org-1", "user-stranger");

    let response = get(&app, "/moderation/abuse-reports", &stranger).await;
    assert_eq!(response.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_flag_requires_an_identifier() {
    let (ctx, app) = test_app().await;
    let moderator = login(&ctx, "org-1", "user-mod", Role::Moderator).await;

    let mut body = flag_body();
    body["clientId"] = json!("");
    let response = post(&app, "/moderation/flag-client", &moderator, body).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert_eq!(response.json()["error"], "InvalidRequest");

    // The rejected attempt is still audited
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;
    let logs = get(&app, "/moderation/audit-logs?actionType=client_flagged", &admin).await;
    assert_eq!(logs.status, StatusCode::OK);
    let logs = logs.json();
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["success"], false);
}

#[tokio::test]
async fn test_flag_rejects_blank_reason_and_short_description() {
    let (ctx, app) = test_app().await;
    let moderator = login(&ctx, "org-1", "user-mod", Role::Moderator).await;

    let mut blank_reason = flag_body();
    blank_reason["reason"] = json!("   ");
    let response = post(&app, "/moderation/flag-client", &moderator, blank_reason).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let mut short_description = flag_body();
    short_description["description"] = json!("too short");
    let response = post(&app, "/moderation/flag-client", &moderator, short_description).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);
    assert!(response.json()["message"].as_str().unwrap().contains("description"));
}

#[tokio::test]
async fn test_flag_restricts_subject_within_its_organization_only() {
    let (ctx, app) = test_app().await;
    let moderator = login(&ctx, "org-1", "user-mod", Role::Moderator).await;
    let other = login(&ctx, "org-2", "user-other", Role::Admin).await;

    let created = post(&app, "/moderation/flag-client", &moderator, flag_body()).await;
    assert_eq!(created.status, StatusCode::OK);
    let flag_id = created.json()["flagId"].as_str().unwrap().to_string();

    let check = get(&app, "/moderation/check?clientId=client-abc", &moderator).await;
    assert_eq!(check.json()["restricted"], true);

    // Another tenant sees nothing
    let check = get(&app, "/moderation/check?clientId=client-abc", &other).await;
    assert_eq!(check.json()["restricted"], false);

    let fetched = get(&app, &format!("/moderation/flags/{}", flag_id), &other).await;
    assert_eq!(fetched.status, StatusCode::NOT_FOUND);

    let listed = get(&app, "/moderation/flags", &other).await;
    assert_eq!(listed.json()["total"], 0);
}

#[tokio::test]
async fn test_resolving_a_flag_twice_conflicts() {
    let (ctx, app) = test_app().await;
    let moderator = login(&ctx, "org-1", "user-mod", Role::Moderator).await;

    let created = post(&app, "/moderation/flag-client", &moderator, flag_body()).await;
    let flag_id = created.json()["flagId"].as_str().unwrap().to_string();
    let uri = format!("/moderation/flags/{}/resolve", flag_id);

    let first = post(&app, &uri, &moderator, json!({ "notes": "False positive" })).await;
    assert_eq!(first.status, StatusCode::OK);
    assert_eq!(first.json()["isResolved"], true);

    let second = post(&app, &uri, &moderator, json!({})).await;
    assert_eq!(second.status, StatusCode::CONFLICT);

    let check = get(&app, "/moderation/check?clientId=client-abc", &moderator).await;
    assert_eq!(check.json()["restricted"], false);
}

#[tokio::test]
async fn test_moderator_cannot_ban_tokens() {
    let (ctx, app) = test_app().await;
    let moderator = login(&ctx, "org-1", "user-mod", Role::Moderator).await;
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;
    let ban = json!({ "tokenId": "tok-1", "reason": "Leaked credentials" });

    let denied = post(&app, "/moderation/ban-token", &moderator, ban.clone()).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let logs = get(&app, "/moderation/audit-logs?actionType=permission_denied", &admin).await;
    let logs = logs.json();
    assert_eq!(logs["total"], 1);
    assert_eq!(logs["logs"][0]["actorId"], "user-mod");

    let banned = post(&app, "/moderation/ban-token", &admin, ban.clone()).await;
    assert_eq!(banned.status, StatusCode::OK);
    let banned = banned.json();
    assert_eq!(banned["success"], true);
    assert_eq!(banned["tokenId"], "tok-1");

    let again = post(&app, "/moderation/ban-token", &admin, ban).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_detection_creates_report_that_resolves_once() {
    let (ctx, app) = test_app().await;
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;

    let ingested = post(&app, "/moderation/events", &admin, auth_failures("client-bad", 10)).await;
    assert_eq!(ingested.status, StatusCode::OK);
    assert_eq!(ingested.json()["accepted"], 10);

    let metrics = get(&app, "/moderation/metrics?clientId=client-bad", &admin).await;
    let metrics = metrics.json();
    assert_eq!(metrics["metrics"]["authFailures"], 10);
    assert_eq!(metrics["assessment"]["abuseScore"], "abusive");

    let summary = post(&app, "/moderation/detect", &admin, json!({})).await;
    assert_eq!(summary.status, StatusCode::OK);
    assert_eq!(summary.json()["reportsCreated"], 1);

    // An open report for the same subject suppresses a duplicate
    let rerun = post(&app, "/moderation/detect", &admin, json!({})).await;
    assert_eq!(rerun.json()["reportsCreated"], 0);

    let page = get(&app, "/moderation/abuse-reports?abuseScore=abusive", &admin).await;
    let page = page.json();
    assert_eq!(page["total"], 1);
    let report = &page["reports"][0];
    assert_eq!(report["clientId"], "client-bad");
    assert_eq!(report["patterns"], json!(["credential_stuffing"]));

    let uri = format!("/moderation/abuse-reports/{}/resolve", report["id"].as_str().unwrap());
    let resolved = post(&app, &uri, &admin, json!({ "notes": "Client rotated keys" })).await;
    assert_eq!(resolved.status, StatusCode::OK);
    assert_eq!(resolved.json()["resolvedBy"], "user-admin");

    let again = post(&app, &uri, &admin, json!({})).await;
    assert_eq!(again.status, StatusCode::CONFLICT);
    assert_eq!(again.json()["error"], "Conflict");
}

#[tokio::test]
async fn test_event_batch_rejects_missing_identifiers() {
    let (ctx, app) = test_app().await;
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;

    let body = json!({ "events": [{ "kind": "request" }] });
    let response = post(&app, "/moderation/events", &admin, body).await;
    assert_eq!(response.status, StatusCode::BAD_REQUEST);

    let empty = post(&app, "/moderation/events", &admin, json!({ "events": [] })).await;
    assert_eq!(empty.status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_audit_export_formats() {
    let (ctx, app) = test_app().await;
    let moderator = login(&ctx, "org-1", "user-mod", Role::Moderator).await;
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;

    post(&app, "/moderation/flag-client", &moderator, flag_body()).await;

    let csv = get(&app, "/moderation/audit-logs/export?format=csv", &admin).await;
    assert_eq!(csv.status, StatusCode::OK);
    assert!(csv.headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/csv"));
    assert!(csv.headers.contains_key(header::CONTENT_DISPOSITION));
    let mut lines = csv.text.lines();
    assert!(lines.next().unwrap().starts_with("id,organizationId,actionType"));
    assert!(lines.any(|line| line.contains("client_flagged")));

    let json_export = get(&app, "/moderation/audit-logs/export?format=json&actionType=client_flagged", &admin).await;
    assert_eq!(json_export.status, StatusCode::OK);
    let entries = json_export.json();
    assert_eq!(entries.as_array().unwrap().len(), 1);
    assert_eq!(entries[0]["actorId"], "user-mod");

    // Exports are themselves audited
    let exports = get(&app, "/moderation/audit-logs?actionType=audit_log_exported", &admin).await;
    assert_eq!(exports.json()["total"], 2);

    let denied = get(&app, "/moderation/audit-logs/export?format=csv", &moderator).await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_detection_config_update() {
    let (ctx, app) = test_app().await;
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;

    let current = get(&app, "/moderation/config", &admin).await;
    assert_eq!(current.status, StatusCode::OK);
    let mut config = current.json()["config"].clone();
    assert_eq!(config["timeWindowMinutes"], 60);

    config["timeWindowMinutes"] = json!(0);
    let invalid = put(&app, "/moderation/config", &admin, config.clone()).await;
    assert_eq!(invalid.status, StatusCode::BAD_REQUEST);

    config["timeWindowMinutes"] = json!(15);
    config["autoFlagEnabled"] = json!(true);
    let updated = put(&app, "/moderation/config", &admin, config).await;
    assert_eq!(updated.status, StatusCode::OK);
    assert_eq!(updated.json()["updatedBy"], "user-admin");

    let stored = get(&app, "/moderation/config", &admin).await;
    assert_eq!(stored.json()["config"]["timeWindowMinutes"], 15);
    assert_eq!(stored.json()["config"]["autoFlagEnabled"], true);
}

#[tokio::test]
async fn test_role_management() {
    let (ctx, app) = test_app().await;
    let root = token("org-1", ROOT_USER);
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;

    let permissions = get(&app, "/admin-access/permissions", &root).await;
    let permissions = permissions.json();
    assert_eq!(permissions["role"], "superadmin");
    assert_eq!(permissions["permissions"]["canManageRoles"], true);

    let denied = post(
        &app,
        "/admin-access/roles/grant",
        &admin,
        json!({ "userId": "user-new", "role": "moderator" }),
    )
    .await;
    assert_eq!(denied.status, StatusCode::FORBIDDEN);

    let granted = post(
        &app,
        "/admin-access/roles/grant",
        &root,
        json!({ "userId": "user-new", "role": "moderator" }),
    )
    .await;
    assert_eq!(granted.status, StatusCode::OK);

    let new_user = token("org-1", "user-new");
    let permissions = get(&app, "/admin-access/permissions", &new_user).await;
    assert_eq!(permissions.json()["permissions"]["canBanTokens"], false);

    let revoked = post(&app, "/admin-access/roles/revoke", &root, json!({ "userId": "user-new" })).await;
    assert_eq!(revoked.status, StatusCode::OK);

    let after = get(&app, "/admin-access/permissions", &new_user).await;
    assert_eq!(after.status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_console_overview_and_heatmap() {
    let (ctx, app) = test_app().await;
    let admin = login(&ctx, "org-1", "user-admin", Role::Admin).await;

    post(&app, "/moderation/events", &admin, auth_failures("client-bad", 10)).await;
    post(&app, "/moderation/detect", &admin, json!({})).await;

    let overview = get(&app, "/admin-console/overview", &admin).await;
    assert_eq!(overview.status, StatusCode::OK);
    let overview = overview.json();
    assert_eq!(overview["openReports"]["abusive"], 1);
    assert_eq!(overview["eventsLast24h"], 10);

    let heatmap = get(&app, "/admin-console/usage-heatmap?days=7", &admin).await;
    let heatmap = heatmap.json();
    assert_eq!(heatmap["cells"].as_array().unwrap().len(), 168);
    assert_eq!(heatmap["maxRequests"], 10);

    let out_of_range = get(&app, "/admin-console/usage-heatmap?days=365", &admin).await;
    assert_eq!(out_of_range.status, StatusCode::BAD_REQUEST);
}
