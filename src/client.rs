/// Typed HTTP client for the moderation admin API
use crate::{
    api::{admin_access::PermissionsResponse, moderation::ResolveRequest},
    error::ErrorResponse,
    moderation::{
        AbuseDetectionConfig, AbuseReport, AbuseReportFilter, AbuseReportPage, AuditLogEntry, AuditLogFilter,
        AuditLogPage, BanTokenRequest, BanTokenResponse, ExportFormat, FlagClientRequest, FlagClientResponse,
        ModerationFlag, StoredDetectionConfig,
    },
};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::instrument;

/// Message used when the server gives no usable error body
pub const DEFAULT_ERROR_MESSAGE: &str = "Request failed";

/// Client errors
#[derive(Error, Debug)]
pub enum ClientError {
    /// Non-success response from the server
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Connection or protocol failure
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Response body did not match the expected shape
    #[error("Failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Human readable message for display
    pub fn message(&self) -> String {
        match self {
            ClientError::Api { message, .. } => message.clone(),
            ClientError::Transport(e) => e.to_string(),
            ClientError::Decode(e) => e.clone(),
        }
    }

    /// HTTP status of an API error
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;

/// Audit export body in the requested encoding
#[derive(Debug, Clone, PartialEq)]
pub enum ExportPayload {
    Csv(String),
    Json(Vec<AuditLogEntry>),
}

/// Reduce an error body to a display message: `message`, then `error`, then a default
pub fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorResponse>(body) {
        if !parsed.message.trim().is_empty() {
            return parsed.message;
        }
        if !parsed.error.trim().is_empty() {
            return parsed.error;
        }
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                if !text.trim().is_empty() {
                    return text.to_string();
                }
            }
        }
    }

    DEFAULT_ERROR_MESSAGE.to_string()
}

/// Admin API client bound to one bearer token
#[derive(Clone)]
pub struct AdminClient {
    http: Client,
    base_url: String,
    token: String,
}

impl AdminClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url, token)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, self.url(path)).bearer_auth(&self.token)
    }

    /// GET with query parameters, decoding a JSON body
    pub async fn get<Q, T>(&self, path: &str, query: &Q) -> ClientResult<T>
    where
        Q: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request(Method::GET, path).query(query).send().await?;
        decode(check(response).await?).await
    }

    /// Request with a JSON body, decoding a JSON response
    pub async fn send<B, T>(&self, method: Method, path: &str, body: &B) -> ClientResult<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.request(method, path).json(body).send().await?;
        decode(check(response).await?).await
    }

    #[instrument(skip(self, filter))]
    pub async fn list_abuse_reports(&self, filter: &AbuseReportFilter) -> ClientResult<AbuseReportPage> {
        self.get("/moderation/abuse-reports", filter).await
    }

    #[instrument(skip(self))]
    pub async fn get_abuse_report(&self, report_id: &str) -> ClientResult<AbuseReport> {
        self.get(&format!("/moderation/abuse-reports/{}", report_id), &()).await
    }

    #[instrument(skip(self, notes))]
    pub async fn resolve_abuse_report(&self, report_id: &str, notes: Option<&str>) -> ClientResult<AbuseReport> {
        let body = ResolveRequest {
            notes: notes.map(str::to_string),
        };
        self.send(
            Method::POST,
            &format!("/moderation/abuse-reports/{}/resolve", report_id),
            &body,
        )
        .await
    }

    #[instrument(skip(self, request))]
    pub async fn flag_client(&self, request: &FlagClientRequest) -> ClientResult<FlagClientResponse> {
        self.send(Method::POST, "/moderation/flag-client", request).await
    }

    #[instrument(skip(self, notes))]
    pub async fn resolve_flag(&self, flag_id: &str, notes: Option<&str>) -> ClientResult<ModerationFlag> {
        let body = ResolveRequest {
            notes: notes.map(str::to_string),
        };
        self.send(Method::POST, &format!("/moderation/flags/{}/resolve", flag_id), &body)
            .await
    }

    #[instrument(skip(self, request), fields(token_id = %request.token_id))]
    pub async fn ban_token(&self, request: &BanTokenRequest) -> ClientResult<BanTokenResponse> {
        self.send(Method::POST, "/moderation/ban-token", request).await
    }

    #[instrument(skip(self, filter))]
    pub async fn list_audit_logs(&self, filter: &AuditLogFilter) -> ClientResult<AuditLogPage> {
        self.get("/moderation/audit-logs", filter).await
    }

    /// Download audit entries as CSV text or decoded JSON
    #[instrument(skip(self, filter))]
    pub async fn export_audit_logs(
        &self,
        format: ExportFormat,
        filter: &AuditLogFilter,
    ) -> ClientResult<ExportPayload> {
        let response = self
            .request(Method::GET, "/moderation/audit-logs/export")
            .query(&[("format", format)])
            .query(filter)
            .send()
            .await?;
        let response = check(response).await?;

        match format {
            ExportFormat::Csv => Ok(ExportPayload::Csv(response.text().await?)),
            ExportFormat::Json => Ok(ExportPayload::Json(decode(response).await?)),
        }
    }

    #[instrument(skip(self))]
    pub async fn get_config(&self) -> ClientResult<StoredDetectionConfig> {
        self.get("/moderation/config", &()).await
    }

    #[instrument(skip(self, config))]
    pub async fn update_config(&self, config: &AbuseDetectionConfig) -> ClientResult<StoredDetectionConfig> {
        self.send(Method::PUT, "/moderation/config", config).await
    }

    #[instrument(skip(self))]
    pub async fn permissions(&self) -> ClientResult<PermissionsResponse> {
        self.get("/admin-access/permissions", &()).await
    }
}

/// Turn a non-success response into `ClientError::Api`
async fn check(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Api {
        status: status.as_u16(),
        message: error_message(&body),
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
}
