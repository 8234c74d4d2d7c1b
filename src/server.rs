/// HTTP server setup and routing
use crate::{
    api::middleware::track_metrics,
    context::AppContext,
    error::{ModerationError, ModerationResult},
    rate_limit::rate_limit_middleware,
};
use axum::{
    http::{header, Method, StatusCode},
    middleware,
    response::Json,
    Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

/// Admin console origins are not pinned, callers authenticate with bearer tokens
fn admin_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Admin API router with state applied
///
/// Layers run outermost first: tracing, compression, CORS, request
/// metrics, then rate limiting.
pub fn build_router(ctx: AppContext) -> Router {
    Router::new()
        .merge(crate::api::routes())
        .fallback(not_found)
        .with_state(ctx.clone())
        .layer(middleware::from_fn_with_state(ctx, rate_limit_middleware))
        .layer(middleware::from_fn(track_metrics))
        .layer(admin_cors())
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// 404 handler
async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "NotFound",
            "message": "Endpoint not found"
        })),
    )
}

/// Start the HTTP server on the configured address
pub async fn serve(ctx: AppContext) -> ModerationResult<()> {
    let addr = format!("{}:{}", ctx.config.service.hostname, ctx.config.service.port);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ModerationError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    serve_with_listener(ctx, listener).await
}

/// Serve on an already bound listener
pub async fn serve_with_listener(ctx: AppContext, listener: TcpListener) -> ModerationResult<()> {
    let local_addr = listener.local_addr()?;
    info!("Pravado moderation service listening on {}", local_addr);
    info!("   Service URL: {}", ctx.service_url());

    let app = build_router(ctx);

    axum::serve(listener, app)
        .await
        .map_err(|e| ModerationError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}
