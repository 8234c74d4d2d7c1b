/// Rate Limiting System
use crate::{
    config::RateLimitConfig,
    context::AppContext,
    error::{ModerationError, ModerationResult},
};
use axum::{
    extract::{Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

type DirectLimiter = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiter manager
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    authenticated_rps: u32,
    authenticated: Arc<DirectLimiter>,
    unauthenticated: Arc<DirectLimiter>,
}

fn non_zero(value: u32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(NonZeroU32::MIN)
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let auth_quota =
            Quota::per_second(non_zero(config.authenticated_rps)).allow_burst(non_zero(config.burst_size));

        // Anonymous callers get a fifth of the burst
        let unauth_quota =
            Quota::per_second(non_zero(config.unauthenticated_rps)).allow_burst(non_zero(config.burst_size / 5));

        Self {
            enabled: config.enabled,
            authenticated_rps: config.authenticated_rps,
            authenticated: Arc::new(GovernorLimiter::direct(auth_quota)),
            unauthenticated: Arc::new(GovernorLimiter::direct(unauth_quota)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Check rate limit for a caller presenting a bearer token
    pub fn check_authenticated(&self) -> ModerationResult<()> {
        check(&self.authenticated)
    }

    /// Check rate limit for anonymous callers
    pub fn check_unauthenticated(&self) -> ModerationResult<()> {
        check(&self.unauthenticated)
    }
}

fn check(limiter: &DirectLimiter) -> ModerationResult<()> {
    limiter.check().map_err(|_| ModerationError::RateLimitExceeded {
        retry_after: Duration::from_secs(1),
    })
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(ctx): State<AppContext>,
    request: Request,
    next: Next,
) -> Result<Response, ModerationError> {
    let limiter = &ctx.rate_limiter;
    let path = request.uri().path();
    if !limiter.is_enabled() || path.starts_with("/health") || path == "/metrics" {
        return Ok(next.run(request).await);
    }

    let has_auth_header = request.headers().get("authorization").is_some();

    if has_auth_header {
        limiter.check_authenticated()?;
    } else {
        limiter.check_unauthenticated()?;
    }

    let mut response = next.run(request).await;
    if has_auth_header {
        response
            .headers_mut()
            .insert("X-RateLimit-Limit", HeaderValue::from(limiter.authenticated_rps));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(burst_size: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            authenticated_rps: 10,
            unauthenticated_rps: 5,
            burst_size,
        }
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new(&config(50));

        // Should allow first request
        assert!(limiter.check_authenticated().is_ok());
        assert!(limiter.check_unauthenticated().is_ok());
    }

    #[test]
    fn test_burst_limit() {
        let limiter = RateLimiter::new(&config(5));

        // Should allow burst requests
        for _ in 0..5 {
            assert!(limiter.check_authenticated().is_ok());
        }

        // Should hit rate limit after burst
        assert!(matches!(
            limiter.check_authenticated(),
            Err(ModerationError::RateLimitExceeded { .. })
        ));
    }

    #[test]
    fn test_zero_values_fall_back() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: true,
            authenticated_rps: 0,
            unauthenticated_rps: 0,
            burst_size: 0,
        });
        assert!(limiter.check_authenticated().is_ok());
        assert!(limiter.check_unauthenticated().is_ok());
    }
}
