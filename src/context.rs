/// Application context and dependency injection
use crate::{
    config::ServerConfig,
    db,
    error::ModerationResult,
    moderation::{
        AbuseDetector, AbuseEventStore, AbuseReportManager, AuditLogManager, DetectionConfigManager, FlagManager,
        RoleManager,
    },
    rate_limit::RateLimiter,
};
use sqlx::SqlitePool;
use std::{sync::Arc, time::Instant};

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: SqlitePool,
    pub started_at: Instant,
    // Access
    pub roles: Arc<RoleManager>,
    pub audit: Arc<AuditLogManager>,
    // Abuse detection
    pub events: Arc<AbuseEventStore>,
    pub detection_config: Arc<DetectionConfigManager>,
    pub reports: Arc<AbuseReportManager>,
    pub flags: Arc<FlagManager>,
    pub detector: Arc<AbuseDetector>,
    // Rate limiter
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: ServerConfig) -> ModerationResult<Self> {
        // Validate configuration
        config.validate()?;

        let pool = db::create_pool(
            &config.storage.database_path,
            db::DatabaseOptions {
                max_connections: config.storage.max_connections,
                ..Default::default()
            },
        )
        .await?;

        db::run_migrations(&pool).await?;
        db::test_connection(&pool).await?;

        tracing::info!("Database ready at {:?}", config.storage.database_path);

        Ok(Self::with_pool(config, pool))
    }

    /// Build the context around an existing pool with migrations applied
    pub fn with_pool(config: ServerConfig, pool: SqlitePool) -> Self {
        let roles = RoleManager::new(pool.clone());
        let audit = AuditLogManager::new(pool.clone());
        let events = AbuseEventStore::new(pool.clone());
        let detection_config = DetectionConfigManager::new(pool.clone());
        let reports = AbuseReportManager::new(pool.clone());
        let flags = FlagManager::new(pool.clone());

        let detector = AbuseDetector::new(
            pool.clone(),
            events.clone(),
            detection_config.clone(),
            reports.clone(),
            audit.clone(),
        );

        let rate_limiter = RateLimiter::new(&config.rate_limit);

        Self {
            config: Arc::new(config),
            db: pool,
            started_at: Instant::now(),
            roles: Arc::new(roles),
            audit: Arc::new(audit),
            events: Arc::new(events),
            detection_config: Arc::new(detection_config),
            reports: Arc::new(reports),
            flags: Arc::new(flags),
            detector: Arc::new(detector),
            rate_limiter: Arc::new(rate_limiter),
        }
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
