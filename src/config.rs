/// Configuration management for the moderation service
use crate::error::{ModerationError, ModerationResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::EnvFilter;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub authentication: AuthConfig,
    pub rate_limit: RateLimitConfig,
    pub detection: DetectionConfig,
    pub audit: AuditConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub version: String,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    pub max_connections: u32,
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret used to verify admin bearer tokens
    pub jwt_secret: String,
    /// User ids that always act as SuperAdmin in every organization
    pub admin_user_ids: Vec<String>,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub authenticated_rps: u32,
    pub unauthenticated_rps: u32,
    pub burst_size: u32,
}

/// Background abuse detection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub event_retention_days: i64,
}

/// Audit log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub export_max_rows: i64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl LoggingConfig {
    /// Tracing filter built from the configured level directives
    pub fn env_filter(&self) -> ModerationResult<EnvFilter> {
        EnvFilter::try_new(&self.level)
            .map_err(|e| ModerationError::Validation(format!("Invalid log level {:?}: {}", self.level, e)))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                hostname: "0.0.0.0".to_string(),
                port: 4100,
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            storage: StorageConfig {
                database_path: PathBuf::from("./data/moderation.sqlite"),
                max_connections: 10,
            },
            authentication: AuthConfig {
                jwt_secret: String::new(),
                admin_user_ids: Vec::new(),
            },
            rate_limit: RateLimitConfig {
                enabled: true,
                authenticated_rps: 100,
                unauthenticated_rps: 10,
                burst_size: 50,
            },
            detection: DetectionConfig {
                enabled: true,
                interval_secs: 300,
                event_retention_days: 30,
            },
            audit: AuditConfig {
                export_max_rows: 10_000,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                json: false,
            },
        }
    }
}

/// Read and parse an environment variable, falling back to `default` when unset
fn env_parse<T: FromStr>(key: &str, default: T) -> ModerationResult<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ModerationError::Validation(format!("Invalid value for {}: {}", key, raw))),
        Err(_) => Ok(default),
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> ModerationResult<Self> {
        dotenv::dotenv().ok();

        let defaults = ServerConfig::default();

        let hostname = env::var("PRAVADO_HOSTNAME").unwrap_or(defaults.service.hostname);
        let port = env_parse("PRAVADO_PORT", defaults.service.port)?;
        let version = env::var("PRAVADO_VERSION").unwrap_or(defaults.service.version);

        let database_path = env::var("PRAVADO_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.storage.database_path);
        let max_connections =
            env_parse("PRAVADO_DB_MAX_CONNECTIONS", defaults.storage.max_connections)?;

        let jwt_secret = env::var("PRAVADO_JWT_SECRET")
            .map_err(|_| ModerationError::Validation("JWT secret required".to_string()))?;

        // Parse admin user ids from comma-separated list
        let admin_user_ids = env::var("PRAVADO_ADMIN_USER_IDS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<String>>();

        let rate_limit = RateLimitConfig {
            enabled: env_parse("PRAVADO_RATE_LIMITS_ENABLED", defaults.rate_limit.enabled)?,
            authenticated_rps: env_parse(
                "PRAVADO_RATE_LIMIT_AUTHENTICATED_RPS",
                defaults.rate_limit.authenticated_rps,
            )?,
            unauthenticated_rps: env_parse(
                "PRAVADO_RATE_LIMIT_UNAUTHENTICATED_RPS",
                defaults.rate_limit.unauthenticated_rps,
            )?,
            burst_size: env_parse("PRAVADO_RATE_LIMIT_BURST", defaults.rate_limit.burst_size)?,
        };

        let detection = DetectionConfig {
            enabled: env_parse("PRAVADO_DETECTION_ENABLED", defaults.detection.enabled)?,
            interval_secs: env_parse(
                "PRAVADO_DETECTION_INTERVAL_SECS",
                defaults.detection.interval_secs,
            )?,
            event_retention_days: env_parse(
                "PRAVADO_EVENT_RETENTION_DAYS",
                defaults.detection.event_retention_days,
            )?,
        };

        let audit = AuditConfig {
            export_max_rows: env_parse(
                "PRAVADO_AUDIT_EXPORT_MAX_ROWS",
                defaults.audit.export_max_rows,
            )?,
        };

        let log_level = env::var("RUST_LOG").unwrap_or(defaults.logging.level);
        let log_json = env::var("PRAVADO_LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                version,
            },
            storage: StorageConfig {
                database_path,
                max_connections,
            },
            authentication: AuthConfig {
                jwt_secret,
                admin_user_ids,
            },
            rate_limit,
            detection,
            audit,
            logging: LoggingConfig {
                level: log_level,
                json: log_json,
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> ModerationResult<()> {
        if self.service.hostname.is_empty() {
            return Err(ModerationError::Validation("Hostname cannot be empty".to_string()));
        }

        if self.authentication.jwt_secret.len() < 32 {
            return Err(ModerationError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }

        if self.storage.max_connections == 0 {
            return Err(ModerationError::Validation(
                "Database pool needs at least one connection".to_string(),
            ));
        }

        if self.detection.interval_secs == 0 {
            return Err(ModerationError::Validation(
                "Detection interval must be greater than zero".to_string(),
            ));
        }

        if self.detection.event_retention_days < 1 {
            return Err(ModerationError::Validation(
                "Event retention must be at least one day".to_string(),
            ));
        }

        if self.audit.export_max_rows < 1 {
            return Err(ModerationError::Validation(
                "Audit export row limit must be positive".to_string(),
            ));
        }

        self.logging.env_filter()?;

        Ok(())
    }
}
