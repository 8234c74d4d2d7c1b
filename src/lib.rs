/// Pravado moderation service
///
/// Multi-tenant abuse detection, moderation flags, admin roles and
/// audit logging behind an HTTP admin API.

pub mod analytics;
pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod moderation;
pub mod rate_limit;
pub mod server;

pub use context::AppContext;
pub use error::{ModerationError, ModerationResult};
