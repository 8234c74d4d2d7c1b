/// Moderation and abuse detection
///
/// Abuse events flow in from the platform API, detection turns trailing
/// window metrics into reports, and moderators act on them with flags.
/// Every sensitive action lands in the append-only audit log.
pub mod audit;
pub mod config;
pub mod detection;
pub mod events;
pub mod flags;
pub mod permissions;
pub mod reports;

pub use audit::{
    AuditActionType, AuditActor, AuditLogEntry, AuditLogFilter, AuditLogManager, AuditLogPage, ExportFormat,
    NewAuditEntry,
};
pub use config::{AbuseDetectionConfig, DetectionConfigManager, StoredDetectionConfig};
pub use detection::{assess, AbuseAssessment, AbuseDetector, DetectionSummary};
pub use events::{AbuseDetectionMetrics, AbuseEvent, AbuseEventKind, AbuseEventStore, AbuseSubject};
pub use flags::{
    BanTokenRequest, BanTokenResponse, FlagClientRequest, FlagClientResponse, FlagFilter, FlagManager, FlagPage,
    FlagSeverity, FlagType, ModerationFlag, RestrictionStatus,
};
pub use permissions::{ModeratorPermissions, Permission, Role, RoleAssignment, RoleManager};
pub use reports::{AbusePatternType, AbuseReport, AbuseReportFilter, AbuseReportManager, AbuseReportPage, AbuseScore};
