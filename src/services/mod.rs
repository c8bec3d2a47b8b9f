//! Business logic services layer

pub mod audit_service;
pub mod auth_service;
pub mod compliance;
pub mod credential_service;
pub mod permission_service;
pub mod security_monitor;
pub mod session_service;
pub mod user_admin_service;

pub use audit_service::{AuditObserver, AuditService};
pub use auth_service::{AuthService, LoginResponse};
pub use compliance::{ComplianceAuditor, ComplianceReport, ControlReport, ControlStatus, ReportKind};
pub use credential_service::CredentialService;
pub use permission_service::{Decision, PermissionContext, PermissionService};
pub use security_monitor::SecurityMonitor;
pub use session_service::SessionService;
pub use user_admin_service::UserAdminService;
