//! 数据模型模块
//! 用户、角色权限、会话、审计事件、令牌与安全事件

pub mod audit;
pub mod incident;
pub mod role;
pub mod session;
pub mod token;
pub mod user;

pub use audit::{AuditFilter, AuditRecord, AuthEvent, AuthEventKind, IntegrityReport};
pub use incident::{IncidentKind, IncidentStatus, SecurityIncident, Severity};
pub use role::{Permission, Role};
pub use session::{Origin, Session, SessionStatus};
pub use token::{IssuedToken, StoredSigningKey, TokenType};
pub use user::{CreateUserRequest, UpdateUserRequest, User, UserResponse};
