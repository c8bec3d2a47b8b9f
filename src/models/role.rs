//! Role and permission domain models
//!
//! The role set is closed and the role → permission table is static; it is
//! consulted at evaluation time and never copied onto user records.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Administrator,
    Operator,
    Viewer,
    Auditor,
}

impl Role {
    pub const ALL: [Role; 4] = [Role::Administrator, Role::Operator, Role::Viewer, Role::Auditor];

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Auditor => "auditor",
        }
    }

    /// Rank used for "at least role X" checks
    pub fn level(&self) -> u8 {
        match self {
            Role::Viewer => 1,
            Role::Auditor => 2,
            Role::Operator => 3,
            Role::Administrator => 4,
        }
    }

    /// Permissions granted by this role
    pub fn permissions(&self) -> &'static [Permission] {
        use Permission::*;
        match self {
            Role::Administrator => &Permission::ALL,
            Role::Operator => &[
                DirectoryCreate,
                DirectoryRead,
                DirectoryUpdate,
                DirectoryGenerate,
                WorkflowCreate,
                WorkflowRead,
                WorkflowUpdate,
                WorkflowExecute,
                AiGenerateContent,
                AiAnalyzeData,
                FileUpload,
                FileDownload,
                TemplateRead,
                TemplateUpdate,
            ],
            Role::Viewer => &[DirectoryRead, WorkflowRead, FileDownload, TemplateRead],
            Role::Auditor => &[
                DirectoryRead,
                WorkflowRead,
                AuditRead,
                FileDownload,
                TemplateRead,
            ],
        }
    }

    pub fn grants(&self, permission: Permission) -> bool {
        self.permissions().contains(&permission)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "administrator" | "admin" => Ok(Role::Administrator),
            "operator" => Ok(Role::Operator),
            "viewer" => Ok(Role::Viewer),
            "auditor" => Ok(Role::Auditor),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Permission (`resource:action`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Permission {
    DirectoryCreate,
    DirectoryRead,
    DirectoryUpdate,
    DirectoryDelete,
    DirectoryGenerate,
    WorkflowCreate,
    WorkflowRead,
    WorkflowUpdate,
    WorkflowDelete,
    WorkflowExecute,
    AiGenerateContent,
    AiAnalyzeData,
    AiOptimizeWorkflow,
    UserManage,
    RoleManage,
    SystemConfig,
    AuditRead,
    SecurityManage,
    FileUpload,
    FileDownload,
    FileDelete,
    TemplateCreate,
    TemplateRead,
    TemplateUpdate,
    TemplateDelete,
}

impl Permission {
    pub const ALL: [Permission; 25] = [
        Permission::DirectoryCreate,
        Permission::DirectoryRead,
        Permission::DirectoryUpdate,
        Permission::DirectoryDelete,
        Permission::DirectoryGenerate,
        Permission::WorkflowCreate,
        Permission::WorkflowRead,
        Permission::WorkflowUpdate,
        Permission::WorkflowDelete,
        Permission::WorkflowExecute,
        Permission::AiGenerateContent,
        Permission::AiAnalyzeData,
        Permission::AiOptimizeWorkflow,
        Permission::UserManage,
        Permission::RoleManage,
        Permission::SystemConfig,
        Permission::AuditRead,
        Permission::SecurityManage,
        Permission::FileUpload,
        Permission::FileDownload,
        Permission::FileDelete,
        Permission::TemplateCreate,
        Permission::TemplateRead,
        Permission::TemplateUpdate,
        Permission::TemplateDelete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::DirectoryCreate => "directory:create",
            Permission::DirectoryRead => "directory:read",
            Permission::DirectoryUpdate => "directory:update",
            Permission::DirectoryDelete => "directory:delete",
            Permission::DirectoryGenerate => "directory:generate",
            Permission::WorkflowCreate => "workflow:create",
            Permission::WorkflowRead => "workflow:read",
            Permission::WorkflowUpdate => "workflow:update",
            Permission::WorkflowDelete => "workflow:delete",
            Permission::WorkflowExecute => "workflow:execute",
            Permission::AiGenerateContent => "ai:generate_content",
            Permission::AiAnalyzeData => "ai:analyze_data",
            Permission::AiOptimizeWorkflow => "ai:optimize_workflow",
            Permission::UserManage => "user:manage",
            Permission::RoleManage => "role:manage",
            Permission::SystemConfig => "system:config",
            Permission::AuditRead => "audit:read",
            Permission::SecurityManage => "security:manage",
            Permission::FileUpload => "file:upload",
            Permission::FileDownload => "file:download",
            Permission::FileDelete => "file:delete",
            Permission::TemplateCreate => "template:create",
            Permission::TemplateRead => "template:read",
            Permission::TemplateUpdate => "template:update",
            Permission::TemplateDelete => "template:delete",
        }
    }

    /// Resource half of `resource:action`
    pub fn resource(&self) -> &'static str {
        self.as_str().split(':').next().unwrap_or_default()
    }

    /// Action half of `resource:action`
    pub fn action(&self) -> &'static str {
        self.as_str().split(':').nth(1).unwrap_or_default()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Permission::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown permission: {}", s))
    }
}

impl From<Permission> for String {
    fn from(p: Permission) -> Self {
        p.as_str().to_string()
    }
}

impl TryFrom<String> for Permission {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_administrator_has_every_permission() {
        for permission in Permission::ALL {
            assert!(Role::Administrator.grants(permission), "{}", permission);
        }
    }

    #[test]
    fn test_viewer_is_read_only() {
        assert!(Role::Viewer.grants(Permission::TemplateRead));
        assert!(!Role::Viewer.grants(Permission::TemplateUpdate));
        assert!(!Role::Viewer.grants(Permission::AuditRead));
        assert!(Role::Viewer
            .permissions()
            .iter()
            .all(|p| matches!(p.action(), "read" | "download")));
    }

    #[test]
    fn test_permission_string_round_trip() {
        for permission in Permission::ALL {
            assert_eq!(permission.as_str().parse::<Permission>(), Ok(permission));
        }
        assert!("template:explode".parse::<Permission>().is_err());
        assert_eq!(Permission::AiAnalyzeData.resource(), "ai");
        assert_eq!(Permission::AiAnalyzeData.action(), "analyze_data");
    }

    #[test]
    fn test_role_parsing_and_levels() {
        assert_eq!("Admin".parse::<Role>(), Ok(Role::Administrator));
        assert!(Role::Operator.level() > Role::Auditor.level());
        assert!(Role::Auditor.level() > Role::Viewer.level());
        assert!("root".parse::<Role>().is_err());
    }
}
