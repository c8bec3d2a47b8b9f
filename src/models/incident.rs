//! 安全事件（Incident）模型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 严重程度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    BruteForce,
    PermissionFlooding,
    OriginHyperactivity,
    MultiOriginLogin,
}

impl IncidentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::BruteForce => "brute_force",
            IncidentKind::PermissionFlooding => "permission_flooding",
            IncidentKind::OriginHyperactivity => "origin_hyperactivity",
            IncidentKind::MultiOriginLogin => "multi_origin_login",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolved,
    FalsePositive,
}

impl IncidentStatus {
    /// 已结案状态
    pub fn is_closed(&self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::FalsePositive)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub id: Uuid,
    pub kind: IncidentKind,
    pub severity: Severity,
    pub user_id: Option<Uuid>,
    pub origin_ip: Option<String>,
    pub description: String,
    /// 结构化证据（触发事件、计数、时间窗口）
    pub evidence: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub status: IncidentStatus,
    pub assigned_to: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
}
