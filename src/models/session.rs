//! 会话领域模型

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Expired,
    Revoked,
    Locked,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Expired => "expired",
            SessionStatus::Revoked => "revoked",
            SessionStatus::Locked => "locked",
        }
    }
}

/// 请求来源
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Origin {
    pub ip: String,
    pub user_agent: Option<String>,
}

impl Origin {
    pub fn new(ip: &str, user_agent: Option<&str>) -> Self {
        Self {
            ip: ip.to_string(),
            user_agent: user_agent.map(|s| s.to_string()),
        }
    }

    /// 内部发起的操作（后台任务、管理动作）
    pub fn internal() -> Self {
        Self::new("127.0.0.1", Some("sentinel-core"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    pub csrf_token: String,
    pub origin: Origin,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// 空闲超时（秒）
    pub activity_timeout_secs: i64,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl Session {
    /// 会话当前是否有效：状态为 Active，未过绝对期限，也未空闲超时
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && now < self.expires_at && now < self.idle_deadline()
    }

    /// 状态仍为 Active 但时间上已失效
    pub fn is_lapsed(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active && !self.is_active(now)
    }

    pub fn idle_deadline(&self) -> DateTime<Utc> {
        self.last_activity + Duration::seconds(self.activity_timeout_secs)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_activity = now;
    }

    pub fn revocation_reason(&self) -> Option<&str> {
        self.metadata.get("revocation_reason").and_then(|v| v.as_str())
    }
}
