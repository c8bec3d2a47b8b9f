//! Audit domain models

use crate::models::{role::Permission, session::Origin, user::User};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Security event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AuthEventKind {
    #[serde(rename = "auth.login.success")]
    LoginSuccess,
    #[serde(rename = "auth.login.failure")]
    LoginFailure,
    #[serde(rename = "auth.logout")]
    Logout,
    #[serde(rename = "auth.session.created")]
    SessionCreated,
    #[serde(rename = "auth.session.expired")]
    SessionExpired,
    #[serde(rename = "auth.session.revoked")]
    SessionRevoked,
    #[serde(rename = "auth.session.extended")]
    SessionExtended,
    #[serde(rename = "auth.permission.granted")]
    PermissionGranted,
    #[serde(rename = "auth.permission.denied")]
    PermissionDenied,
    #[serde(rename = "auth.password.changed")]
    PasswordChanged,
    #[serde(rename = "auth.role.assigned")]
    RoleAssigned,
    #[serde(rename = "auth.role.revoked")]
    RoleRevoked,
    #[serde(rename = "auth.account.locked")]
    AccountLocked,
    #[serde(rename = "auth.account.unlocked")]
    AccountUnlocked,
    #[serde(rename = "auth.user.created")]
    UserCreated,
    #[serde(rename = "auth.user.updated")]
    UserUpdated,
    #[serde(rename = "auth.token.issued")]
    TokenIssued,
    #[serde(rename = "auth.token.revoked")]
    TokenRevoked,
    #[serde(rename = "auth.key.rotated")]
    KeyRotated,
    #[serde(rename = "audit.integrity.verified")]
    IntegrityVerified,
    #[serde(rename = "audit.compliance.probe")]
    ComplianceProbe,
}

impl AuthEventKind {
    pub const ALL: [AuthEventKind; 21] = [
        AuthEventKind::LoginSuccess,
        AuthEventKind::LoginFailure,
        AuthEventKind::Logout,
        AuthEventKind::SessionCreated,
        AuthEventKind::SessionExpired,
        AuthEventKind::SessionRevoked,
        AuthEventKind::SessionExtended,
        AuthEventKind::PermissionGranted,
        AuthEventKind::PermissionDenied,
        AuthEventKind::PasswordChanged,
        AuthEventKind::RoleAssigned,
        AuthEventKind::RoleRevoked,
        AuthEventKind::AccountLocked,
        AuthEventKind::AccountUnlocked,
        AuthEventKind::UserCreated,
        AuthEventKind::UserUpdated,
        AuthEventKind::TokenIssued,
        AuthEventKind::TokenRevoked,
        AuthEventKind::KeyRotated,
        AuthEventKind::IntegrityVerified,
        AuthEventKind::ComplianceProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthEventKind::LoginSuccess => "auth.login.success",
            AuthEventKind::LoginFailure => "auth.login.failure",
            AuthEventKind::Logout => "auth.logout",
            AuthEventKind::SessionCreated => "auth.session.created",
            AuthEventKind::SessionExpired => "auth.session.expired",
            AuthEventKind::SessionRevoked => "auth.session.revoked",
            AuthEventKind::SessionExtended => "auth.session.extended",
            AuthEventKind::PermissionGranted => "auth.permission.granted",
            AuthEventKind::PermissionDenied => "auth.permission.denied",
            AuthEventKind::PasswordChanged => "auth.password.changed",
            AuthEventKind::RoleAssigned => "auth.role.assigned",
            AuthEventKind::RoleRevoked => "auth.role.revoked",
            AuthEventKind::AccountLocked => "auth.account.locked",
            AuthEventKind::AccountUnlocked => "auth.account.unlocked",
            AuthEventKind::UserCreated => "auth.user.created",
            AuthEventKind::UserUpdated => "auth.user.updated",
            AuthEventKind::TokenIssued => "auth.token.issued",
            AuthEventKind::TokenRevoked => "auth.token.revoked",
            AuthEventKind::KeyRotated => "auth.key.rotated",
            AuthEventKind::IntegrityVerified => "audit.integrity.verified",
            AuthEventKind::ComplianceProbe => "audit.compliance.probe",
        }
    }
}

static SECRET_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i)(password|passwd|pwd|secret)\s*[=:]\s*[^\s,;]+").unwrap(),
            "$1=***",
        ),
        (
            Regex::new(r"(?i)(token|access[_-]?token|refresh[_-]?token)\s*[=:]\s*[^\s,;]+").unwrap(),
            "$1=***",
        ),
        (Regex::new(r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+").unwrap(), "***"),
    ]
});

/// Mask credential material before it becomes part of the permanent record
pub fn redact(message: &str) -> String {
    SECRET_PATTERNS
        .iter()
        .fold(message.to_string(), |acc, (re, rep)| re.replace_all(&acc, *rep).into_owned())
}

/// Immutable security event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthEvent {
    pub event_id: Uuid,
    pub kind: AuthEventKind,
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub session_id: Option<Uuid>,
    pub origin_ip: Option<String>,
    pub user_agent: Option<String>,
    pub resource: Option<String>,
    pub permission: Option<String>,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl AuthEvent {
    pub fn new(kind: AuthEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            kind,
            user_id: None,
            username: None,
            session_id: None,
            origin_ip: None,
            user_agent: None,
            resource: None,
            permission: None,
            success: true,
            error_message: None,
            // 存储精度为微秒，写入前截断以保证摘要可复算
            timestamp: timestamp.trunc_subsecs(6),
            trace_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn user(mut self, user: &User) -> Self {
        self.user_id = Some(user.id);
        self.username = Some(user.username.clone());
        self
    }

    pub fn user_id(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn username(mut self, username: &str) -> Self {
        self.username = Some(username.to_string());
        self
    }

    pub fn session(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn origin(mut self, origin: &Origin) -> Self {
        self.origin_ip = Some(origin.ip.clone());
        self.user_agent = origin.user_agent.clone();
        self
    }

    pub fn resource(mut self, resource: Option<&str>) -> Self {
        self.resource = resource.map(|s| s.to_string());
        self
    }

    pub fn permission(mut self, permission: Permission) -> Self {
        self.permission = Some(permission.as_str().to_string());
        self
    }

    pub fn failed(mut self, message: &str) -> Self {
        self.success = false;
        self.error_message = Some(redact(message));
        self
    }

    pub fn trace(mut self, trace_id: Option<&str>) -> Self {
        self.trace_id = trace_id.map(|s| s.to_string());
        self
    }

    pub fn meta(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Digest input, encoding version 1.
///
/// Field order is lexicographic and must never change: every stored digest
/// was computed over exactly this layout.
#[derive(Serialize)]
struct CanonicalEventV1<'a> {
    error_message: &'a Option<String>,
    event_id: String,
    kind: &'static str,
    metadata: &'a BTreeMap<String, serde_json::Value>,
    origin_ip: &'a Option<String>,
    permission: &'a Option<String>,
    resource: &'a Option<String>,
    session_id: Option<String>,
    success: bool,
    timestamp: String,
    trace_id: &'a Option<String>,
    user_agent: &'a Option<String>,
    user_id: Option<String>,
    username: &'a Option<String>,
}

pub const CANONICAL_ENCODING_VERSION: u32 = 1;

/// Canonical byte encoding of an event for chain hashing
pub fn canonical_encode(event: &AuthEvent) -> Vec<u8> {
    let canonical = CanonicalEventV1 {
        error_message: &event.error_message,
        event_id: event.event_id.hyphenated().to_string(),
        kind: event.kind.as_str(),
        metadata: &event.metadata,
        origin_ip: &event.origin_ip,
        permission: &event.permission,
        resource: &event.resource,
        session_id: event.session_id.map(|id| id.hyphenated().to_string()),
        success: event.success,
        timestamp: event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
        trace_id: &event.trace_id,
        user_agent: &event.user_agent,
        user_id: event.user_id.map(|id| id.hyphenated().to_string()),
        username: &event.username,
    };
    // 仅包含字符串、布尔与 JSON 值，序列化不会失败
    serde_json::to_vec(&canonical).unwrap_or_default()
}

/// Persisted chain entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub event: AuthEvent,
    pub previous_digest: String,
    pub digest: String,
}

/// Audit search filters
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<Uuid>,
    pub kind: Option<AuthEventKind>,
    pub origin_ip: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    pub success: Option<bool>,
    pub limit: Option<usize>,
}

impl AuditFilter {
    pub fn matches(&self, event: &AuthEvent) -> bool {
        self.user_id.map_or(true, |id| event.user_id == Some(id))
            && self.kind.map_or(true, |k| event.kind == k)
            && self
                .origin_ip
                .as_deref()
                .map_or(true, |ip| event.origin_ip.as_deref() == Some(ip))
            && self.start_time.map_or(true, |t| event.timestamp >= t)
            && self.end_time.map_or(true, |t| event.timestamp <= t)
            && self
                .trace_id
                .as_deref()
                .map_or(true, |t| event.trace_id.as_deref() == Some(t))
            && self.success.map_or(true, |s| event.success == s)
    }
}

/// Kind of chain disagreement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    DigestMismatch,
    MissingRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityViolation {
    pub sequence: u64,
    pub kind: ViolationKind,
    pub event_id: Option<Uuid>,
    pub expected_digest: String,
    pub actual_digest: Option<String>,
}

/// Result of a chain verification run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub id: Uuid,
    pub from_sequence: u64,
    pub to_sequence: u64,
    pub passed: bool,
    pub events_verified: u64,
    pub violations: Vec<IntegrityViolation>,
    pub verified_at: DateTime<Utc>,
}

impl IntegrityReport {
    pub fn violated_sequences(&self) -> Vec<u64> {
        self.violations.iter().map(|v| v.sequence).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> AuthEvent {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        AuthEvent::new(AuthEventKind::LoginFailure, ts)
            .username("alice")
            .origin(&Origin::new("10.1.1.1", Some("curl")))
            .meta("zeta", 1)
            .meta("alpha", "x")
            .failed("Invalid password")
    }

    #[test]
    fn test_canonical_encoding_is_field_sorted() {
        let encoded = String::from_utf8(canonical_encode(&sample())).unwrap();
        let error_pos = encoded.find("\"error_message\"").unwrap();
        let username_pos = encoded.find("\"username\"").unwrap();
        assert!(error_pos < username_pos);
        assert!(encoded.find("\"alpha\"").unwrap() < encoded.find("\"zeta\"").unwrap());
        assert!(encoded.contains("\"timestamp\":\"2024-03-01T12:00:00.000000Z\""));
        assert!(encoded.contains("\"kind\":\"auth.login.failure\""));
    }

    #[test]
    fn test_canonical_encoding_stable_across_serde_round_trip() {
        let event = sample();
        let json = serde_json::to_string(&event).unwrap();
        let back: AuthEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(canonical_encode(&event), canonical_encode(&back));
    }

    #[test]
    fn test_redact_masks_credentials() {
        let masked = redact("login failed password=Hunter2! token: abc.def");
        assert!(!masked.contains("Hunter2"));
        assert!(!masked.contains("abc.def"));
        assert!(masked.contains("password=***"));
        assert_eq!(redact("Password expired"), "Password expired");
    }

    #[test]
    fn test_filter_matches() {
        let event = sample();
        let filter = AuditFilter {
            kind: Some(AuthEventKind::LoginFailure),
            origin_ip: Some("10.1.1.1".to_string()),
            success: Some(false),
            ..Default::default()
        };
        assert!(filter.matches(&event));

        let other = AuditFilter {
            origin_ip: Some("10.9.9.9".to_string()),
            ..Default::default()
        };
        assert!(!other.matches(&event));
    }

    #[test]
    fn test_event_kind_serde_matches_as_str() {
        for kind in AuthEventKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }
}
