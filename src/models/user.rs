//! User domain models

use crate::models::role::{Permission, Role};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;
use validator::Validate;

static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Previously used credential, kept to refuse reuse on password change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordHistoryEntry {
    pub password_hash: String,
    pub salt: String,
    pub changed_at: DateTime<Utc>,
}

/// User account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,

    // Credential (hash and salt are stored separately, hex encoded)
    pub password_hash: String,
    pub salt: String,
    #[serde(default)]
    pub password_history: Vec<PasswordHistoryEntry>,

    pub roles: BTreeSet<Role>,

    // Account state
    pub is_active: bool,
    pub is_locked: bool,
    pub failed_login_attempts: u32,
    pub last_login: Option<DateTime<Utc>>,
    pub last_password_change: DateTime<Utc>,
    pub password_expires_at: DateTime<Utc>,
    pub must_change_password: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl User {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.roles.iter().any(|r| r.grants(permission))
    }

    /// Union of all permissions granted through the role set
    pub fn permissions(&self) -> BTreeSet<Permission> {
        self.roles
            .iter()
            .flat_map(|r| r.permissions().iter().copied())
            .collect()
    }

    pub fn highest_role_level(&self) -> u8 {
        self.roles.iter().map(Role::level).max().unwrap_or(0)
    }

    pub fn is_password_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.password_expires_at
    }

    /// Non-blocking consistency findings (logged as warnings)
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.roles.is_empty() {
            warnings.push("user has no assigned roles".to_string());
        }
        warnings
    }
}

/// Public view without credential material
#[derive(Debug, Clone, Serialize)]
pub struct UserResponse {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub is_active: bool,
    pub is_locked: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub must_change_password: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&User> for UserResponse {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: user.roles.iter().map(|r| r.as_str().to_string()).collect(),
            is_active: user.is_active,
            is_locked: user.is_locked,
            last_login: user.last_login,
            must_change_password: user.must_change_password,
            created_at: user.created_at,
        }
    }
}

/// Create user request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateUserRequest {
    #[validate(
        length(min = 3, max = 64, message = "Username must be 3-64 characters long"),
        regex(path = *USERNAME_RE, message = "Username may only contain letters, digits, '.', '_' and '-'")
    )]
    pub username: String,

    #[validate(email(message = "Valid email address is required"))]
    pub email: String,

    pub password: String,

    #[validate(length(min = 1, message = "At least one role is required"))]
    pub roles: Vec<Role>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CreateUserRequest {
    pub fn new(username: &str, email: &str, password: &str, roles: &[Role]) -> Self {
        Self {
            username: username.to_string(),
            email: email.to_string(),
            password: password.to_string(),
            roles: roles.to_vec(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Update user request (email, activation flag, metadata)
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateUserRequest {
    #[validate(email(message = "Valid email address is required"))]
    pub email: Option<String>,
    pub is_active: Option<bool>,
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}
