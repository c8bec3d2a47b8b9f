//! Token and signing-key records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Token type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Issued token record, kept only for revocation lookups
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    pub jti: Uuid,
    pub token_type: TokenType,
    pub user_id: Uuid,
    pub kid: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
}

/// Signing key as handed to the store.
///
/// Protection of the private material at rest belongs to the host's secret
/// storage; in memory it is held behind `secrecy::Secret`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSigningKey {
    pub kid: String,
    pub algorithm: String,
    pub private_key_pem: String,
    pub modulus: String,
    pub exponent: String,
    pub created_at: DateTime<Utc>,
    /// Set when the key is demoted to verify-only
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}
