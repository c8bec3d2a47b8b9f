//! RS256 token issuance, validation, revocation and key rotation
//!
//! Access tokens carry a snapshot of roles and permissions taken at issuance;
//! the snapshot is intentionally stale and revocation is the way to force
//! re-evaluation. Expiry is checked against the injected clock rather than
//! the library's wall clock.

use crate::{
    auth::keys::{Jwks, KeyRing, SigningKey, SIGNING_ALGORITHM},
    clock::SharedClock,
    config::TokenConfig,
    error::{AppError, Result},
    models::{AuthEvent, AuthEventKind, IssuedToken, Origin, TokenType, User},
    repository::SharedStore,
    services::audit_service::AuditService,
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jsonwebtoken::{decode, decode_header, encode, errors::ErrorKind, Algorithm, Header, Validation};
use parking_lot::{Mutex, RwLock};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// JWT claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Claims {
    /// Issuer
    pub iss: String,

    /// Audience
    pub aud: String,

    /// Subject (user ID)
    pub sub: String,

    /// Expiration
    pub exp: i64,

    /// Issued at
    pub iat: i64,

    /// JWT ID (unique token identifier)
    pub jti: String,

    pub username: String,
    pub email: String,

    /// Token type (access or refresh)
    pub token_type: TokenType,

    /// Role snapshot at issuance (empty for refresh tokens)
    #[serde(default)]
    pub roles: Vec<String>,

    /// Permission snapshot at issuance (empty for refresh tokens)
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl Claims {
    pub fn user_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }

    pub fn token_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.jti).ok()
    }
}

/// Token pair response
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Seconds until the access token expires
    pub expires_in: i64,
}

/// Why a token was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Malformed,
    UnknownKey,
    BadSignature,
    WrongIssuer,
    WrongAudience,
    Expired,
    NotYetValid,
    WrongType,
    Revoked,
    Untracked,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvalidReason::Malformed => "malformed",
            InvalidReason::UnknownKey => "unknown_key",
            InvalidReason::BadSignature => "bad_signature",
            InvalidReason::WrongIssuer => "wrong_issuer",
            InvalidReason::WrongAudience => "wrong_audience",
            InvalidReason::Expired => "expired",
            InvalidReason::NotYetValid => "not_yet_valid",
            InvalidReason::WrongType => "wrong_type",
            InvalidReason::Revoked => "revoked",
            InvalidReason::Untracked => "untracked",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validation outcome; ordinary bad input is never an error
#[derive(Debug, Clone, PartialEq)]
pub enum TokenVerdict {
    Valid(Claims),
    Invalid(InvalidReason),
}

impl TokenVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, TokenVerdict::Valid(_))
    }

    pub fn claims(self) -> Option<Claims> {
        match self {
            TokenVerdict::Valid(claims) => Some(claims),
            TokenVerdict::Invalid(_) => None,
        }
    }

    pub fn reason(&self) -> Option<InvalidReason> {
        match self {
            TokenVerdict::Valid(_) => None,
            TokenVerdict::Invalid(reason) => Some(*reason),
        }
    }
}

/// JWT service
pub struct JwtService {
    config: TokenConfig,
    store: SharedStore,
    audit: Arc<AuditService>,
    clock: SharedClock,
    keys: RwLock<KeyRing>,
    // 撤销缓存：jti -> 令牌过期时间；存储层才是权威来源
    revoked: DashMap<Uuid, DateTime<Utc>>,
    rotation: Mutex<()>,
}

impl JwtService {
    /// Load the key ring from the store; bootstrap or generate a signer when empty
    pub fn new(config: &TokenConfig, store: SharedStore, audit: Arc<AuditService>) -> Result<Self> {
        let clock = audit.clock().clone();
        let now = clock.now();

        let stored = store.list_signing_keys()?;
        let keys = stored
            .iter()
            .map(SigningKey::from_stored)
            .collect::<Result<Vec<_>>>()?;

        let service = Self {
            config: config.clone(),
            store,
            audit,
            clock,
            keys: RwLock::new(KeyRing::from_keys(keys)),
            revoked: DashMap::new(),
            rotation: Mutex::new(()),
        };

        for token in service.store.list_issued_tokens()? {
            if token.revoked && token.expires_at > now {
                service.revoked.insert(token.jti, token.expires_at);
            }
        }

        let has_signer = service.keys.read().active().is_some();
        if !has_signer {
            match &config.bootstrap_private_key {
                Some(pem) => {
                    let key = SigningKey::from_pem(
                        &crate::auth::keys::generate_kid(),
                        pem.expose_secret(),
                        now,
                    )?;
                    tracing::info!(kid = %key.kid, "Imported bootstrap signing key");
                    service.install(key, "bootstrap")?;
                }
                None => {
                    service.rotate_keys()?;
                }
            }
        }

        Ok(service)
    }

    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Generate access token
    pub fn issue_access_token(&self, user: &User) -> Result<String> {
        self.issue(user, TokenType::Access)
    }

    /// Generate refresh token
    pub fn issue_refresh_token(&self, user: &User) -> Result<String> {
        self.issue(user, TokenType::Refresh)
    }

    /// Generate token pair
    pub fn issue_token_pair(&self, user: &User) -> Result<TokenPair> {
        let access_token = self.issue_access_token(user)?;
        let refresh_token = self.issue_refresh_token(user)?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.config.access_token_exp_secs,
        })
    }

    fn issue(&self, user: &User, token_type: TokenType) -> Result<String> {
        let now = self.clock.now();
        let lifetime = match token_type {
            TokenType::Access => self.config.access_token_exp_secs,
            TokenType::Refresh => self.config.refresh_token_exp_secs,
        };
        let expires_at = now + Duration::seconds(lifetime);
        let jti = Uuid::new_v4();

        let (roles, permissions) = match token_type {
            TokenType::Access => (
                user.roles.iter().map(|r| r.as_str().to_string()).collect(),
                user.permissions().iter().map(|p| p.as_str().to_string()).collect(),
            ),
            TokenType::Refresh => (Vec::new(), Vec::new()),
        };

        let claims = Claims {
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
            sub: user.id.to_string(),
            exp: expires_at.timestamp(),
            iat: now.timestamp(),
            jti: jti.to_string(),
            username: user.username.clone(),
            email: user.email.clone(),
            token_type,
            roles,
            permissions,
        };

        let (token, kid) = {
            let ring = self.keys.read();
            let signer = ring
                .active()
                .ok_or_else(|| AppError::Internal("no active signing key".to_string()))?;
            let mut header = Header::new(Algorithm::RS256);
            header.kid = Some(signer.kid.clone());

            let token = encode(&header, &claims, signer.encoding_key()).map_err(|e| {
                tracing::error!("Failed to encode {} token: {:?}", token_type, e);
                AppError::Internal(format!("Failed to encode {} token: {}", token_type, e))
            })?;
            (token, signer.kid.clone())
        };

        self.store.save_issued_token(&IssuedToken {
            jti,
            token_type,
            user_id: user.id,
            kid: kid.clone(),
            issued_at: now,
            expires_at,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        })?;

        self.audit.record(
            AuthEvent::new(AuthEventKind::TokenIssued, now)
                .user(user)
                .origin(&Origin::internal())
                .meta("jti", jti.to_string())
                .meta("token_type", token_type.as_str())
                .meta("kid", kid),
        )?;

        metrics::counter!("sentinel_tokens_issued_total", "type" => token_type.as_str())
            .increment(1);

        Ok(token)
    }

    /// Validate a token, optionally requiring a type.
    ///
    /// Only a store failure while checking revocation surfaces as `Err`.
    pub fn validate(&self, token: &str, expected: Option<TokenType>) -> Result<TokenVerdict> {
        let verdict = self.check(token, expected)?;
        let outcome = match &verdict {
            TokenVerdict::Valid(_) => "valid",
            TokenVerdict::Invalid(reason) => {
                tracing::debug!(reason = reason.as_str(), "Token validation failed");
                reason.as_str()
            }
        };
        metrics::counter!("sentinel_token_validations_total", "outcome" => outcome).increment(1);
        Ok(verdict)
    }

    fn check(&self, token: &str, expected: Option<TokenType>) -> Result<TokenVerdict> {
        use TokenVerdict::Invalid;

        let header = match decode_header(token) {
            Ok(header) => header,
            Err(_) => return Ok(Invalid(InvalidReason::Malformed)),
        };
        if header.alg != Algorithm::RS256 {
            return Ok(Invalid(InvalidReason::Malformed));
        }
        let Some(kid) = header.kid else {
            return Ok(Invalid(InvalidReason::UnknownKey));
        };

        let now = self.clock.now();

        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_audience(&[self.config.audience.as_str()]);

        let decoded = {
            let ring = self.keys.read();
            let Some(verifier) = ring.verifier(&kid, now) else {
                return Ok(Invalid(InvalidReason::UnknownKey));
            };
            decode::<Claims>(token, verifier.decoding_key(), &validation)
        };

        let claims = match decoded {
            Ok(data) => data.claims,
            Err(e) => {
                let reason = match e.kind() {
                    ErrorKind::InvalidSignature => InvalidReason::BadSignature,
                    ErrorKind::InvalidIssuer => InvalidReason::WrongIssuer,
                    ErrorKind::InvalidAudience => InvalidReason::WrongAudience,
                    _ => InvalidReason::Malformed,
                };
                return Ok(Invalid(reason));
            }
        };

        let skew = self.config.clock_skew_secs;
        if now.timestamp() > claims.exp + skew {
            return Ok(Invalid(InvalidReason::Expired));
        }
        if claims.iat > now.timestamp() + skew {
            return Ok(Invalid(InvalidReason::NotYetValid));
        }
        if expected.is_some_and(|t| t != claims.token_type) {
            return Ok(Invalid(InvalidReason::WrongType));
        }

        let Some(jti) = claims.token_id() else {
            return Ok(Invalid(InvalidReason::Malformed));
        };
        if self.revoked.contains_key(&jti) {
            return Ok(Invalid(InvalidReason::Revoked));
        }
        match self.store.get_issued_token(jti)? {
            Some(record) if record.revoked => {
                self.revoked.insert(jti, record.expires_at);
                return Ok(Invalid(InvalidReason::Revoked));
            }
            Some(_) => {}
            None => return Ok(Invalid(InvalidReason::Untracked)),
        }

        Ok(TokenVerdict::Valid(claims))
    }

    /// Revoke one token id; returns false when it was already revoked or unknown
    pub fn revoke(&self, jti: Uuid, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        let Some(mut record) = self.store.get_issued_token(jti)? else {
            tracing::debug!(%jti, "Revocation requested for untracked token");
            return Ok(false);
        };
        if record.revoked {
            self.revoked.insert(jti, record.expires_at);
            return Ok(false);
        }

        self.mark_revoked(&mut record, reason, now)?;

        self.audit.record(
            AuthEvent::new(AuthEventKind::TokenRevoked, now)
                .user_id(record.user_id)
                .origin(&Origin::internal())
                .meta("jti", jti.to_string())
                .meta("token_type", record.token_type.as_str())
                .meta("reason", reason),
        )?;

        Ok(true)
    }

    /// Revoke every live token of a user, optionally only one type
    pub fn revoke_all_for_user(&self, user_id: Uuid, token_type: Option<TokenType>) -> Result<usize> {
        let now = self.clock.now();
        let reason = "revoke_all_for_user";
        let mut revoked = 0usize;

        for mut record in self.store.list_issued_tokens()? {
            if record.user_id != user_id
                || record.revoked
                || token_type.is_some_and(|t| t != record.token_type)
            {
                continue;
            }
            self.mark_revoked(&mut record, reason, now)?;
            revoked += 1;
        }

        if revoked > 0 {
            self.audit.record(
                AuthEvent::new(AuthEventKind::TokenRevoked, now)
                    .user_id(user_id)
                    .origin(&Origin::internal())
                    .meta("count", revoked as u64)
                    .meta("token_type", token_type.map(|t| t.as_str()).unwrap_or("all"))
                    .meta("reason", reason),
            )?;
            tracing::info!(%user_id, revoked, "Revoked user tokens");
        }

        Ok(revoked)
    }

    fn mark_revoked(&self, record: &mut IssuedToken, reason: &str, now: DateTime<Utc>) -> Result<()> {
        record.revoked = true;
        record.revoked_at = Some(now);
        record.revocation_reason = Some(reason.to_string());
        self.store.save_issued_token(record)?;
        self.revoked.insert(record.jti, record.expires_at);
        metrics::counter!("sentinel_tokens_revoked_total").increment(1);
        Ok(())
    }

    /// Generate a new signer and demote the previous one to verify-only.
    /// Returns the new key id.
    pub fn rotate_keys(&self) -> Result<String> {
        let _rotation = self.rotation.lock();

        // RSA 生成耗时较长，在持有密钥环锁之前完成
        let key = SigningKey::generate(self.config.rsa_key_bits, self.clock.now())?;
        self.install(key, "rotation")
    }

    /// Rotate when the signer is older than the rotation interval
    pub fn rotate_if_due(&self) -> Result<Option<String>> {
        let now = self.clock.now();
        let due = match self.keys.read().active() {
            Some(signer) => {
                now - signer.created_at >= Duration::seconds(self.config.key_rotation_interval_secs)
            }
            None => true,
        };
        if due {
            self.rotate_keys().map(Some)
        } else {
            Ok(None)
        }
    }

    fn install(&self, key: SigningKey, trigger: &str) -> Result<String> {
        let now = self.clock.now();
        let grace_until = now + Duration::seconds(self.config.key_grace_secs);
        let kid = key.kid.clone();

        let (demoted, purged) = {
            let mut ring = self.keys.write();
            let demoted = ring.promote(key, grace_until);
            let purged = ring.purge_expired(now);

            for k in ring.keys() {
                if k.kid == kid || demoted.contains(&k.kid) {
                    self.store.save_signing_key(&k.to_stored())?;
                }
            }
            for old in &purged {
                self.store.delete_signing_key(old)?;
            }
            (demoted, purged)
        };

        self.audit.record(
            AuthEvent::new(AuthEventKind::KeyRotated, now)
                .origin(&Origin::internal())
                .meta("kid", kid.as_str())
                .meta("algorithm", SIGNING_ALGORITHM)
                .meta("trigger", trigger)
                .meta("demoted", demoted.clone())
                .meta("purged", purged.clone()),
        )?;

        metrics::counter!("sentinel_key_rotations_total").increment(1);
        tracing::info!(
            kid = %kid,
            demoted = ?demoted,
            purged = ?purged,
            trigger,
            "Signing key installed"
        );

        Ok(kid)
    }

    /// Key id of the current signer
    pub fn active_kid(&self) -> Option<String> {
        self.keys.read().active().map(|k| k.kid.clone())
    }

    /// Public key-set document
    pub fn jwks(&self) -> Jwks {
        self.keys.read().jwks(self.clock.now())
    }

    /// Drop expired issued-token records, their cache entries and retired keys
    pub fn cleanup_expired_tokens(&self) -> Result<usize> {
        let now = self.clock.now();
        let removed = self.store.delete_expired_tokens(now)?;
        self.revoked.retain(|_, expires_at| *expires_at > now);

        let purged = {
            let mut ring = self.keys.write();
            let purged = ring.purge_expired(now);
            for kid in &purged {
                self.store.delete_signing_key(kid)?;
            }
            purged
        };

        if !removed.is_empty() || !purged.is_empty() {
            tracing::info!(
                tokens = removed.len(),
                keys = purged.len(),
                "Expired token records cleaned up"
            );
        }

        Ok(removed.len())
    }
}
