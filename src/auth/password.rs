//! Password hashing and verification using Argon2id
//!
//! Salts are generated per user (32 random bytes) and stored hex encoded next
//! to the hex encoded raw hash, so the work factor lives in configuration
//! rather than inside the stored string.

use crate::{
    config::SecurityConfig,
    error::{AppError, FieldError},
};
use argon2::{Algorithm, Argon2, Params, Version};
use password_hash::Output;
use rand::{rngs::OsRng, RngCore};

const SALT_LEN: usize = 32;
const HASH_LEN: usize = 32;

/// Characters that satisfy the "special character" rule
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?";

/// Password hasher with configurable parameters
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    /// Create hasher with OWASP recommended parameters (m=19MiB, t=2, p=1)
    pub fn new() -> Self {
        Self::with_params(19456, 2, 1).unwrap_or_else(|_| Self {
            argon2: Argon2::default(),
        })
    }

    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, AppError> {
        let params = Params::new(memory_kib, iterations, parallelism, Some(HASH_LEN))
            .map_err(|e| AppError::Config(format!("Invalid Argon2 params: {}", e)))?;

        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn from_config(config: &SecurityConfig) -> Result<Self, AppError> {
        Self::with_params(
            config.argon2_memory_kib,
            config.argon2_iterations,
            config.argon2_parallelism,
        )
    }

    /// Generate a fresh hex encoded salt
    pub fn generate_salt() -> String {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        hex::encode(salt)
    }

    /// Hash a password with the given hex salt, returning the hex digest
    pub fn hash(&self, password: &str, salt_hex: &str) -> Result<String, AppError> {
        Ok(hex::encode(self.derive(password, salt_hex)?))
    }

    fn derive(&self, password: &str, salt_hex: &str) -> Result<[u8; HASH_LEN], AppError> {
        let salt = hex::decode(salt_hex)
            .map_err(|e| AppError::Integrity(format!("malformed password salt: {}", e)))?;
        let mut out = [0u8; HASH_LEN];
        self.argon2
            .hash_password_into(password.as_bytes(), &salt, &mut out)
            .map_err(|e| {
                tracing::error!("Failed to hash password: {:?}", e);
                AppError::Internal(format!("Failed to hash password: {}", e))
            })?;
        Ok(out)
    }

    /// Verify a password against a stored hash in constant time.
    ///
    /// `Ok(false)` for a wrong password; `Err` only when the stored material
    /// itself is unusable.
    pub fn verify(&self, password: &str, salt_hex: &str, hash_hex: &str) -> Result<bool, AppError> {
        let stored = hex::decode(hash_hex)
            .map_err(|e| AppError::Integrity(format!("malformed password hash: {}", e)))?;
        let stored = Output::new(&stored)
            .map_err(|e| AppError::Integrity(format!("malformed password hash: {}", e)))?;
        let computed = self.derive(password, salt_hex)?;
        let computed = Output::new(&computed)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;

        // Output 的相等比较为常量时间
        Ok(stored == computed)
    }

    /// Validate password against policy; every failing rule is reported
    pub fn validate_password_policy(password: &str, policy: &SecurityConfig) -> Vec<FieldError> {
        let mut errors = Vec::new();

        if password.chars().count() < policy.password_min_length {
            errors.push(FieldError::new(
                "password",
                "password_too_short",
                format!(
                    "Password must be at least {} characters long",
                    policy.password_min_length
                ),
            ));
        }

        if policy.password_require_uppercase && !password.chars().any(|c| c.is_uppercase()) {
            errors.push(FieldError::new(
                "password",
                "password_no_uppercase",
                "Password must contain at least one uppercase letter",
            ));
        }

        if policy.password_require_lowercase && !password.chars().any(|c| c.is_lowercase()) {
            errors.push(FieldError::new(
                "password",
                "password_no_lowercase",
                "Password must contain at least one lowercase letter",
            ));
        }

        if policy.password_require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            errors.push(FieldError::new(
                "password",
                "password_no_digit",
                "Password must contain at least one digit",
            ));
        }

        if policy.password_require_special && !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
            errors.push(FieldError::new(
                "password",
                "password_no_special",
                "Password must contain at least one special character",
            ));
        }

        errors
    }
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_hasher() -> PasswordHasher {
        PasswordHasher::with_params(1024, 1, 1).unwrap()
    }

    fn policy() -> SecurityConfig {
        SecurityConfig {
            password_min_length: 8,
            password_require_uppercase: true,
            password_require_lowercase: true,
            password_require_digit: true,
            password_require_special: true,
            password_expiry_days: 90,
            password_history: 5,
            max_failed_attempts: 5,
            argon2_memory_kib: 1024,
            argon2_iterations: 1,
            argon2_parallelism: 1,
            allow_weak_kdf: true,
        }
    }

    #[test]
    fn test_hash_and_verify() {
        let hasher = fast_hasher();
        let salt = PasswordHasher::generate_salt();
        let hash = hasher.hash("TestPassword123!", &salt).unwrap();

        assert_eq!(hash.len(), HASH_LEN * 2);
        assert!(hasher.verify("TestPassword123!", &salt, &hash).unwrap());
        assert!(!hasher.verify("TestPassword123?", &salt, &hash).unwrap());
    }

    #[test]
    fn test_salt_changes_hash() {
        let hasher = fast_hasher();
        let s1 = PasswordHasher::generate_salt();
        let s2 = PasswordHasher::generate_salt();
        assert_ne!(s1, s2);
        assert_eq!(s1.len(), SALT_LEN * 2);
        assert_ne!(
            hasher.hash("TestPassword123!", &s1).unwrap(),
            hasher.hash("TestPassword123!", &s2).unwrap()
        );
    }

    #[test]
    fn test_corrupt_stored_hash_is_integrity_error() {
        let hasher = fast_hasher();
        let salt = PasswordHasher::generate_salt();
        let err = hasher.verify("whatever", &salt, "zz-not-hex").unwrap_err();
        assert!(err.is_integrity());
    }

    #[test]
    fn test_password_policy_reports_every_rule() {
        let policy = policy();
        assert!(PasswordHasher::validate_password_policy("Valid#Pass1", &policy).is_empty());

        let errors = PasswordHasher::validate_password_policy("abc", &policy);
        let codes: Vec<&str> = errors.iter().map(|e| e.code.as_str()).collect();
        assert_eq!(
            codes,
            vec![
                "password_too_short",
                "password_no_uppercase",
                "password_no_digit",
                "password_no_special"
            ]
        );
        assert!(errors.iter().all(|e| e.field == "password"));
    }

    #[test]
    fn test_special_character_set() {
        let policy = policy();
        // '~' 不在允许的特殊字符集合内
        let errors = PasswordHasher::validate_password_policy("Abcdefg1~", &policy);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "password_no_special");
    }
}
