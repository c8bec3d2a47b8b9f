//! RSA signing keys and the public key-set document
//!
//! Exactly one key signs new tokens at a time. After a rotation the previous
//! signer stays in the ring as verify-only until its grace deadline, then it
//! is purged. Only modulus and exponent ever leave this module.

use crate::{error::AppError, models::StoredSigningKey};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use rand::{rngs::OsRng, RngCore};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::DecodePrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};

pub const SIGNING_ALGORITHM: &str = "RS256";

/// Key id: hex of 16 random bytes. Not secret, only selects a verifier.
pub fn generate_kid() -> String {
    let mut kid_bytes = [0u8; 16];
    OsRng.fill_bytes(&mut kid_bytes);
    hex::encode(kid_bytes)
}

#[derive(Clone)]
pub struct SigningKey {
    pub kid: String,
    private_key_pem: Secret<String>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    pub modulus: String,
    pub exponent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Generate a fresh RSA key pair
    pub fn generate(bits: usize, now: DateTime<Utc>) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|e| AppError::Internal(format!("RSA key generation failed: {}", e)))?;
        Self::from_private_key(generate_kid(), &private_key, now)
    }

    /// Import an existing PEM private key (PKCS#1 or PKCS#8)
    pub fn from_pem(kid: &str, pem: &str, now: DateTime<Utc>) -> Result<Self, AppError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| AppError::Integrity(format!("malformed signing key {}: {}", kid, e)))?;
        Self::from_private_key(kid.to_string(), &private_key, now)
    }

    fn from_private_key(
        kid: String,
        private_key: &RsaPrivateKey,
        now: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        let pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| AppError::Internal(format!("encode signing key: {}", e)))?;
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes())
            .map_err(|e| AppError::Internal(format!("load signing key: {}", e)))?;

        let modulus = URL_SAFE_NO_PAD.encode(private_key.n().to_bytes_be());
        let exponent = URL_SAFE_NO_PAD.encode(private_key.e().to_bytes_be());
        let decoding_key = DecodingKey::from_rsa_components(&modulus, &exponent)
            .map_err(|e| AppError::Internal(format!("load verification key: {}", e)))?;

        Ok(Self {
            kid,
            private_key_pem: Secret::new(pem.to_string()),
            encoding_key,
            decoding_key,
            modulus,
            exponent,
            created_at: now,
            expires_at: None,
            active: true,
        })
    }

    pub fn from_stored(stored: &StoredSigningKey) -> Result<Self, AppError> {
        let mut key = Self::from_pem(&stored.kid, &stored.private_key_pem, stored.created_at)?;
        key.expires_at = stored.expires_at;
        key.active = stored.active;
        if key.modulus != stored.modulus || key.exponent != stored.exponent {
            return Err(AppError::Integrity(format!(
                "signing key {} public parts do not match its private key",
                stored.kid
            )));
        }
        Ok(key)
    }

    pub fn to_stored(&self) -> StoredSigningKey {
        StoredSigningKey {
            kid: self.kid.clone(),
            algorithm: SIGNING_ALGORITHM.to_string(),
            private_key_pem: self.private_key_pem.expose_secret().clone(),
            modulus: self.modulus.clone(),
            exponent: self.exponent.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            active: self.active,
        }
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    /// Accepted for verification: the signer, or a demoted key inside its grace window
    pub fn verifies_at(&self, now: DateTime<Utc>) -> bool {
        self.active || self.expires_at.is_some_and(|deadline| now < deadline)
    }

    pub fn jwk(&self) -> Jwk {
        Jwk {
            kty: "RSA".to_string(),
            use_field: "sig".to_string(),
            kid: self.kid.clone(),
            alg: SIGNING_ALGORITHM.to_string(),
            n: self.modulus.clone(),
            e: self.exponent.clone(),
        }
    }
}

/// A single JWK entry for an RSA public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub use_field: String,
    pub kid: String,
    pub alg: String,
    pub n: String,
    pub e: String,
}

/// Public key-set document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

impl Jwks {
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

/// Signer plus verify-only predecessors
#[derive(Debug, Default)]
pub struct KeyRing {
    keys: Vec<SigningKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: Vec<SigningKey>) -> Self {
        Self { keys }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[SigningKey] {
        &self.keys
    }

    /// Current signer
    pub fn active(&self) -> Option<&SigningKey> {
        self.keys.iter().rev().find(|k| k.active)
    }

    /// Key usable to verify a token carrying `kid`
    pub fn verifier(&self, kid: &str, now: DateTime<Utc>) -> Option<&SigningKey> {
        self.keys.iter().find(|k| k.kid == kid && k.verifies_at(now))
    }

    /// Promote `key` to signer, demoting the previous one until `grace_until`.
    /// Returns the demoted key ids.
    pub fn promote(&mut self, mut key: SigningKey, grace_until: DateTime<Utc>) -> Vec<String> {
        let mut demoted = Vec::new();
        for existing in self.keys.iter_mut().filter(|k| k.active) {
            existing.active = false;
            existing.expires_at = Some(grace_until);
            demoted.push(existing.kid.clone());
        }
        key.active = true;
        key.expires_at = None;
        self.keys.push(key);
        demoted
    }

    /// Drop verify-only keys whose grace window has closed
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let (keep, drop): (Vec<SigningKey>, Vec<SigningKey>) =
            std::mem::take(&mut self.keys).into_iter().partition(|k| k.verifies_at(now));
        self.keys = keep;
        drop.into_iter().map(|k| k.kid).collect()
    }

    /// Key-set document for every key still accepted for verification
    pub fn jwks(&self, now: DateTime<Utc>) -> Jwks {
        Jwks {
            keys: self
                .keys
                .iter()
                .filter(|k| k.verifies_at(now))
                .map(SigningKey::jwk)
                .collect(),
        }
    }
}
