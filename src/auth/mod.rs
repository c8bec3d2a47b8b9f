//! Authentication primitives: password hashing, signing keys, bearer tokens

pub mod jwt;
pub mod keys;
pub mod password;

pub use jwt::{Claims, InvalidReason, JwtService, TokenPair, TokenVerdict};
pub use keys::{Jwk, Jwks, KeyRing, SigningKey};
pub use password::PasswordHasher;
