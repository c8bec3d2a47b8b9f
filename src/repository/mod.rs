//! Storage layer
//!
//! Every service talks to persisted state through [`Store`]. Calls are
//! synchronous and are made while the caller holds the lock that guards the
//! in-memory transition being persisted, so writes are never reordered
//! relative to that state.

use crate::{
    config::StorageConfig,
    error::{AppError, Result},
    models::{
        AuditRecord, IntegrityReport, IssuedToken, SecurityIncident, Session, StoredSigningKey,
        User,
    },
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub mod file;
pub mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

pub trait Store: Send + Sync {
    // ==================== Users ====================

    /// Insert a new user; username and email must be unique
    fn insert_user(&self, user: &User) -> Result<()>;
    fn update_user(&self, user: &User) -> Result<()>;
    fn get_user(&self, id: Uuid) -> Result<Option<User>>;
    fn find_user_by_username(&self, username: &str) -> Result<Option<User>>;
    fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    fn list_users(&self) -> Result<Vec<User>>;

    // ==================== Sessions ====================

    /// Insert or replace a session; the session token must be unique
    fn save_session(&self, session: &Session) -> Result<()>;
    fn get_session(&self, id: Uuid) -> Result<Option<Session>>;
    fn find_session_by_token(&self, token: &str) -> Result<Option<Session>>;
    fn list_sessions(&self) -> Result<Vec<Session>>;

    // ==================== Audit chain ====================

    /// Append one chain record; the sequence must be greater than any stored one
    fn append_audit_record(&self, record: &AuditRecord) -> Result<()>;
    fn get_audit_record(&self, sequence: u64) -> Result<Option<AuditRecord>>;
    /// Inclusive range, ordered by sequence
    fn audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>>;
    fn last_audit_record(&self) -> Result<Option<AuditRecord>>;
    /// Records whose event timestamp lies in `[from, to]` (either bound may be
    /// open), ordered by sequence. Non-matching records are never cloned.
    fn audit_in_period(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditRecord>>;

    // ==================== Signing keys ====================

    fn save_signing_key(&self, key: &StoredSigningKey) -> Result<()>;
    fn delete_signing_key(&self, kid: &str) -> Result<()>;
    fn list_signing_keys(&self) -> Result<Vec<StoredSigningKey>>;

    // ==================== Issued tokens ====================

    fn save_issued_token(&self, token: &IssuedToken) -> Result<()>;
    fn get_issued_token(&self, jti: Uuid) -> Result<Option<IssuedToken>>;
    fn list_issued_tokens(&self) -> Result<Vec<IssuedToken>>;
    /// Remove records whose expiry is before `now`; returns the removed ids
    fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>>;

    // ==================== Incidents & verification runs ====================

    fn save_incident(&self, incident: &SecurityIncident) -> Result<()>;
    fn get_incident(&self, id: Uuid) -> Result<Option<SecurityIncident>>;
    fn list_incidents(&self) -> Result<Vec<SecurityIncident>>;
    fn save_integrity_report(&self, report: &IntegrityReport) -> Result<()>;
    fn list_integrity_reports(&self) -> Result<Vec<IntegrityReport>>;

    fn backend_name(&self) -> &'static str;
}

pub type SharedStore = Arc<dyn Store>;

/// Build the configured backend
pub fn open_store(config: &StorageConfig) -> Result<SharedStore> {
    match config.backend.as_str() {
        "memory" => Ok(Arc::new(MemoryStore::new())),
        "file" => Ok(Arc::new(FileStore::open(&config.data_dir)?)),
        other => Err(AppError::Config(format!("unknown storage backend: {}", other))),
    }
}
