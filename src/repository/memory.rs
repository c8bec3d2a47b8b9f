//! In-memory store
//!
//! Maps guarded by `parking_lot::RwLock`, one lock per table. Not durable;
//! used for tests, local development and as the working set of [`FileStore`].
//!
//! [`FileStore`]: super::FileStore

use super::Store;
use crate::{
    error::{AppError, Result},
    models::{
        AuditRecord, IntegrityReport, IssuedToken, SecurityIncident, Session, StoredSigningKey,
        User,
    },
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryStore {
    users: RwLock<HashMap<Uuid, User>>,
    sessions: RwLock<HashMap<Uuid, Session>>,
    audit: RwLock<BTreeMap<u64, AuditRecord>>,
    keys: RwLock<BTreeMap<String, StoredSigningKey>>,
    tokens: RwLock<HashMap<Uuid, IssuedToken>>,
    incidents: RwLock<HashMap<Uuid, SecurityIncident>>,
    reports: RwLock<Vec<IntegrityReport>>,
    fail_audit_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fault injection: make subsequent audit appends fail with a storage error
    pub fn set_audit_append_failure(&self, fail: bool) {
        self.fail_audit_appends.store(fail, Ordering::SeqCst);
    }

    /// Load audit records as found on disk, without append ordering checks
    pub(crate) fn load_audit_records(&self, records: Vec<AuditRecord>) {
        let mut audit = self.audit.write();
        for record in records {
            audit.insert(record.sequence, record);
        }
    }

    pub fn audit_len(&self) -> usize {
        self.audit.read().len()
    }

    // 以下用于 FileStore 在落盘失败时回滚整张表

    pub(crate) fn restore_users(&self, rows: Vec<User>) {
        let mut users = self.users.write();
        *users = rows.into_iter().map(|u| (u.id, u)).collect();
        metrics::gauge!("sentinel_users_total").set(users.len() as f64);
    }

    pub(crate) fn restore_sessions(&self, rows: Vec<Session>) {
        *self.sessions.write() = rows.into_iter().map(|s| (s.id, s)).collect();
    }

    pub(crate) fn restore_signing_keys(&self, rows: Vec<StoredSigningKey>) {
        *self.keys.write() = rows.into_iter().map(|k| (k.kid.clone(), k)).collect();
    }

    pub(crate) fn restore_issued_tokens(&self, rows: Vec<IssuedToken>) {
        *self.tokens.write() = rows.into_iter().map(|t| (t.jti, t)).collect();
    }

    pub(crate) fn restore_incidents(&self, rows: Vec<SecurityIncident>) {
        *self.incidents.write() = rows.into_iter().map(|i| (i.id, i)).collect();
    }

    pub(crate) fn restore_integrity_reports(&self, rows: Vec<IntegrityReport>) {
        *self.reports.write() = rows;
    }
}

impl Store for MemoryStore {
    fn insert_user(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if users.contains_key(&user.id) {
            return Err(AppError::Conflict(format!("user id {} already exists", user.id)));
        }
        if users.values().any(|u| u.username == user.username) {
            return Err(AppError::Conflict(format!("username '{}' already taken", user.username)));
        }
        if users.values().any(|u| u.email.eq_ignore_ascii_case(&user.email)) {
            return Err(AppError::Conflict(format!("email '{}' already registered", user.email)));
        }
        users.insert(user.id, user.clone());
        metrics::gauge!("sentinel_users_total").set(users.len() as f64);
        Ok(())
    }

    fn update_user(&self, user: &User) -> Result<()> {
        let mut users = self.users.write();
        if users
            .values()
            .any(|u| u.id != user.id && u.email.eq_ignore_ascii_case(&user.email))
        {
            return Err(AppError::Conflict(format!("email '{}' already registered", user.email)));
        }
        match users.get_mut(&user.id) {
            Some(existing) => {
                *existing = user.clone();
                Ok(())
            }
            None => Err(AppError::not_found("user")),
        }
    }

    fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.read().get(&id).cloned())
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self.users.read().values().find(|u| u.username == username).cloned())
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .read()
            .values()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.username.cmp(&b.username)));
        Ok(users)
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions
            .values()
            .any(|s| s.id != session.id && s.token == session.token)
        {
            return Err(AppError::Conflict("session token collision".to_string()));
        }
        sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.sessions.read().get(&id).cloned())
    }

    fn find_session_by_token(&self, token: &str) -> Result<Option<Session>> {
        Ok(self.sessions.read().values().find(|s| s.token == token).cloned())
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        let mut sessions: Vec<Session> = self.sessions.read().values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    fn append_audit_record(&self, record: &AuditRecord) -> Result<()> {
        if self.fail_audit_appends.load(Ordering::SeqCst) {
            return Err(AppError::Storage("audit store unavailable".to_string()));
        }
        let mut audit = self.audit.write();
        if let Some((&last, _)) = audit.iter().next_back() {
            if record.sequence <= last {
                return Err(AppError::Integrity(format!(
                    "audit sequence {} is not after stored head {}",
                    record.sequence, last
                )));
            }
        }
        audit.insert(record.sequence, record.clone());
        Ok(())
    }

    fn get_audit_record(&self, sequence: u64) -> Result<Option<AuditRecord>> {
        Ok(self.audit.read().get(&sequence).cloned())
    }

    fn audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>> {
        if from > to {
            return Ok(Vec::new());
        }
        Ok(self.audit.read().range(from..=to).map(|(_, r)| r.clone()).collect())
    }

    fn last_audit_record(&self) -> Result<Option<AuditRecord>> {
        Ok(self.audit.read().values().next_back().cloned())
    }

    fn audit_in_period(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditRecord>> {
        Ok(self
            .audit
            .read()
            .values()
            .filter(|r| {
                from.map_or(true, |t| r.event.timestamp >= t)
                    && to.map_or(true, |t| r.event.timestamp <= t)
            })
            .cloned()
            .collect())
    }

    fn save_signing_key(&self, key: &StoredSigningKey) -> Result<()> {
        self.keys.write().insert(key.kid.clone(), key.clone());
        Ok(())
    }

    fn delete_signing_key(&self, kid: &str) -> Result<()> {
        self.keys.write().remove(kid);
        Ok(())
    }

    fn list_signing_keys(&self) -> Result<Vec<StoredSigningKey>> {
        let mut keys: Vec<StoredSigningKey> = self.keys.read().values().cloned().collect();
        keys.sort_by_key(|k| k.created_at);
        Ok(keys)
    }

    fn save_issued_token(&self, token: &IssuedToken) -> Result<()> {
        self.tokens.write().insert(token.jti, token.clone());
        Ok(())
    }

    fn get_issued_token(&self, jti: Uuid) -> Result<Option<IssuedToken>> {
        Ok(self.tokens.read().get(&jti).cloned())
    }

    fn list_issued_tokens(&self) -> Result<Vec<IssuedToken>> {
        let mut tokens: Vec<IssuedToken> = self.tokens.read().values().cloned().collect();
        tokens.sort_by_key(|t| t.issued_at);
        Ok(tokens)
    }

    fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tokens = self.tokens.write();
        let expired: Vec<Uuid> = tokens
            .values()
            .filter(|t| t.expires_at < now)
            .map(|t| t.jti)
            .collect();
        for jti in &expired {
            tokens.remove(jti);
        }
        Ok(expired)
    }

    fn save_incident(&self, incident: &SecurityIncident) -> Result<()> {
        self.incidents.write().insert(incident.id, incident.clone());
        Ok(())
    }

    fn get_incident(&self, id: Uuid) -> Result<Option<SecurityIncident>> {
        Ok(self.incidents.read().get(&id).cloned())
    }

    fn list_incidents(&self) -> Result<Vec<SecurityIncident>> {
        let mut incidents: Vec<SecurityIncident> =
            self.incidents.read().values().cloned().collect();
        incidents.sort_by_key(|i| i.detected_at);
        Ok(incidents)
    }

    fn save_integrity_report(&self, report: &IntegrityReport) -> Result<()> {
        self.reports.write().push(report.clone());
        Ok(())
    }

    fn list_integrity_reports(&self) -> Result<Vec<IntegrityReport>> {
        Ok(self.reports.read().clone())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
