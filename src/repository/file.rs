//! File-backed store
//!
//! Layout under the data directory:
//! - `users.json`, `sessions.json`, `signing_keys.json`, `issued_tokens.json`,
//!   `incidents.json`, `integrity_reports.json`: full table snapshots,
//!   rewritten atomically (temp file + rename) after each mutation. When the
//!   write fails the working-set table is restored, so memory never runs
//!   ahead of disk;
//! - `audit.jsonl`: the audit chain, one record per line, append-only and
//!   synced before the append returns.
//!
//! The working set lives in a [`MemoryStore`]; a reopened store continues
//! from what is on disk. Unparseable lines are integrity errors.

use super::{MemoryStore, Store};
use crate::{
    error::{AppError, Result},
    models::{
        AuditRecord, IntegrityReport, IssuedToken, SecurityIncident, Session, StoredSigningKey,
        User,
    },
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

const USERS_FILE: &str = "users.json";
const SESSIONS_FILE: &str = "sessions.json";
const KEYS_FILE: &str = "signing_keys.json";
const TOKENS_FILE: &str = "issued_tokens.json";
const INCIDENTS_FILE: &str = "incidents.json";
const REPORTS_FILE: &str = "integrity_reports.json";
pub const AUDIT_FILE: &str = "audit.jsonl";

pub struct FileStore {
    dir: PathBuf,
    inner: MemoryStore,
    // 串行化“内存变更 + 落盘”，保证快照不会被旧版本覆盖
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let inner = MemoryStore::new();
        for user in read_table::<User>(&dir.join(USERS_FILE))? {
            inner.insert_user(&user)?;
        }
        for session in read_table::<Session>(&dir.join(SESSIONS_FILE))? {
            inner.save_session(&session)?;
        }
        for key in read_table::<StoredSigningKey>(&dir.join(KEYS_FILE))? {
            inner.save_signing_key(&key)?;
        }
        for token in read_table::<IssuedToken>(&dir.join(TOKENS_FILE))? {
            inner.save_issued_token(&token)?;
        }
        for incident in read_table::<SecurityIncident>(&dir.join(INCIDENTS_FILE))? {
            inner.save_incident(&incident)?;
        }
        for report in read_table::<IntegrityReport>(&dir.join(REPORTS_FILE))? {
            inner.save_integrity_report(&report)?;
        }
        inner.load_audit_records(read_audit_log(&dir.join(AUDIT_FILE))?);

        tracing::info!(
            dir = %dir.display(),
            audit_records = inner.audit_len(),
            "File store opened"
        );

        Ok(Self {
            dir,
            inner,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist<T: Serialize>(&self, file: &str, rows: &[T]) -> Result<()> {
        let path = self.dir.join(file);
        let tmp = self.dir.join(format!("{}.tmp", file));
        let bytes = serde_json::to_vec_pretty(rows)
            .map_err(|e| AppError::Storage(format!("encode {}: {}", file, e)))?;
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&bytes)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Apply `change` to the working set, then persist the table. On a
    /// failed write the table is put back to its state before `change`.
    fn commit<T, R>(
        &self,
        file: &str,
        snapshot: impl Fn(&MemoryStore) -> Result<Vec<T>>,
        restore: impl FnOnce(&MemoryStore, Vec<T>),
        change: impl FnOnce(&MemoryStore) -> Result<R>,
    ) -> Result<R>
    where
        T: Serialize,
    {
        let _guard = self.write_lock.lock();
        let before = snapshot(&self.inner)?;
        let result = change(&self.inner)?;
        let after = snapshot(&self.inner)?;

        if let Err(e) = self.persist(file, &after) {
            tracing::error!(file, error = %e, "Table write failed, rolling back working set");
            metrics::counter!("sentinel_store_write_failures_total", "table" => file.to_string())
                .increment(1);
            restore(&self.inner, before);
            return Err(e);
        }
        Ok(result)
    }
}

fn read_table<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|e| {
        AppError::Integrity(format!("malformed table {}: {}", path.display(), e))
    })
}

fn read_audit_log(path: &Path) -> Result<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: AuditRecord = serde_json::from_str(&line).map_err(|e| {
            AppError::Integrity(format!("malformed audit record at line {}: {}", idx + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

impl Store for FileStore {
    fn insert_user(&self, user: &User) -> Result<()> {
        self.commit(
            USERS_FILE,
            |m| m.list_users(),
            |m, rows| m.restore_users(rows),
            |m| m.insert_user(user),
        )
    }

    fn update_user(&self, user: &User) -> Result<()> {
        self.commit(
            USERS_FILE,
            |m| m.list_users(),
            |m, rows| m.restore_users(rows),
            |m| m.update_user(user),
        )
    }

    fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        self.inner.get_user(id)
    }

    fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        self.inner.find_user_by_username(username)
    }

    fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.inner.find_user_by_email(email)
    }

    fn list_users(&self) -> Result<Vec<User>> {
        self.inner.list_users()
    }

    fn save_session(&self, session: &Session) -> Result<()> {
        self.commit(
            SESSIONS_FILE,
            |m| m.list_sessions(),
            |m, rows| m.restore_sessions(rows),
            |m| m.save_session(session),
        )
    }

    fn get_session(&self, id: Uuid) -> Result<Option<Session>> {
        self.inner.get_session(id)
    }

    fn find_session_by_token(&self, token: &str) -> Result<Option<Session>> {
        self.inner.find_session_by_token(token)
    }

    fn list_sessions(&self) -> Result<Vec<Session>> {
        self.inner.list_sessions()
    }

    fn append_audit_record(&self, record: &AuditRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(last) = self.inner.last_audit_record()? {
            if record.sequence <= last.sequence {
                return Err(AppError::Integrity(format!(
                    "audit sequence {} is not after stored head {}",
                    record.sequence, last.sequence
                )));
            }
        }
        let line = serde_json::to_string(record)
            .map_err(|e| AppError::Storage(format!("encode audit record: {}", e)))?;
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join(AUDIT_FILE))?;
        writeln!(f, "{}", line)?;
        f.flush()?;
        f.sync_all()?;
        self.inner.append_audit_record(record)
    }

    fn get_audit_record(&self, sequence: u64) -> Result<Option<AuditRecord>> {
        self.inner.get_audit_record(sequence)
    }

    fn audit_range(&self, from: u64, to: u64) -> Result<Vec<AuditRecord>> {
        self.inner.audit_range(from, to)
    }

    fn last_audit_record(&self) -> Result<Option<AuditRecord>> {
        self.inner.last_audit_record()
    }

    fn audit_in_period(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<AuditRecord>> {
        self.inner.audit_in_period(from, to)
    }

    fn save_signing_key(&self, key: &StoredSigningKey) -> Result<()> {
        self.commit(
            KEYS_FILE,
            |m| m.list_signing_keys(),
            |m, rows| m.restore_signing_keys(rows),
            |m| m.save_signing_key(key),
        )
    }

    fn delete_signing_key(&self, kid: &str) -> Result<()> {
        self.commit(
            KEYS_FILE,
            |m| m.list_signing_keys(),
            |m, rows| m.restore_signing_keys(rows),
            |m| m.delete_signing_key(kid),
        )
    }

    fn list_signing_keys(&self) -> Result<Vec<StoredSigningKey>> {
        self.inner.list_signing_keys()
    }

    fn save_issued_token(&self, token: &IssuedToken) -> Result<()> {
        self.commit(
            TOKENS_FILE,
            |m| m.list_issued_tokens(),
            |m, rows| m.restore_issued_tokens(rows),
            |m| m.save_issued_token(token),
        )
    }

    fn get_issued_token(&self, jti: Uuid) -> Result<Option<IssuedToken>> {
        self.inner.get_issued_token(jti)
    }

    fn list_issued_tokens(&self) -> Result<Vec<IssuedToken>> {
        self.inner.list_issued_tokens()
    }

    fn delete_expired_tokens(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.commit(
            TOKENS_FILE,
            |m| m.list_issued_tokens(),
            |m, rows| m.restore_issued_tokens(rows),
            |m| m.delete_expired_tokens(now),
        )
    }

    fn save_incident(&self, incident: &SecurityIncident) -> Result<()> {
        self.commit(
            INCIDENTS_FILE,
            |m| m.list_incidents(),
            |m, rows| m.restore_incidents(rows),
            |m| m.save_incident(incident),
        )
    }

    fn get_incident(&self, id: Uuid) -> Result<Option<SecurityIncident>> {
        self.inner.get_incident(id)
    }

    fn list_incidents(&self) -> Result<Vec<SecurityIncident>> {
        self.inner.list_incidents()
    }

    fn save_integrity_report(&self, report: &IntegrityReport) -> Result<()> {
        self.commit(
            REPORTS_FILE,
            |m| m.list_integrity_reports(),
            |m, rows| m.restore_integrity_reports(rows),
            |m| m.save_integrity_report(report),
        )
    }

    fn list_integrity_reports(&self) -> Result<Vec<IntegrityReport>> {
        self.inner.list_integrity_reports()
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}
