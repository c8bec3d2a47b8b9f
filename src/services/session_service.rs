//! 会话管理服务
//! 创建、校验、撤销、锁定与过期清理共用同一把索引锁；
//! 存储写入在锁内完成，审计事件在释放锁之后按发生顺序写入。

use crate::{
    clock::SharedClock,
    config::SessionConfig,
    error::{AppError, Result},
    models::{AuthEvent, AuthEventKind, Origin, Session, SessionStatus, User},
    repository::SharedStore,
    services::audit_service::AuditService,
};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use parking_lot::Mutex;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

const SESSION_TOKEN_BYTES: usize = 32;
const CSRF_TOKEN_BYTES: usize = 16;

pub const REASON_CONCURRENT_LIMIT: &str = "concurrent_limit_exceeded";

fn random_token(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Length-checked comparison whose running time does not depend on where
/// the inputs first differ
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Default)]
struct SessionIndex {
    sessions: HashMap<Uuid, Session>,
    by_token: HashMap<String, Uuid>,
}

impl SessionIndex {
    fn insert(&mut self, session: Session) {
        self.by_token.insert(session.token.clone(), session.id);
        self.sessions.insert(session.id, session);
    }

    fn id_for_token(&self, token: &str) -> Option<Uuid> {
        self.by_token.get(token).copied()
    }
}

pub struct SessionService {
    store: SharedStore,
    audit: Arc<AuditService>,
    clock: SharedClock,
    config: SessionConfig,
    index: Mutex<SessionIndex>,
}

impl SessionService {
    /// Rebuild the index from stored sessions that are still Active
    pub fn new(config: &SessionConfig, store: SharedStore, audit: Arc<AuditService>) -> Result<Self> {
        let mut index = SessionIndex::default();
        for session in store.list_sessions()? {
            if session.status == SessionStatus::Active {
                index.insert(session);
            }
        }

        tracing::info!(sessions = index.sessions.len(), "Session index loaded");

        Ok(Self {
            clock: audit.clock().clone(),
            store,
            audit,
            config: config.clone(),
            index: Mutex::new(index),
        })
    }

    fn record_all(&self, events: Vec<AuthEvent>) -> Result<()> {
        for event in events {
            self.audit.record(event)?;
        }
        Ok(())
    }

    fn session_event(kind: AuthEventKind, session: &Session, now: DateTime<Utc>) -> AuthEvent {
        AuthEvent::new(kind, now)
            .user_id(session.user_id)
            .session(session.id)
            .origin(&session.origin)
    }

    /// Move a session to a terminal status; persisted before the index changes
    fn transition(
        &self,
        index: &mut SessionIndex,
        id: Uuid,
        status: SessionStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AuthEvent>> {
        let Some(current) = index.sessions.get(&id) else {
            return Ok(None);
        };
        if current.status != SessionStatus::Active {
            return Ok(None);
        }

        let mut updated = current.clone();
        updated.status = status;
        updated.metadata.insert("revocation_reason".to_string(), reason.into());
        updated.metadata.insert(
            "status_changed_at".to_string(),
            now.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
        );
        self.store.save_session(&updated)?;

        let kind = match status {
            SessionStatus::Expired => AuthEventKind::SessionExpired,
            _ => AuthEventKind::SessionRevoked,
        };
        let event = Self::session_event(kind, &updated, now)
            .meta("status", status.as_str())
            .meta("reason", reason);
        index.sessions.insert(id, updated);

        metrics::counter!("sentinel_session_transitions_total", "status" => status.as_str())
            .increment(1);
        Ok(Some(event))
    }

    /// Expire the session if it has lapsed; true when it did
    fn expire_if_lapsed(
        &self,
        index: &mut SessionIndex,
        id: Uuid,
        now: DateTime<Utc>,
        events: &mut Vec<AuthEvent>,
    ) -> Result<bool> {
        let lapsed = index.sessions.get(&id).is_some_and(|s| s.is_lapsed(now));
        if lapsed {
            let reason = match index.sessions.get(&id) {
                Some(s) if now >= s.expires_at => "ttl_elapsed",
                _ => "activity_timeout",
            };
            events.extend(self.transition(index, id, SessionStatus::Expired, reason, now)?);
        }
        Ok(lapsed)
    }

    /// Open a session. At the concurrency cap the oldest active session is
    /// revoked first; the new login is never rejected.
    pub fn create_session(&self, user: &User, origin: &Origin) -> Result<Session> {
        let now = self.clock.now();

        if !user.is_active || user.is_locked {
            let reason = if user.is_locked { "Account locked" } else { "Account inactive" };
            self.audit.record(
                AuthEvent::new(AuthEventKind::SessionCreated, now)
                    .user(user)
                    .origin(origin)
                    .failed(reason),
            )?;
            return Err(AppError::Forbidden(format!("cannot open session: {}", reason)));
        }

        let mut events = Vec::new();
        let session = {
            let mut index = self.index.lock();

            let owned: Vec<Uuid> = index
                .sessions
                .values()
                .filter(|s| s.user_id == user.id && s.status == SessionStatus::Active)
                .map(|s| s.id)
                .collect();
            let mut active = Vec::new();
            for id in owned {
                if !self.expire_if_lapsed(&mut index, id, now, &mut events)? {
                    active.push(id);
                }
            }
            // 创建时间相同时按 id 排序，淘汰顺序与 HashMap 遍历无关
            active.sort_by_key(|id| (index.sessions.get(id).map(|s| s.created_at), *id));

            let max = self.config.max_concurrent_sessions;
            let excess = (active.len() + 1).saturating_sub(max);
            for id in active.into_iter().take(excess) {
                tracing::info!(
                    user_id = %user.id,
                    session_id = %id,
                    "Revoking oldest session at concurrency limit"
                );
                events.extend(self.transition(
                    &mut index,
                    id,
                    SessionStatus::Revoked,
                    REASON_CONCURRENT_LIMIT,
                    now,
                )?);
            }

            let mut user_agent_hash = Sha256::new();
            user_agent_hash.update(origin.user_agent.as_deref().unwrap_or_default().as_bytes());

            let mut metadata = BTreeMap::new();
            metadata.insert("fixation_protection".to_string(), true.into());
            metadata.insert(
                "token_regenerated_at".to_string(),
                now.to_rfc3339_opts(SecondsFormat::Secs, true).into(),
            );
            metadata.insert(
                "user_agent_hash".to_string(),
                hex::encode(&user_agent_hash.finalize()[..8]).into(),
            );

            let session = Session {
                id: Uuid::new_v4(),
                user_id: user.id,
                token: random_token(SESSION_TOKEN_BYTES),
                csrf_token: random_token(CSRF_TOKEN_BYTES),
                origin: origin.clone(),
                status: SessionStatus::Active,
                created_at: now,
                expires_at: now + Duration::seconds(self.config.ttl_secs),
                last_activity: now,
                activity_timeout_secs: self.config.activity_timeout_secs,
                metadata,
            };
            self.store.save_session(&session)?;
            index.insert(session.clone());

            events.push(
                Self::session_event(AuthEventKind::SessionCreated, &session, now)
                    .username(&user.username),
            );
            session
        };

        self.record_all(events)?;

        metrics::counter!("sentinel_sessions_created_total").increment(1);
        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            client_ip = %origin.ip,
            "Session created"
        );

        Ok(session)
    }

    /// Look up an active session by token, refreshing its activity when `touch`
    pub fn validate_session(&self, token: &str, touch: bool) -> Result<Option<Session>> {
        let now = self.clock.now();
        let mut events = Vec::new();

        let result = {
            let mut index = self.index.lock();
            match index.id_for_token(token) {
                None => None,
                Some(id) => {
                    if self.expire_if_lapsed(&mut index, id, now, &mut events)? {
                        None
                    } else {
                        match index.sessions.get(&id) {
                            Some(s) if s.is_active(now) => {
                                let mut session = s.clone();
                                if touch {
                                    session.touch(now);
                                    self.store.save_session(&session)?;
                                    index.sessions.insert(id, session.clone());
                                }
                                Some(session)
                            }
                            _ => None,
                        }
                    }
                }
            }
        };

        self.record_all(events)?;
        Ok(result)
    }

    /// CSRF check against an active session
    pub fn validate_csrf(&self, token: &str, csrf_token: &str) -> Result<bool> {
        Ok(match self.validate_session(token, false)? {
            Some(session) => constant_time_eq(session.csrf_token.as_bytes(), csrf_token.as_bytes()),
            None => false,
        })
    }

    /// Idempotent; only an Active → Revoked transition is recorded
    pub fn revoke(&self, session_id: Uuid, reason: &str) -> Result<bool> {
        let now = self.clock.now();
        let event = {
            let mut index = self.index.lock();
            self.transition(&mut index, session_id, SessionStatus::Revoked, reason, now)?
        };
        let revoked = event.is_some();
        self.record_all(event.into_iter().collect())?;
        if revoked {
            tracing::info!(session_id = %session_id, reason, "Session revoked");
        }
        Ok(revoked)
    }

    /// Revoke by token (logout)
    pub fn revoke_by_token(&self, token: &str, reason: &str) -> Result<Option<Uuid>> {
        let id = self.index.lock().id_for_token(token);
        match id {
            Some(id) if self.revoke(id, reason)? => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    pub fn revoke_all_for_user(&self, user_id: Uuid, except: Option<Uuid>, reason: &str) -> Result<usize> {
        self.end_user_sessions(user_id, except, SessionStatus::Revoked, reason)
    }

    /// Active → Locked for every session of the user
    pub fn lock_sessions_for_user(&self, user_id: Uuid, reason: &str) -> Result<usize> {
        self.end_user_sessions(user_id, None, SessionStatus::Locked, reason)
    }

    fn end_user_sessions(
        &self,
        user_id: Uuid,
        except: Option<Uuid>,
        status: SessionStatus,
        reason: &str,
    ) -> Result<usize> {
        let now = self.clock.now();
        let events = {
            let mut index = self.index.lock();
            let ids: Vec<Uuid> = index
                .sessions
                .values()
                .filter(|s| s.user_id == user_id && Some(s.id) != except)
                .map(|s| s.id)
                .collect();
            let mut events = Vec::new();
            for id in ids {
                events.extend(self.transition(&mut index, id, status, reason, now)?);
            }
            events
        };

        let count = events.len();
        self.record_all(events)?;
        if count > 0 {
            tracing::info!(%user_id, count, status = status.as_str(), reason, "User sessions ended");
        }
        Ok(count)
    }

    fn extension(&self, hours: i64) -> Result<Duration> {
        let max = self.config.max_extension_hours;
        if hours <= 0 || hours > max {
            return Err(AppError::field(
                "hours",
                "range",
                &format!("extension must be between 1 and {} hours", max),
            ));
        }
        Duration::try_hours(hours)
            .ok_or_else(|| AppError::field("hours", "range", "extension is out of range"))
    }

    /// Push the absolute expiry to now + `hours` (1..=`max_extension_hours`).
    /// `None` when the token is unknown or the session is no longer active.
    pub fn extend_session(&self, token: &str, hours: i64) -> Result<Option<Session>> {
        let extension = self.extension(hours)?;
        let now = self.clock.now();
        let expires_at = now
            .checked_add_signed(extension)
            .ok_or_else(|| AppError::field("hours", "range", "extension is out of range"))?;
        let mut events = Vec::new();

        let result = {
            let mut index = self.index.lock();
            let Some(id) = index.id_for_token(token) else {
                return Ok(None);
            };
            if self.expire_if_lapsed(&mut index, id, now, &mut events)? {
                None
            } else {
                match index.sessions.get(&id) {
                    Some(s) if s.is_active(now) => {
                        let mut session = s.clone();
                        session.touch(now);
                        session.expires_at = expires_at;
                        self.store.save_session(&session)?;
                        index.sessions.insert(id, session.clone());
                        events.push(
                            Self::session_event(AuthEventKind::SessionExtended, &session, now)
                                .meta("hours", hours),
                        );
                        Some(session)
                    }
                    _ => None,
                }
            }
        };

        self.record_all(events)?;
        Ok(result)
    }

    pub fn user_sessions(&self, user_id: Uuid, active_only: bool) -> Result<Vec<Session>> {
        let now = self.clock.now();
        let mut sessions: Vec<Session> = self
            .store
            .list_sessions()?
            .into_iter()
            .filter(|s| s.user_id == user_id && (!active_only || s.is_active(now)))
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    pub fn active_session_count(&self) -> usize {
        let now = self.clock.now();
        self.index
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_active(now))
            .count()
    }

    /// Expire lapsed sessions and drop terminal ones from the index
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut events = Vec::new();
        {
            let mut index = self.index.lock();
            let ids: Vec<Uuid> = index.sessions.keys().copied().collect();
            for id in ids {
                self.expire_if_lapsed(&mut index, id, now, &mut events)?;
            }

            let terminal: Vec<(Uuid, String)> = index
                .sessions
                .values()
                .filter(|s| s.status != SessionStatus::Active)
                .map(|s| (s.id, s.token.clone()))
                .collect();
            for (id, token) in terminal {
                index.sessions.remove(&id);
                index.by_token.remove(&token);
            }
            metrics::gauge!("sentinel_active_sessions").set(index.sessions.len() as f64);
        }

        let expired = events.len();
        self.record_all(events)?;
        if expired > 0 {
            tracing::info!(expired, "Expired sessions swept");
        }
        Ok(expired)
    }
}
