//! 凭证服务：用户创建、口令认证、锁定与账户管理
//!
//! 每个用户对应一把互斥锁，登录失败计数的“递增后检查”在锁内完成，
//! 并发的错误口令尝试无法绕过锁定阈值。审计事件在释放用户锁之后写入。

use crate::{
    auth::password::PasswordHasher,
    clock::SharedClock,
    config::SecurityConfig,
    error::{AppError, FieldError, Result},
    models::{
        user::PasswordHistoryEntry, AuthEvent, AuthEventKind, CreateUserRequest, Origin, Role,
        UpdateUserRequest, User,
    },
    repository::SharedStore,
    services::audit_service::AuditService,
};
use chrono::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

pub struct CredentialService {
    store: SharedStore,
    audit: Arc<AuditService>,
    clock: SharedClock,
    hasher: PasswordHasher,
    policy: SecurityConfig,
    users: DashMap<Uuid, Arc<Mutex<User>>>,
    usernames: DashMap<String, Uuid>,
    // 串行化“唯一性检查 + 插入”
    creation: Mutex<()>,
}

impl CredentialService {
    pub fn new(policy: &SecurityConfig, store: SharedStore, audit: Arc<AuditService>) -> Result<Self> {
        let service = Self {
            hasher: PasswordHasher::from_config(policy)?,
            policy: policy.clone(),
            clock: audit.clock().clone(),
            store,
            audit,
            users: DashMap::new(),
            usernames: DashMap::new(),
            creation: Mutex::new(()),
        };

        for user in service.store.list_users()? {
            for warning in user.warnings() {
                tracing::warn!(user_id = %user.id, username = %user.username, "{}", warning);
            }
            service.cache(user);
        }

        Ok(service)
    }

    fn cache(&self, user: User) -> Arc<Mutex<User>> {
        let id = user.id;
        self.usernames.insert(user.username.clone(), id);
        let handle = Arc::new(Mutex::new(user));
        self.users.insert(id, handle.clone());
        handle
    }

    fn handle(&self, id: Uuid) -> Result<Arc<Mutex<User>>> {
        if let Some(handle) = self.users.get(&id) {
            return Ok(handle.clone());
        }
        match self.store.get_user(id)? {
            Some(user) => Ok(self.cache(user)),
            None => Err(AppError::not_found("user")),
        }
    }

    fn handle_by_username(&self, username: &str) -> Result<Option<Arc<Mutex<User>>>> {
        if let Some(id) = self.usernames.get(username).map(|e| *e.value()) {
            return self.handle(id).map(Some);
        }
        Ok(self.store.find_user_by_username(username)?.map(|user| self.cache(user)))
    }

    /// Apply a mutation under the per-user lock and persist it before the
    /// in-memory copy changes. Returns the updated user and the closure's result.
    fn mutate<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut User) -> Result<T>,
    ) -> Result<(User, T)> {
        let handle = self.handle(id)?;
        let mut guard = handle.lock();
        let mut updated = guard.clone();
        let out = f(&mut updated)?;
        updated.updated_at = self.clock.now();
        self.store.update_user(&updated)?;
        *guard = updated.clone();
        Ok((updated, out))
    }

    fn event(&self, kind: AuthEventKind, user: &User, actor: Option<&User>) -> AuthEvent {
        let mut event = AuthEvent::new(kind, self.clock.now())
            .user(user)
            .origin(&Origin::internal());
        if let Some(actor) = actor {
            event = event
                .meta("actor_id", actor.id.to_string())
                .meta("actor", actor.username.as_str());
        }
        event
    }

    // ==================== Creation ====================

    /// Create a user. Every failing rule is reported as its own field error.
    pub fn create_user(&self, request: CreateUserRequest, actor: Option<&User>) -> Result<User> {
        let mut errors = match request.validate() {
            Ok(()) => Vec::new(),
            Err(e) => AppError::from(e).field_errors().to_vec(),
        };
        errors.extend(PasswordHasher::validate_password_policy(
            &request.password,
            &self.policy,
        ));
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let salt = PasswordHasher::generate_salt();
        let password_hash = self.hasher.hash(&request.password, &salt)?;
        let now = self.clock.now();

        let user = User {
            id: Uuid::new_v4(),
            username: request.username.clone(),
            email: request.email.clone(),
            password_hash,
            salt,
            password_history: Vec::new(),
            roles: request.roles.iter().copied().collect::<BTreeSet<Role>>(),
            is_active: true,
            is_locked: false,
            failed_login_attempts: 0,
            last_login: None,
            last_password_change: now,
            password_expires_at: now + Duration::days(self.policy.password_expiry_days),
            must_change_password: false,
            created_at: now,
            updated_at: now,
            metadata: request.metadata.clone(),
        };

        {
            let _guard = self.creation.lock();

            let mut taken = Vec::new();
            if self.store.find_user_by_username(&user.username)?.is_some() {
                taken.push(FieldError::new("username", "username_taken", "Username already exists"));
            }
            if self.store.find_user_by_email(&user.email)?.is_some() {
                taken.push(FieldError::new("email", "email_taken", "Email already registered"));
            }
            if !taken.is_empty() {
                return Err(AppError::Validation(taken));
            }

            self.store.insert_user(&user)?;
            self.cache(user.clone());
        }

        for warning in user.warnings() {
            tracing::warn!(user_id = %user.id, "{}", warning);
        }

        self.audit.record(
            self.event(AuthEventKind::UserCreated, &user, actor).meta(
                "roles",
                user.roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
            ),
        )?;

        tracing::info!(user_id = %user.id, username = %user.username, "User created");

        Ok(user)
    }

    // ==================== Authentication ====================

    /// Verify a username/password pair.
    ///
    /// `Ok(None)` for every ordinary refusal; exactly one login outcome event
    /// is recorded per call. Only store or chain failures are errors.
    pub fn authenticate(&self, username: &str, password: &str, origin: &Origin) -> Result<Option<User>> {
        let now = self.clock.now();
        let failure = |message: &str| {
            AuthEvent::new(AuthEventKind::LoginFailure, now)
                .username(username)
                .origin(origin)
                .failed(message)
        };

        let Some(handle) = self.handle_by_username(username)? else {
            self.audit.record(failure("User not found"))?;
            metrics::counter!("sentinel_logins_total", "outcome" => "unknown_user").increment(1);
            return Ok(None);
        };

        let mut events = Vec::new();
        let outcome = {
            let mut guard = handle.lock();

            if guard.is_locked {
                events.push(failure("Account locked").user_id(guard.id));
                None
            } else if !guard.is_active {
                events.push(failure("Account inactive").user_id(guard.id));
                None
            } else if !self.hasher.verify(password, &guard.salt, &guard.password_hash)? {
                let mut updated = guard.clone();
                updated.failed_login_attempts += 1;
                updated.updated_at = now;
                let locked = updated.failed_login_attempts >= self.policy.max_failed_attempts;
                if locked {
                    updated.is_locked = true;
                }
                self.store.update_user(&updated)?;
                *guard = updated;

                if locked {
                    tracing::warn!(
                        user_id = %guard.id,
                        attempts = guard.failed_login_attempts,
                        client_ip = %origin.ip,
                        "Account locked after repeated login failures"
                    );
                    metrics::counter!("sentinel_account_lockouts_total").increment(1);
                    events.push(
                        AuthEvent::new(AuthEventKind::AccountLocked, now)
                            .user(&guard)
                            .origin(origin)
                            .meta("failed_attempts", guard.failed_login_attempts)
                            .meta("reason", "max_failed_attempts"),
                    );
                }
                events.push(
                    failure("Invalid password")
                        .user_id(guard.id)
                        .meta("failed_attempts", guard.failed_login_attempts),
                );
                None
            } else if guard.is_password_expired(now) {
                events.push(failure("Password expired").user_id(guard.id));
                None
            } else {
                let mut updated = guard.clone();
                updated.failed_login_attempts = 0;
                updated.last_login = Some(now);
                updated.updated_at = now;
                self.store.update_user(&updated)?;
                *guard = updated;

                events.push(
                    AuthEvent::new(AuthEventKind::LoginSuccess, now)
                        .user(&guard)
                        .origin(origin),
                );
                Some(guard.clone())
            }
        };

        for event in events {
            self.audit.record(event)?;
        }

        let label = if outcome.is_some() { "success" } else { "failure" };
        metrics::counter!("sentinel_logins_total", "outcome" => label).increment(1);

        Ok(outcome)
    }

    // ==================== Lookup ====================

    pub fn get_user(&self, id: Uuid) -> Result<User> {
        Ok(self.handle(id)?.lock().clone())
    }

    pub fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self.handle_by_username(username)?.map(|h| h.lock().clone()))
    }

    pub fn list_users(&self, active_only: bool) -> Result<Vec<User>> {
        Ok(self
            .store
            .list_users()?
            .into_iter()
            .filter(|u| !active_only || u.is_active)
            .collect())
    }

    // ==================== Password management ====================

    /// Self-service password change; the current password must verify and the
    /// new one may not repeat the current or any remembered password.
    pub fn change_password(&self, user_id: Uuid, old_password: &str, new_password: &str) -> Result<User> {
        let current = self.get_user(user_id)?;
        if !self
            .hasher
            .verify(old_password, &current.salt, &current.password_hash)?
        {
            self.audit.record(
                self.event(AuthEventKind::PasswordChanged, &current, None)
                    .failed("Current password is incorrect"),
            )?;
            return Err(AppError::field(
                "old_password",
                "password_incorrect",
                "Current password is incorrect",
            ));
        }

        let mut errors = PasswordHasher::validate_password_policy(new_password, &self.policy);
        if errors.is_empty() && self.is_reused(&current, new_password)? {
            errors.push(FieldError::new(
                "password",
                "password_reused",
                format!(
                    "Password must differ from the last {} passwords",
                    self.policy.password_history
                ),
            ));
        }
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let (user, ()) = self.mutate(user_id, |user| self.replace_password(user, new_password, false))?;

        self.audit.record(
            self.event(AuthEventKind::PasswordChanged, &user, None).meta("self_service", true),
        )?;
        tracing::info!(user_id = %user.id, "Password changed");

        Ok(user)
    }

    /// Administrative reset: also clears the failure counter and unlocks.
    /// With `force_change` the new password is expired immediately.
    pub fn reset_password(
        &self,
        user_id: Uuid,
        new_password: &str,
        force_change: bool,
        actor: Option<&User>,
    ) -> Result<User> {
        let errors = PasswordHasher::validate_password_policy(new_password, &self.policy);
        if !errors.is_empty() {
            return Err(AppError::Validation(errors));
        }

        let (user, ()) = self.mutate(user_id, |user| {
            self.replace_password(user, new_password, force_change)?;
            user.failed_login_attempts = 0;
            user.is_locked = false;
            Ok(())
        })?;

        self.audit.record(
            self.event(AuthEventKind::PasswordChanged, &user, actor)
                .meta("admin_initiated", true)
                .meta("force_change", force_change),
        )?;
        tracing::info!(user_id = %user.id, force_change, "Password reset");

        Ok(user)
    }

    fn is_reused(&self, user: &User, candidate: &str) -> Result<bool> {
        if self.hasher.verify(candidate, &user.salt, &user.password_hash)? {
            return Ok(true);
        }
        for entry in user.password_history.iter().rev().take(self.policy.password_history) {
            if self.hasher.verify(candidate, &entry.salt, &entry.password_hash)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn replace_password(&self, user: &mut User, new_password: &str, force_change: bool) -> Result<()> {
        let now = self.clock.now();
        let salt = PasswordHasher::generate_salt();
        let hash = self.hasher.hash(new_password, &salt)?;

        user.password_history.push(PasswordHistoryEntry {
            password_hash: std::mem::replace(&mut user.password_hash, hash),
            salt: std::mem::replace(&mut user.salt, salt),
            changed_at: user.last_password_change,
        });
        let keep = self.policy.password_history;
        if user.password_history.len() > keep {
            let excess = user.password_history.len() - keep;
            user.password_history.drain(..excess);
        }

        user.last_password_change = now;
        user.must_change_password = force_change;
        user.password_expires_at = if force_change {
            now
        } else {
            now + Duration::days(self.policy.password_expiry_days)
        };
        Ok(())
    }

    // ==================== Account state ====================

    /// Returns the user and whether the state changed
    pub fn lock_user(&self, user_id: Uuid, reason: &str, actor: Option<&User>) -> Result<(User, bool)> {
        let (user, changed) = self.mutate(user_id, |user| {
            let changed = !user.is_locked;
            user.is_locked = true;
            Ok(changed)
        })?;
        if changed {
            self.audit.record(
                self.event(AuthEventKind::AccountLocked, &user, actor).meta("reason", reason),
            )?;
            tracing::info!(user_id = %user.id, reason, "Account locked");
        }
        Ok((user, changed))
    }

    pub fn unlock_user(&self, user_id: Uuid, reason: &str, actor: Option<&User>) -> Result<(User, bool)> {
        let (user, changed) = self.mutate(user_id, |user| {
            let changed = user.is_locked || user.failed_login_attempts > 0;
            user.is_locked = false;
            user.failed_login_attempts = 0;
            Ok(changed)
        })?;
        if changed {
            self.audit.record(
                self.event(AuthEventKind::AccountUnlocked, &user, actor).meta("reason", reason),
            )?;
            tracing::info!(user_id = %user.id, reason, "Account unlocked");
        }
        Ok((user, changed))
    }

    pub fn set_active(
        &self,
        user_id: Uuid,
        active: bool,
        reason: &str,
        actor: Option<&User>,
    ) -> Result<(User, bool)> {
        let (user, changed) = self.mutate(user_id, |user| {
            let changed = user.is_active != active;
            user.is_active = active;
            Ok(changed)
        })?;
        if changed {
            self.audit.record(
                self.event(AuthEventKind::UserUpdated, &user, actor)
                    .meta("is_active", active)
                    .meta("reason", reason),
            )?;
            tracing::info!(user_id = %user.id, active, reason, "Account activation changed");
        }
        Ok((user, changed))
    }

    pub fn deactivate_user(&self, user_id: Uuid, reason: &str, actor: Option<&User>) -> Result<User> {
        self.set_active(user_id, false, reason, actor).map(|(user, _)| user)
    }

    pub fn activate_user(&self, user_id: Uuid, reason: &str, actor: Option<&User>) -> Result<User> {
        self.set_active(user_id, true, reason, actor).map(|(user, _)| user)
    }

    // ==================== Roles ====================

    pub fn assign_role(&self, user_id: Uuid, role: Role, actor: Option<&User>) -> Result<User> {
        let (user, added) = self.mutate(user_id, |user| Ok(user.roles.insert(role)))?;
        if added {
            self.audit.record(
                self.event(AuthEventKind::RoleAssigned, &user, actor).meta("role", role.as_str()),
            )?;
            tracing::info!(user_id = %user.id, role = role.as_str(), "Role assigned");
        }
        Ok(user)
    }

    /// Refuses to remove the last remaining role
    pub fn revoke_role(&self, user_id: Uuid, role: Role, actor: Option<&User>) -> Result<User> {
        let (user, removed) = self.mutate(user_id, |user| {
            if !user.roles.contains(&role) {
                return Ok(false);
            }
            if user.roles.len() == 1 {
                return Err(AppError::field(
                    "roles",
                    "last_role",
                    "Cannot revoke the last role from a user",
                ));
            }
            Ok(user.roles.remove(&role))
        })?;
        if removed {
            self.audit.record(
                self.event(AuthEventKind::RoleRevoked, &user, actor).meta("role", role.as_str()),
            )?;
            tracing::info!(user_id = %user.id, role = role.as_str(), "Role revoked");
        }
        Ok(user)
    }

    // ==================== Profile ====================

    /// Update email, activation flag and metadata
    pub fn update_user(&self, user_id: Uuid, request: UpdateUserRequest, actor: Option<&User>) -> Result<User> {
        request.validate()?;

        if let Some(email) = &request.email {
            if let Some(existing) = self.store.find_user_by_email(email)? {
                if existing.id != user_id {
                    return Err(AppError::field("email", "email_taken", "Email already registered"));
                }
            }
        }

        let (user, changes) = self.mutate(user_id, |user| {
            let mut changes = Vec::new();
            if let Some(email) = request.email {
                if user.email != email {
                    user.email = email;
                    changes.push("email");
                }
            }
            if let Some(active) = request.is_active {
                if user.is_active != active {
                    user.is_active = active;
                    changes.push("is_active");
                }
            }
            if let Some(metadata) = request.metadata {
                if user.metadata != metadata {
                    user.metadata = metadata;
                    changes.push("metadata");
                }
            }
            Ok(changes)
        })?;

        if !changes.is_empty() {
            self.audit.record(
                self.event(AuthEventKind::UserUpdated, &user, actor).meta("changes", changes.clone()),
            )?;
            tracing::info!(user_id = %user.id, changes = ?changes, "User updated");
        }

        Ok(user)
    }

    /// Replace the metadata map wholesale
    pub fn update_metadata(
        &self,
        user_id: Uuid,
        metadata: BTreeMap<String, serde_json::Value>,
        actor: Option<&User>,
    ) -> Result<User> {
        self.update_user(
            user_id,
            UpdateUserRequest {
                metadata: Some(metadata),
                ..Default::default()
            },
            actor,
        )
    }
}
