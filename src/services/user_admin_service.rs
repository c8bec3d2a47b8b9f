//! 账户管理服务
//! 在凭据服务之上增加操作者权限校验，并在账户状态变化时收回会话与令牌。

use crate::{
    auth::jwt::JwtService,
    error::{AppError, Result},
    models::{
        role::{Permission, Role},
        token::TokenType,
        user::{CreateUserRequest, UpdateUserRequest, User},
    },
    services::{
        credential_service::CredentialService,
        permission_service::PermissionService,
        session_service::SessionService,
    },
};
use std::sync::Arc;
use uuid::Uuid;

pub struct UserAdminService {
    credentials: Arc<CredentialService>,
    permissions: Arc<PermissionService>,
    sessions: Arc<SessionService>,
    tokens: Arc<JwtService>,
}

impl UserAdminService {
    pub fn new(
        credentials: Arc<CredentialService>,
        permissions: Arc<PermissionService>,
        sessions: Arc<SessionService>,
        tokens: Arc<JwtService>,
    ) -> Self {
        Self {
            credentials,
            permissions,
            sessions,
            tokens,
        }
    }

    fn require(&self, actor: &User, permission: Permission, target: Option<Uuid>) -> Result<()> {
        let resource = target.map(|id| format!("user:{}", id));
        self.permissions
            .require(actor, permission, resource.as_deref(), None)
    }

    fn require_admin_for(&self, actor: &User, role: Role) -> Result<()> {
        if role == Role::Administrator && !actor.has_role(Role::Administrator) {
            tracing::warn!(
                actor_id = %actor.id,
                "Non-administrator attempted to grant the administrator role"
            );
            return Err(AppError::Forbidden(
                "only an administrator can grant the administrator role".to_string(),
            ));
        }
        Ok(())
    }

    fn revoke_credentials(&self, user_id: Uuid, reason: &str) -> Result<()> {
        let sessions = self.sessions.revoke_all_for_user(user_id, None, reason)?;
        let tokens = self.tokens.revoke_all_for_user(user_id, None)?;
        tracing::info!(%user_id, reason, sessions, tokens, "User credentials revoked");
        Ok(())
    }

    pub fn create_user(&self, actor: &User, request: CreateUserRequest) -> Result<User> {
        self.require(actor, Permission::UserManage, None)?;
        for role in &request.roles {
            self.require_admin_for(actor, *role)?;
        }
        self.credentials.create_user(request, Some(actor))
    }

    pub fn get_user(&self, actor: &User, user_id: Uuid) -> Result<User> {
        if actor.id != user_id {
            self.require(actor, Permission::UserManage, Some(user_id))?;
        }
        self.credentials.get_user(user_id)
    }

    pub fn list_users(&self, actor: &User, active_only: bool) -> Result<Vec<User>> {
        self.require(actor, Permission::UserManage, None)?;
        self.credentials.list_users(active_only)
    }

    pub fn update_user(&self, actor: &User, user_id: Uuid, request: UpdateUserRequest) -> Result<User> {
        self.require(actor, Permission::UserManage, Some(user_id))?;
        let deactivating = request.is_active == Some(false);
        let user = self.credentials.update_user(user_id, request, Some(actor))?;
        if deactivating {
            self.revoke_credentials(user_id, "account_deactivated")?;
        }
        Ok(user)
    }

    /// Administrative reset; every existing session and token of the user is revoked
    pub fn reset_password(
        &self,
        actor: &User,
        user_id: Uuid,
        new_password: &str,
        force_change: bool,
    ) -> Result<User> {
        self.require(actor, Permission::UserManage, Some(user_id))?;
        let user = self
            .credentials
            .reset_password(user_id, new_password, force_change, Some(actor))?;
        self.revoke_credentials(user_id, "password_reset")?;
        Ok(user)
    }

    pub fn lock_user(&self, actor: &User, user_id: Uuid, reason: &str) -> Result<User> {
        self.require(actor, Permission::UserManage, Some(user_id))?;
        let (user, _) = self.credentials.lock_user(user_id, reason, Some(actor))?;
        self.sessions.lock_sessions_for_user(user_id, reason)?;
        self.tokens.revoke_all_for_user(user_id, None)?;
        Ok(user)
    }

    pub fn unlock_user(&self, actor: &User, user_id: Uuid, reason: &str) -> Result<User> {
        self.require(actor, Permission::UserManage, Some(user_id))?;
        let (user, _) = self.credentials.unlock_user(user_id, reason, Some(actor))?;
        Ok(user)
    }

    pub fn set_active(&self, actor: &User, user_id: Uuid, active: bool, reason: &str) -> Result<User> {
        self.require(actor, Permission::UserManage, Some(user_id))?;
        let (user, changed) = self.credentials.set_active(user_id, active, reason, Some(actor))?;
        if changed && !active {
            self.revoke_credentials(user_id, reason)?;
        }
        Ok(user)
    }

    /// Role changes invalidate access tokens, whose claims carry the old role set
    pub fn assign_role(&self, actor: &User, user_id: Uuid, role: Role) -> Result<User> {
        self.require(actor, Permission::RoleManage, Some(user_id))?;
        self.require_admin_for(actor, role)?;
        let user = self.credentials.assign_role(user_id, role, Some(actor))?;
        self.tokens.revoke_all_for_user(user_id, Some(TokenType::Access))?;
        Ok(user)
    }

    pub fn revoke_role(&self, actor: &User, user_id: Uuid, role: Role) -> Result<User> {
        self.require(actor, Permission::RoleManage, Some(user_id))?;
        self.require_admin_for(actor, role)?;
        let user = self.credentials.revoke_role(user_id, role, Some(actor))?;
        self.tokens.revoke_all_for_user(user_id, Some(TokenType::Access))?;
        Ok(user)
    }

    /// Self-service change; other sessions and all refresh tokens are revoked
    pub fn change_own_password(
        &self,
        user: &User,
        old_password: &str,
        new_password: &str,
        current_session: Option<Uuid>,
    ) -> Result<User> {
        let updated = self
            .credentials
            .change_password(user.id, old_password, new_password)?;
        self.sessions
            .revoke_all_for_user(user.id, current_session, "password_changed")?;
        self.tokens
            .revoke_all_for_user(user.id, Some(TokenType::Refresh))?;
        Ok(updated)
    }
}
