//! 认证服务：登录、登出、令牌刷新
//! 组合凭据、会话、令牌与权限服务，对外提供一次调用完成的认证流程。

use crate::{
    auth::jwt::{JwtService, TokenPair},
    error::Result,
    models::{
        audit::{AuthEvent, AuthEventKind},
        role::Permission,
        session::{Origin, Session},
        token::TokenType,
        user::{User, UserResponse},
    },
    services::{
        audit_service::AuditService,
        credential_service::CredentialService,
        permission_service::{PermissionContext, PermissionService},
        session_service::SessionService,
    },
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct LoginResponse {
    pub user: UserResponse,
    pub session_id: Uuid,
    pub session_token: String,
    pub csrf_token: String,
    #[serde(flatten)]
    pub tokens: TokenPair,
}

pub struct AuthService {
    credentials: Arc<CredentialService>,
    sessions: Arc<SessionService>,
    tokens: Arc<JwtService>,
    permissions: Arc<PermissionService>,
    audit: Arc<AuditService>,
}

impl AuthService {
    pub fn new(
        credentials: Arc<CredentialService>,
        sessions: Arc<SessionService>,
        tokens: Arc<JwtService>,
        permissions: Arc<PermissionService>,
        audit: Arc<AuditService>,
    ) -> Self {
        Self {
            credentials,
            sessions,
            tokens,
            permissions,
            audit,
        }
    }

    /// 用户登录
    ///
    /// `Ok(None)` when the credentials are refused. An attempt that locks the
    /// account also locks the user's sessions and revokes their tokens.
    pub fn login(&self, username: &str, password: &str, origin: &Origin) -> Result<Option<LoginResponse>> {
        let was_locked = self
            .credentials
            .find_by_username(username)?
            .map_or(false, |u| u.is_locked);

        let Some(user) = self.credentials.authenticate(username, password, origin)? else {
            if !was_locked {
                if let Some(user) = self.credentials.find_by_username(username)? {
                    if user.is_locked {
                        self.contain(&user, "account_locked")?;
                    }
                }
            }
            return Ok(None);
        };

        let session = self.sessions.create_session(&user, origin)?;
        let tokens = self.tokens.issue_token_pair(&user)?;

        tracing::info!(
            user_id = %user.id,
            session_id = %session.id,
            client_ip = %origin.ip,
            "User logged in"
        );

        Ok(Some(LoginResponse {
            user: UserResponse::from(&user),
            session_id: session.id,
            session_token: session.token,
            csrf_token: session.csrf_token,
            tokens,
        }))
    }

    /// 刷新令牌
    ///
    /// The presented refresh token is single use: it is revoked and a fresh
    /// pair is issued. Returns `Ok(None)` for any unusable token.
    pub fn refresh(&self, refresh_token: &str, origin: &Origin) -> Result<Option<TokenPair>> {
        let verdict = self.tokens.validate(refresh_token, Some(TokenType::Refresh))?;
        let Some(claims) = verdict.claims() else {
            return Ok(None);
        };
        let (Some(user_id), Some(jti)) = (claims.user_id(), claims.token_id()) else {
            return Ok(None);
        };

        let user = self.credentials.get_user(user_id)?;
        if !user.is_active || user.is_locked {
            self.tokens.revoke(jti, "account_unavailable")?;
            tracing::warn!(user_id = %user.id, client_ip = %origin.ip, "Refresh refused for unavailable account");
            return Ok(None);
        }

        // 并发刷新时只有一个请求能完成撤销
        if !self.tokens.revoke(jti, "rotated")? {
            return Ok(None);
        }
        let pair = self.tokens.issue_token_pair(&user)?;

        tracing::debug!(user_id = %user.id, client_ip = %origin.ip, "Token pair refreshed");
        Ok(Some(pair))
    }

    /// 登出
    ///
    /// Revokes the session and, when given, the refresh token presented with
    /// it. Returns false when the session was not active.
    pub fn logout(&self, session_token: &str, refresh_token: Option<&str>, origin: &Origin) -> Result<bool> {
        let Some(session) = self.sessions.validate_session(session_token, false)? else {
            return Ok(false);
        };
        if !self.sessions.revoke(session.id, "logout")? {
            return Ok(false);
        }

        if let Some(token) = refresh_token {
            if let Some(jti) = self
                .tokens
                .validate(token, Some(TokenType::Refresh))?
                .claims()
                .filter(|c| c.user_id() == Some(session.user_id))
                .and_then(|c| c.token_id())
            {
                self.tokens.revoke(jti, "logout")?;
            }
        }

        let mut event = AuthEvent::new(AuthEventKind::Logout, self.audit.clock().now())
            .user_id(session.user_id)
            .session(session.id)
            .origin(origin);
        if let Ok(user) = self.credentials.get_user(session.user_id) {
            event = event.username(&user.username);
        }
        self.audit.record(event)?;

        tracing::info!(user_id = %session.user_id, session_id = %session.id, "User logged out");
        Ok(true)
    }

    /// Resolve an active session to its user, refreshing its activity
    pub fn session_user(&self, session_token: &str) -> Result<Option<(Session, User)>> {
        let Some(session) = self.sessions.validate_session(session_token, true)? else {
            return Ok(None);
        };
        let user = self.credentials.get_user(session.user_id)?;
        if !user.is_active || user.is_locked {
            return Ok(None);
        }
        Ok(Some((session, user)))
    }

    /// Permission check on behalf of a session holder
    pub fn authorize_session(
        &self,
        session_token: &str,
        permission: Permission,
        resource: Option<&str>,
        context: Option<&PermissionContext>,
    ) -> Result<bool> {
        match self.session_user(session_token)? {
            Some((session, user)) => {
                let context = context.cloned().unwrap_or_else(|| PermissionContext::from_ip(&session.origin.ip));
                self.permissions.check(&user, permission, resource, Some(&context))
            }
            None => Ok(false),
        }
    }

    /// Permission check on behalf of a bearer token holder
    pub fn authorize_token(
        &self,
        access_token: &str,
        permission: Permission,
        resource: Option<&str>,
        context: Option<&PermissionContext>,
    ) -> Result<bool> {
        let Some(user_id) = self
            .tokens
            .validate(access_token, Some(TokenType::Access))?
            .claims()
            .and_then(|c| c.user_id())
        else {
            return Ok(false);
        };
        let user = self.credentials.get_user(user_id)?;
        self.permissions.check(&user, permission, resource, context)
    }

    /// Cut off every credential a user currently holds
    pub fn contain(&self, user: &User, reason: &str) -> Result<()> {
        let sessions = self.sessions.lock_sessions_for_user(user.id, reason)?;
        let tokens = self.tokens.revoke_all_for_user(user.id, None)?;
        tracing::warn!(
            user_id = %user.id,
            reason,
            sessions,
            tokens,
            "User credentials contained"
        );
        Ok(())
    }
}
