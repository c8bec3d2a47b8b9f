//! 权限检查服务
//!
//! 基线为静态的角色→权限表；上下文规则只在基线通过后运行，且只能进一步收紧。
//! 唯一的例外是资源所有者：owner_id 等于当前用户时无论角色如何都放行。
//! 每次评估都会写入一条 Granted/Denied 审计事件。

use crate::{
    clock::SharedClock,
    config::AccessConfig,
    error::{AppError, Result},
    models::{AuthEvent, AuthEventKind, Origin, Permission, Role, User},
    services::audit_service::AuditService,
};
use chrono::{Datelike, Timelike, Weekday};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Caller-supplied predicate evaluated after every other rule
pub type CustomRule = Arc<dyn Fn(&User, Permission) -> bool + Send + Sync>;

/// Per-request evaluation context
#[derive(Clone, Default)]
pub struct PermissionContext {
    /// Owner of the resource being accessed
    pub owner_id: Option<Uuid>,
    pub client_ip: Option<String>,
    /// When set, `client_ip` must be one of these
    pub allowed_ips: Option<Vec<String>>,
    pub require_business_hours: bool,
    pub custom: Option<CustomRule>,
    pub trace_id: Option<String>,
}

impl fmt::Debug for PermissionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PermissionContext")
            .field("owner_id", &self.owner_id)
            .field("client_ip", &self.client_ip)
            .field("allowed_ips", &self.allowed_ips)
            .field("require_business_hours", &self.require_business_hours)
            .field("custom", &self.custom.is_some())
            .field("trace_id", &self.trace_id)
            .finish()
    }
}

impl PermissionContext {
    pub fn owned_by(owner_id: Uuid) -> Self {
        Self {
            owner_id: Some(owner_id),
            ..Default::default()
        }
    }

    pub fn from_ip(client_ip: &str) -> Self {
        Self {
            client_ip: Some(client_ip.to_string()),
            ..Default::default()
        }
    }

    pub fn allow_ips(mut self, ips: &[&str]) -> Self {
        self.allowed_ips = Some(ips.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn business_hours(mut self) -> Self {
        self.require_business_hours = true;
        self
    }

    pub fn with_rule(mut self, rule: impl Fn(&User, Permission) -> bool + Send + Sync + 'static) -> Self {
        self.custom = Some(Arc::new(rule));
        self
    }

    pub fn trace(mut self, trace_id: &str) -> Self {
        self.trace_id = Some(trace_id.to_string());
        self
    }
}

/// Outcome of one evaluation with the rule that decided it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Granted(&'static str),
    Denied(&'static str),
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Decision::Granted(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Decision::Granted(r) | Decision::Denied(r) => r,
        }
    }
}

pub struct PermissionService {
    audit: Arc<AuditService>,
    clock: SharedClock,
    access: AccessConfig,
}

impl PermissionService {
    pub fn new(access: &AccessConfig, audit: Arc<AuditService>) -> Self {
        Self {
            clock: audit.clock().clone(),
            audit,
            access: access.clone(),
        }
    }

    /// Pure evaluation, no audit side effect
    pub fn evaluate(
        &self,
        user: &User,
        permission: Permission,
        context: Option<&PermissionContext>,
    ) -> Decision {
        if !user.is_active {
            return Decision::Denied("account_inactive");
        }
        if user.is_locked {
            return Decision::Denied("account_locked");
        }

        if let Some(ctx) = context {
            if ctx.owner_id == Some(user.id) {
                return Decision::Granted("resource_owner");
            }
        }

        if !user.has_permission(permission) {
            return Decision::Denied("role_lacks_permission");
        }

        let Some(ctx) = context else {
            return Decision::Granted("role");
        };

        if ctx.require_business_hours && !self.within_business_hours() {
            return Decision::Denied("outside_business_hours");
        }

        if let Some(allowed) = &ctx.allowed_ips {
            match &ctx.client_ip {
                Some(ip) if allowed.iter().any(|a| a == ip) => {}
                _ => return Decision::Denied("ip_not_allowed"),
            }
        }

        if let Some(rule) = &ctx.custom {
            if !rule(user, permission) {
                return Decision::Denied("custom_rule");
            }
        }

        Decision::Granted("role")
    }

    fn within_business_hours(&self) -> bool {
        let now = self.clock.now();
        let weekend = matches!(now.weekday(), Weekday::Sat | Weekday::Sun);
        let hour = now.hour();
        !weekend && hour >= self.access.business_hours_start && hour < self.access.business_hours_end
    }

    /// 检查用户是否拥有权限
    pub fn check(
        &self,
        user: &User,
        permission: Permission,
        resource: Option<&str>,
        context: Option<&PermissionContext>,
    ) -> Result<bool> {
        let decision = self.evaluate(user, permission, context);

        let kind = if decision.is_granted() {
            AuthEventKind::PermissionGranted
        } else {
            AuthEventKind::PermissionDenied
        };
        let origin = context
            .and_then(|c| c.client_ip.as_deref())
            .map(|ip| Origin::new(ip, None))
            .unwrap_or_else(Origin::internal);

        let mut event = AuthEvent::new(kind, self.clock.now())
            .user(user)
            .origin(&origin)
            .permission(permission)
            .resource(resource)
            .trace(context.and_then(|c| c.trace_id.as_deref()))
            .meta("reason", decision.reason())
            .meta(
                "user_roles",
                user.roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
            );
        if !decision.is_granted() {
            event = event.failed(&format!("Permission denied: {}", decision.reason()));
        }
        self.audit.record(event)?;

        let outcome = if decision.is_granted() { "granted" } else { "denied" };
        metrics::counter!("sentinel_permission_checks_total", "outcome" => outcome).increment(1);

        if !decision.is_granted() {
            tracing::debug!(
                user_id = %user.id,
                permission = permission.as_str(),
                reason = decision.reason(),
                "Permission denied"
            );
        }

        Ok(decision.is_granted())
    }

    /// 检查权限，如果无权限则返回错误
    pub fn require(
        &self,
        user: &User,
        permission: Permission,
        resource: Option<&str>,
        context: Option<&PermissionContext>,
    ) -> Result<()> {
        if !self.check(user, permission, resource, context)? {
            tracing::warn!(
                user_id = %user.id,
                permission = permission.as_str(),
                resource = resource.unwrap_or("-"),
                "Permission denied"
            );
            return Err(AppError::Forbidden(format!(
                "{} does not have permission {}",
                user.username, permission
            )));
        }
        Ok(())
    }

    /// OR over `check`, stopping at the first grant
    pub fn has_any(
        &self,
        user: &User,
        permissions: &[Permission],
        context: Option<&PermissionContext>,
    ) -> Result<bool> {
        for permission in permissions {
            if self.check(user, *permission, None, context)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// AND over `check`, stopping at the first denial
    pub fn has_all(
        &self,
        user: &User,
        permissions: &[Permission],
        context: Option<&PermissionContext>,
    ) -> Result<bool> {
        for permission in permissions {
            if !self.check(user, *permission, None, context)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn user_permissions(&self, user: &User) -> BTreeSet<Permission> {
        user.permissions()
    }

    pub fn role_permissions(&self, role: Role) -> BTreeSet<Permission> {
        role.permissions().iter().copied().collect()
    }

    /// Viewer < Auditor < Operator < Administrator
    pub fn has_role_at_least(&self, user: &User, role: Role) -> bool {
        user.highest_role_level() >= role.level()
    }
}
