//! Service wiring
//!
//! [`AppState`] builds every service over one store and one clock and
//! subscribes the security monitor to the audit chain. Services are held in
//! `Arc` so request handlers and background workers share them.

use crate::{
    auth::JwtService,
    clock::{SharedClock, SystemClock},
    config::AppConfig,
    error::Result,
    repository::{open_store, SharedStore},
    services::{
        AuditService, AuthService, ComplianceAuditor, CredentialService, PermissionService,
        SecurityMonitor, SessionService, UserAdminService,
    },
};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub store: SharedStore,
    pub clock: SharedClock,
    pub audit: Arc<AuditService>,
    pub monitor: Arc<SecurityMonitor>,
    pub credentials: Arc<CredentialService>,
    pub sessions: Arc<SessionService>,
    pub tokens: Arc<JwtService>,
    pub permissions: Arc<PermissionService>,
    pub auth: Arc<AuthService>,
    pub admin: Arc<UserAdminService>,
    pub compliance: Arc<ComplianceAuditor>,
}

impl AppState {
    /// Open the configured store and run on the system clock
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let store = open_store(&config.storage)?;
        Self::build(config, store, Arc::new(SystemClock))
    }

    pub fn build(config: AppConfig, store: SharedStore, clock: SharedClock) -> Result<Self> {
        let audit = Arc::new(AuditService::new(store.clone(), clock.clone())?);

        let monitor = Arc::new(SecurityMonitor::new(&config.monitor, store.clone(), clock.clone()));
        audit.subscribe(monitor.clone());

        let credentials = Arc::new(CredentialService::new(&config.security, store.clone(), audit.clone())?);
        let sessions = Arc::new(SessionService::new(&config.session, store.clone(), audit.clone())?);
        let tokens = Arc::new(JwtService::new(&config.token, store.clone(), audit.clone())?);
        let permissions = Arc::new(PermissionService::new(&config.access, audit.clone()));

        let auth = Arc::new(AuthService::new(
            credentials.clone(),
            sessions.clone(),
            tokens.clone(),
            permissions.clone(),
            audit.clone(),
        ));
        let admin = Arc::new(UserAdminService::new(
            credentials.clone(),
            permissions.clone(),
            sessions.clone(),
            tokens.clone(),
        ));
        let compliance = Arc::new(ComplianceAuditor::new(audit.clone(), monitor.clone()));

        tracing::info!(
            backend = store.backend_name(),
            active_kid = ?tokens.active_kid(),
            "Services initialized"
        );

        Ok(Self {
            config,
            store,
            clock,
            audit,
            monitor,
            credentials,
            sessions,
            tokens,
            permissions,
            auth,
            admin,
            compliance,
        })
    }
}
