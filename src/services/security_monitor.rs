//! 安全监控
//! 订阅审计链上的每条记录，在有界的最近事件窗口上运行检测规则，
//! 命中时生成 SecurityIncident 并通知处理器。

use crate::{
    clock::SharedClock,
    config::MonitorConfig,
    error::{AppError, Result},
    models::{
        audit::{AuditRecord, AuthEvent, AuthEventKind},
        incident::{IncidentKind, IncidentStatus, SecurityIncident, Severity},
        session::Origin,
    },
    repository::SharedStore,
    services::audit_service::AuditObserver,
};
use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use uuid::Uuid;

/// Incident callback
pub type IncidentHandler = Arc<dyn Fn(&SecurityIncident) + Send + Sync>;

#[derive(Debug, Clone)]
struct WindowEntry {
    kind: AuthEventKind,
    user_id: Option<Uuid>,
    origin_ip: Option<String>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct MonitorState {
    window: VecDeque<WindowEntry>,
    // (规则, 主体) -> 最近一次告警时间
    last_raised: HashMap<(IncidentKind, String), DateTime<Utc>>,
}

pub struct SecurityMonitor {
    config: MonitorConfig,
    store: SharedStore,
    clock: SharedClock,
    state: Mutex<MonitorState>,
    handlers: RwLock<Vec<IncidentHandler>>,
}

impl SecurityMonitor {
    pub fn new(config: &MonitorConfig, store: SharedStore, clock: SharedClock) -> Self {
        Self {
            config: config.clone(),
            store,
            clock,
            state: Mutex::new(MonitorState::default()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn add_handler(&self, handler: impl Fn(&SecurityIncident) + Send + Sync + 'static) {
        self.handlers.write().push(Arc::new(handler));
    }

    /// Feed one event through the detectors; returns the incidents raised
    pub fn analyze(&self, event: &AuthEvent) -> Result<Vec<SecurityIncident>> {
        let raised = {
            let mut state = self.state.lock();
            self.push(&mut state, event);

            let candidates = [
                self.check_brute_force(&state, event),
                self.check_permission_flooding(&state, event),
                self.check_origin_hyperactivity(&state, event),
                self.check_multi_origin_login(&state, event),
            ];

            let mut raised = Vec::new();
            for (subject, window, incident) in candidates.into_iter().flatten() {
                let key = (incident.kind, subject);
                if let Some(last) = state.last_raised.get(&key) {
                    if event.timestamp - *last < window {
                        continue;
                    }
                }
                self.store.save_incident(&incident)?;
                state.last_raised.insert(key, event.timestamp);
                raised.push(incident);
            }
            raised
        };

        if !raised.is_empty() {
            let handlers = self.handlers.read().clone();
            for incident in &raised {
                metrics::counter!(
                    "sentinel_security_incidents_total",
                    "kind" => incident.kind.as_str(),
                    "severity" => incident.severity.as_str()
                )
                .increment(1);
                tracing::warn!(
                    incident_id = %incident.id,
                    kind = incident.kind.as_str(),
                    severity = incident.severity.as_str(),
                    description = %incident.description,
                    "Security incident detected"
                );
                for handler in &handlers {
                    handler(incident);
                }
            }
        }

        Ok(raised)
    }

    fn push(&self, state: &mut MonitorState, event: &AuthEvent) {
        state.window.push_back(WindowEntry {
            kind: event.kind,
            user_id: event.user_id,
            origin_ip: event.origin_ip.clone(),
            timestamp: event.timestamp,
        });

        let horizon = event.timestamp - Duration::seconds(self.config.window_max_age_secs);
        while state
            .window
            .front()
            .map_or(false, |e| e.timestamp < horizon)
        {
            state.window.pop_front();
        }
        while state.window.len() > self.config.window_capacity {
            state.window.pop_front();
        }

        let longest = [
            self.config.failed_login_window_secs,
            self.config.permission_violation_window_secs,
            self.config.origin_activity_window_secs,
            self.config.distinct_login_window_secs,
            self.config.window_max_age_secs,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        let cutoff = event.timestamp - Duration::seconds(longest);
        state.last_raised.retain(|_, at| *at >= cutoff);
    }

    fn recent<'a>(
        state: &'a MonitorState,
        now: DateTime<Utc>,
        window: Duration,
    ) -> impl Iterator<Item = &'a WindowEntry> {
        let since = now - window;
        state.window.iter().filter(move |e| e.timestamp >= since)
    }

    fn incident(
        &self,
        kind: IncidentKind,
        severity: Severity,
        event: &AuthEvent,
        description: String,
        evidence: serde_json::Value,
    ) -> SecurityIncident {
        SecurityIncident {
            id: Uuid::new_v4(),
            kind,
            severity,
            user_id: event.user_id,
            origin_ip: event.origin_ip.clone(),
            description,
            evidence,
            detected_at: self.clock.now(),
            status: IncidentStatus::Open,
            assigned_to: None,
            resolution_notes: None,
            resolved_at: None,
        }
    }

    fn check_brute_force(
        &self,
        state: &MonitorState,
        event: &AuthEvent,
    ) -> Option<(String, Duration, SecurityIncident)> {
        if event.kind != AuthEventKind::LoginFailure {
            return None;
        }
        let ip = event.origin_ip.as_deref()?;
        let window = Duration::seconds(self.config.failed_login_window_secs);
        let failures = Self::recent(state, event.timestamp, window)
            .filter(|e| e.kind == AuthEventKind::LoginFailure && e.origin_ip.as_deref() == Some(ip))
            .count();
        if failures < self.config.failed_login_threshold {
            return None;
        }

        let incident = self.incident(
            IncidentKind::BruteForce,
            Severity::High,
            event,
            format!(
                "{} failed logins from {} within {} minutes",
                failures,
                ip,
                window.num_minutes()
            ),
            json!({
                "failed_attempts": failures,
                "window_secs": window.num_seconds(),
                "threshold": self.config.failed_login_threshold,
                "latest_event_id": event.event_id,
                "username": event.username,
            }),
        );
        Some((ip.to_string(), window, incident))
    }

    fn check_permission_flooding(
        &self,
        state: &MonitorState,
        event: &AuthEvent,
    ) -> Option<(String, Duration, SecurityIncident)> {
        if event.kind != AuthEventKind::PermissionDenied {
            return None;
        }
        let user_id = event.user_id?;
        let window = Duration::seconds(self.config.permission_violation_window_secs);
        let denials = Self::recent(state, event.timestamp, window)
            .filter(|e| e.kind == AuthEventKind::PermissionDenied && e.user_id == Some(user_id))
            .count();
        if denials < self.config.permission_violation_threshold {
            return None;
        }

        let incident = self.incident(
            IncidentKind::PermissionFlooding,
            Severity::Medium,
            event,
            format!(
                "{} permission denials for user {} within {} minutes",
                denials,
                event.username.as_deref().unwrap_or("unknown"),
                window.num_minutes()
            ),
            json!({
                "violations": denials,
                "window_secs": window.num_seconds(),
                "threshold": self.config.permission_violation_threshold,
                "permission": event.permission,
                "resource": event.resource,
            }),
        );
        Some((user_id.to_string(), window, incident))
    }

    fn check_origin_hyperactivity(
        &self,
        state: &MonitorState,
        event: &AuthEvent,
    ) -> Option<(String, Duration, SecurityIncident)> {
        let ip = event.origin_ip.as_deref()?;
        if ip == Origin::internal().ip {
            return None;
        }
        let window = Duration::seconds(self.config.origin_activity_window_secs);
        let total = Self::recent(state, event.timestamp, window)
            .filter(|e| e.origin_ip.as_deref() == Some(ip))
            .count();
        if total < self.config.origin_activity_threshold {
            return None;
        }

        let mut incident = self.incident(
            IncidentKind::OriginHyperactivity,
            Severity::Medium,
            event,
            format!(
                "{} events from {} within {} minutes",
                total,
                ip,
                window.num_minutes()
            ),
            json!({
                "total_events": total,
                "window_secs": window.num_seconds(),
                "threshold": self.config.origin_activity_threshold,
            }),
        );
        incident.user_id = None;
        Some((ip.to_string(), window, incident))
    }

    fn check_multi_origin_login(
        &self,
        state: &MonitorState,
        event: &AuthEvent,
    ) -> Option<(String, Duration, SecurityIncident)> {
        if event.kind != AuthEventKind::LoginSuccess {
            return None;
        }
        let user_id = event.user_id?;
        let window = Duration::seconds(self.config.distinct_login_window_secs);
        let origins: BTreeSet<&str> = Self::recent(state, event.timestamp, window)
            .filter(|e| e.kind == AuthEventKind::LoginSuccess && e.user_id == Some(user_id))
            .filter_map(|e| e.origin_ip.as_deref())
            .collect();
        if origins.len() <= self.config.distinct_login_origins {
            return None;
        }

        let incident = self.incident(
            IncidentKind::MultiOriginLogin,
            Severity::High,
            event,
            format!(
                "User {} logged in from {} distinct origins within {} minutes",
                event.username.as_deref().unwrap_or("unknown"),
                origins.len(),
                window.num_minutes()
            ),
            json!({
                "unique_origins": origins,
                "window_secs": window.num_seconds(),
                "current_origin": event.origin_ip,
            }),
        );
        Some((user_id.to_string(), window, incident))
    }

    /// Triage an incident. A closed incident cannot be moved to another status.
    pub fn update_incident(
        &self,
        id: Uuid,
        status: IncidentStatus,
        assignee: Option<&str>,
        notes: Option<&str>,
    ) -> Result<SecurityIncident> {
        let _guard = self.state.lock();
        let mut incident = self
            .store
            .get_incident(id)?
            .ok_or_else(|| AppError::not_found("incident"))?;

        if incident.status.is_closed() && incident.status != status {
            return Err(AppError::Conflict(format!(
                "incident {} is already closed",
                id
            )));
        }

        incident.status = status;
        if let Some(assignee) = assignee {
            incident.assigned_to = Some(assignee.to_string());
        }
        if let Some(notes) = notes {
            incident.resolution_notes = Some(notes.to_string());
        }
        if status.is_closed() && incident.resolved_at.is_none() {
            incident.resolved_at = Some(self.clock.now());
        }
        self.store.save_incident(&incident)?;

        tracing::info!(
            incident_id = %id,
            status = ?status,
            assignee = ?incident.assigned_to,
            "Security incident updated"
        );
        Ok(incident)
    }

    /// Incidents newest first, optionally filtered by status
    pub fn incidents(&self, status: Option<IncidentStatus>) -> Result<Vec<SecurityIncident>> {
        let mut incidents: Vec<_> = self
            .store
            .list_incidents()?
            .into_iter()
            .filter(|i| status.map_or(true, |s| i.status == s))
            .collect();
        incidents.sort_by(|a, b| b.detected_at.cmp(&a.detected_at));
        Ok(incidents)
    }
}

impl AuditObserver for SecurityMonitor {
    fn observe(&self, record: &AuditRecord) {
        if let Err(e) = self.analyze(&record.event) {
            tracing::error!(
                sequence = record.sequence,
                error = %e,
                "Security monitor failed to process event"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::repository::MemoryStore;
    use crate::services::AuditService;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> MonitorConfig {
        MonitorConfig {
            failed_login_threshold: 5,
            failed_login_window_secs: 15 * 60,
            permission_violation_threshold: 10,
            permission_violation_window_secs: 3600,
            origin_activity_threshold: 20,
            origin_activity_window_secs: 3600,
            distinct_login_origins: 3,
            distinct_login_window_secs: 30 * 60,
            window_capacity: 1000,
            window_max_age_secs: 3600,
        }
    }

    fn setup() -> (ManualClock, Arc<AuditService>, Arc<SecurityMonitor>) {
        let clock = ManualClock::starting_now();
        let store: SharedStore = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditService::new(store.clone(), Arc::new(clock.clone())).unwrap());
        let monitor = Arc::new(SecurityMonitor::new(&config(), store, Arc::new(clock.clone())));
        audit.subscribe(monitor.clone());
        (clock, audit, monitor)
    }

    fn failure(clock: &ManualClock, ip: &str) -> AuthEvent {
        AuthEvent::new(AuthEventKind::LoginFailure, clock.now())
            .username("alice")
            .origin(&Origin::new(ip, None))
            .failed("Invalid password")
    }

    #[test]
    fn test_brute_force_raised_once_per_window() {
        let (clock, audit, monitor) = setup();
        for _ in 0..4 {
            audit.record(failure(&clock, "10.0.0.9")).unwrap();
            clock.advance(Duration::seconds(10));
        }
        assert!(monitor.incidents(None).unwrap().is_empty());

        audit.record(failure(&clock, "10.0.0.9")).unwrap();
        audit.record(failure(&clock, "10.0.0.9")).unwrap();

        let incidents = monitor.incidents(None).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].kind, IncidentKind::BruteForce);
        assert_eq!(incidents[0].severity, Severity::High);
        assert_eq!(incidents[0].evidence["failed_attempts"], 5);

        // 窗口过后重新计数
        clock.advance(Duration::minutes(16));
        for _ in 0..5 {
            audit.record(failure(&clock, "10.0.0.9")).unwrap();
        }
        assert_eq!(monitor.incidents(None).unwrap().len(), 2);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let (clock, _audit, monitor) = setup();
        for _ in 0..5 {
            assert!(monitor.analyze(&failure(&clock, "10.0.0.7")).unwrap().is_empty());
            clock.advance(Duration::minutes(4));
        }
    }

    #[test]
    fn test_permission_flooding() {
        let (clock, _audit, monitor) = setup();
        let user_id = Uuid::new_v4();
        let mut raised = Vec::new();
        for _ in 0..10 {
            let event = AuthEvent::new(AuthEventKind::PermissionDenied, clock.now())
                .user_id(user_id)
                .origin(&Origin::internal())
                .failed("Permission denied");
            raised.extend(monitor.analyze(&event).unwrap());
        }
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, IncidentKind::PermissionFlooding);
        assert_eq!(raised[0].severity, Severity::Medium);
        assert_eq!(raised[0].user_id, Some(user_id));
    }

    #[test]
    fn test_origin_hyperactivity_ignores_internal_origin() {
        let (clock, _audit, monitor) = setup();
        for _ in 0..25 {
            let event = AuthEvent::new(AuthEventKind::SessionCreated, clock.now())
                .origin(&Origin::internal());
            assert!(monitor.analyze(&event).unwrap().is_empty());
        }

        let mut raised = Vec::new();
        for _ in 0..20 {
            let event = AuthEvent::new(AuthEventKind::SessionCreated, clock.now())
                .origin(&Origin::new("203.0.113.5", None));
            raised.extend(monitor.analyze(&event).unwrap());
        }
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].kind, IncidentKind::OriginHyperactivity);
        assert_eq!(raised[0].origin_ip.as_deref(), Some("203.0.113.5"));
    }

    #[test]
    fn test_multi_origin_login_and_handlers() {
        let (clock, audit, monitor) = setup();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        monitor.add_handler(move |incident| {
            if incident.kind == IncidentKind::MultiOriginLogin {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let user_id = Uuid::new_v4();
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.3"] {
            audit
                .record(
                    AuthEvent::new(AuthEventKind::LoginSuccess, clock.now())
                        .user_id(user_id)
                        .origin(&Origin::new(ip, None)),
                )
                .unwrap();
            clock.advance(Duration::minutes(1));
        }
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        audit
            .record(
                AuthEvent::new(AuthEventKind::LoginSuccess, clock.now())
                    .user_id(user_id)
                    .origin(&Origin::new("10.0.0.4", None)),
            )
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        let incident = &monitor.incidents(Some(IncidentStatus::Open)).unwrap()[0];
        assert_eq!(incident.severity, Severity::High);
        assert_eq!(incident.evidence["unique_origins"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn test_update_incident_transitions() {
        let (clock, _audit, monitor) = setup();
        let mut raised = Vec::new();
        for _ in 0..5 {
            raised.extend(monitor.analyze(&failure(&clock, "10.0.0.8")).unwrap());
        }
        let id = raised[0].id;

        let investigating = monitor
            .update_incident(id, IncidentStatus::Investigating, Some("secops"), None)
            .unwrap();
        assert_eq!(investigating.assigned_to.as_deref(), Some("secops"));
        assert!(investigating.resolved_at.is_none());

        clock.advance(Duration::minutes(5));
        let resolved = monitor
            .update_incident(id, IncidentStatus::Resolved, None, Some("blocked at edge"))
            .unwrap();
        assert_eq!(resolved.resolved_at, Some(clock.now()));
        assert_eq!(resolved.assigned_to.as_deref(), Some("secops"));

        let err = monitor
            .update_incident(id, IncidentStatus::Open, None, None)
            .unwrap_err();
        assert_eq!(err.code(), "conflict");

        assert!(monitor.incidents(Some(IncidentStatus::Open)).unwrap().is_empty());
        assert_eq!(monitor.incidents(Some(IncidentStatus::Resolved)).unwrap().len(), 1);

        let missing = monitor
            .update_incident(Uuid::new_v4(), IncidentStatus::Resolved, None, None)
            .unwrap_err();
        assert_eq!(missing.code(), "not_found");
    }
}
