//! Compliance reporting over the audit chain and incident history

use crate::{
    error::Result,
    models::{
        audit::{AuditFilter, AuthEvent, AuthEventKind},
        incident::Severity,
        session::Origin,
    },
    services::{audit_service::AuditService, security_monitor::SecurityMonitor},
};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use uuid::Uuid;

/// Login failures from one origin above which it is listed as suspicious
const SUSPICIOUS_ORIGIN_FAILURES: usize = 5;
const TOP_PERMISSION_VIOLATORS: usize = 20;

static PERSONAL_DATA_RESOURCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/users/[^/]+/data$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Security,
    Sox,
    Gdpr,
}

impl ReportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReportKind::Security => "security",
            ReportKind::Sox => "sox",
            ReportKind::Gdpr => "gdpr",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStatistics {
    pub total_events: usize,
    pub successful_events: usize,
    pub failed_events: usize,
    pub unique_users: usize,
    pub unique_origins: usize,
    pub unique_traces: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventCount {
    pub kind: AuthEventKind,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuspiciousOrigin {
    pub origin_ip: String,
    pub failed_attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionViolations {
    pub user_id: Option<Uuid>,
    pub username: Option<String>,
    pub violations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityIssues {
    pub suspicious_origins: Vec<SuspiciousOrigin>,
    pub permission_violations: Vec<PermissionViolations>,
    pub incidents_by_severity: BTreeMap<Severity, usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegritySummary {
    pub verification_passed: bool,
    pub events_verified: u64,
    pub integrity_violations: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct GdprMetrics {
    pub data_access_requests: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub report_type: ReportKind,
    pub period: ReportPeriod,
    pub generated_at: DateTime<Utc>,
    pub statistics: AuditStatistics,
    /// Ordered by count, highest first
    pub event_breakdown: Vec<EventCount>,
    pub security_issues: SecurityIssues,
    pub integrity_verification: IntegritySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gdpr_metrics: Option<GdprMetrics>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ControlStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlReport {
    pub timestamp: DateTime<Utc>,
    pub controls_verified: Vec<String>,
    pub control_failures: Vec<String>,
    pub overall_status: ControlStatus,
}

pub struct ComplianceAuditor {
    audit: Arc<AuditService>,
    monitor: Arc<SecurityMonitor>,
}

impl ComplianceAuditor {
    pub fn new(audit: Arc<AuditService>, monitor: Arc<SecurityMonitor>) -> Self {
        Self { audit, monitor }
    }

    /// Summarise `[from, to]`; the integrity section always covers the whole chain
    pub fn generate_compliance_report(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        kind: ReportKind,
    ) -> Result<ComplianceReport> {
        let events: Vec<AuthEvent> = self
            .audit
            .search(&AuditFilter {
                start_time: Some(from),
                end_time: Some(to),
                ..Default::default()
            })?
            .into_iter()
            .map(|record| record.event)
            .collect();

        let incidents_by_severity = self
            .monitor
            .incidents(None)?
            .into_iter()
            .filter(|i| i.detected_at >= from && i.detected_at <= to)
            .fold(BTreeMap::new(), |mut acc, i| {
                *acc.entry(i.severity).or_insert(0) += 1;
                acc
            });

        let integrity = self.audit.verify_integrity(None, None)?;

        let gdpr_metrics = (kind == ReportKind::Gdpr).then(|| GdprMetrics {
            data_access_requests: events
                .iter()
                .filter(|e| {
                    e.resource
                        .as_deref()
                        .map_or(false, |r| PERSONAL_DATA_RESOURCE.is_match(r))
                })
                .count(),
        });

        let report = ComplianceReport {
            report_type: kind,
            period: ReportPeriod { start: from, end: to },
            generated_at: self.audit.clock().now(),
            statistics: statistics(&events),
            event_breakdown: event_breakdown(&events),
            security_issues: SecurityIssues {
                suspicious_origins: suspicious_origins(&events),
                permission_violations: permission_violations(&events),
                incidents_by_severity,
            },
            integrity_verification: IntegritySummary {
                verification_passed: integrity.passed,
                events_verified: integrity.events_verified,
                integrity_violations: integrity.violations.len(),
            },
            gdpr_metrics,
        };

        tracing::info!(
            report_type = kind.as_str(),
            from = %from,
            to = %to,
            total_events = report.statistics.total_events,
            "Generated compliance report"
        );
        Ok(report)
    }

    /// Exercise the audit controls: append a probe event, then verify the chain
    pub fn verify_compliance_controls(&self) -> Result<ControlReport> {
        let mut controls_verified = Vec::new();
        let mut control_failures = Vec::new();

        let probe = AuthEvent::new(AuthEventKind::ComplianceProbe, self.audit.clock().now())
            .origin(&Origin::internal())
            .meta("compliance_test", true);
        match self.audit.record(probe) {
            Ok(digest) if !digest.is_empty() => controls_verified.push("audit_logging".to_string()),
            Ok(_) => control_failures.push("audit_logging".to_string()),
            Err(e) => control_failures.push(format!("audit_logging: {}", e)),
        }

        match self.audit.verify_integrity(None, None) {
            Ok(report) if report.passed => controls_verified.push("hash_chain_integrity".to_string()),
            Ok(_) => control_failures.push("hash_chain_integrity".to_string()),
            Err(e) => control_failures.push(format!("hash_chain_integrity: {}", e)),
        }

        let overall_status = if control_failures.is_empty() {
            ControlStatus::Pass
        } else {
            ControlStatus::Fail
        };
        if overall_status == ControlStatus::Fail {
            tracing::error!(failures = ?control_failures, "Compliance control check failed");
        }

        Ok(ControlReport {
            timestamp: self.audit.clock().now(),
            controls_verified,
            control_failures,
            overall_status,
        })
    }
}

fn statistics(events: &[AuthEvent]) -> AuditStatistics {
    let successful_events = events.iter().filter(|e| e.success).count();
    AuditStatistics {
        total_events: events.len(),
        successful_events,
        failed_events: events.len() - successful_events,
        unique_users: events.iter().filter_map(|e| e.user_id).collect::<BTreeSet<_>>().len(),
        unique_origins: events
            .iter()
            .filter_map(|e| e.origin_ip.as_deref())
            .collect::<BTreeSet<_>>()
            .len(),
        unique_traces: events
            .iter()
            .filter_map(|e| e.trace_id.as_deref())
            .collect::<BTreeSet<_>>()
            .len(),
    }
}

fn event_breakdown(events: &[AuthEvent]) -> Vec<EventCount> {
    let mut counts: BTreeMap<AuthEventKind, usize> = BTreeMap::new();
    for event in events {
        *counts.entry(event.kind).or_insert(0) += 1;
    }
    let mut breakdown: Vec<EventCount> = counts
        .into_iter()
        .map(|(kind, count)| EventCount { kind, count })
        .collect();
    // 稳定排序：计数相同时保持事件类型顺序
    breakdown.sort_by(|a, b| b.count.cmp(&a.count));
    breakdown
}

fn suspicious_origins(events: &[AuthEvent]) -> Vec<SuspiciousOrigin> {
    let mut failures: HashMap<&str, usize> = HashMap::new();
    for event in events.iter().filter(|e| e.kind == AuthEventKind::LoginFailure) {
        if let Some(ip) = event.origin_ip.as_deref() {
            *failures.entry(ip).or_insert(0) += 1;
        }
    }
    let mut origins: Vec<SuspiciousOrigin> = failures
        .into_iter()
        .filter(|(_, n)| *n > SUSPICIOUS_ORIGIN_FAILURES)
        .map(|(ip, failed_attempts)| SuspiciousOrigin {
            origin_ip: ip.to_string(),
            failed_attempts,
        })
        .collect();
    origins.sort_by(|a, b| {
        b.failed_attempts
            .cmp(&a.failed_attempts)
            .then_with(|| a.origin_ip.cmp(&b.origin_ip))
    });
    origins
}

fn permission_violations(events: &[AuthEvent]) -> Vec<PermissionViolations> {
    let mut counts: HashMap<(Option<Uuid>, Option<&str>), usize> = HashMap::new();
    for event in events.iter().filter(|e| e.kind == AuthEventKind::PermissionDenied) {
        *counts
            .entry((event.user_id, event.username.as_deref()))
            .or_insert(0) += 1;
    }
    let mut violations: Vec<PermissionViolations> = counts
        .into_iter()
        .map(|((user_id, username), violations)| PermissionViolations {
            user_id,
            username: username.map(|s| s.to_string()),
            violations,
        })
        .collect();
    violations.sort_by(|a, b| {
        b.violations
            .cmp(&a.violations)
            .then_with(|| a.username.cmp(&b.username))
    });
    violations.truncate(TOP_PERMISSION_VIOLATORS);
    violations
}
