//! 审计日志服务
//! 哈希链式追加写入：digest = SHA-256(canonical(event) || previous_digest)，
//! 创世记录的 previous_digest 为空串。只追加，从不修复历史。

use crate::{
    clock::SharedClock,
    error::{AppError, Result},
    models::{
        audit::{
            canonical_encode, AuditFilter, AuditRecord, AuthEvent, AuthEventKind,
            IntegrityReport, IntegrityViolation, ViolationKind,
        },
        Origin,
    },
    repository::SharedStore,
};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

/// Receives every record after it has been durably appended
pub trait AuditObserver: Send + Sync {
    fn observe(&self, record: &AuditRecord);
}

#[derive(Debug, Clone, Default)]
struct ChainHead {
    sequence: u64,
    digest: String,
}

/// Chain digest for one event given its predecessor's digest
pub fn chain_digest(event: &AuthEvent, previous_digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_encode(event));
    hasher.update(previous_digest.as_bytes());
    hex::encode(hasher.finalize())
}

pub struct AuditService {
    store: SharedStore,
    clock: SharedClock,
    // 全局唯一的写入串行点：摘要计算、落盘、更新链头在同一把锁内完成
    head: Mutex<ChainHead>,
    observers: RwLock<Vec<Arc<dyn AuditObserver>>>,
}

impl AuditService {
    /// Resume the chain from whatever the store already holds
    pub fn new(store: SharedStore, clock: SharedClock) -> Result<Self> {
        let head = match store.last_audit_record()? {
            Some(last) => ChainHead {
                sequence: last.sequence,
                digest: last.digest,
            },
            None => ChainHead::default(),
        };

        tracing::info!(
            backend = store.backend_name(),
            head_sequence = head.sequence,
            "Audit chain loaded"
        );

        Ok(Self {
            store,
            clock,
            head: Mutex::new(head),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn subscribe(&self, observer: Arc<dyn AuditObserver>) {
        self.observers.write().push(observer);
    }

    /// Current head `(sequence, digest)`
    pub fn head(&self) -> (u64, String) {
        let head = self.head.lock();
        (head.sequence, head.digest.clone())
    }

    /// Append one event to the chain and return its digest.
    ///
    /// A failed store write leaves the head untouched.
    pub fn record(&self, event: AuthEvent) -> Result<String> {
        let record = {
            let mut head = self.head.lock();
            let sequence = head.sequence + 1;
            let digest = chain_digest(&event, &head.digest);
            let record = AuditRecord {
                sequence,
                event,
                previous_digest: head.digest.clone(),
                digest,
            };

            if let Err(e) = self.store.append_audit_record(&record) {
                tracing::error!(
                    sequence,
                    kind = record.event.kind.as_str(),
                    error = %e,
                    "Failed to append audit record"
                );
                metrics::counter!("sentinel_audit_append_failures_total").increment(1);
                return Err(match e {
                    AppError::Integrity(_) => e,
                    other => AppError::Integrity(format!("audit append failed: {}", other)),
                });
            }

            head.sequence = sequence;
            head.digest = record.digest.clone();
            record
        };

        metrics::counter!("sentinel_audit_events_total", "kind" => record.event.kind.as_str())
            .increment(1);
        tracing::debug!(
            sequence = record.sequence,
            kind = record.event.kind.as_str(),
            success = record.event.success,
            "Audit event recorded"
        );

        let observers = self.observers.read().clone();
        for observer in observers {
            observer.observe(&record);
        }

        Ok(record.digest)
    }

    /// Recompute the chain over `[from, to]` (defaults: whole chain).
    ///
    /// Seeds from the stored digest of `from - 1` and carries the recomputed
    /// digest forward, so a mutation at N flags N and every later sequence.
    /// The run itself is persisted and appended to the chain as an
    /// `IntegrityVerified` event; nothing is repaired.
    pub fn verify_integrity(&self, from: Option<u64>, to: Option<u64>) -> Result<IntegrityReport> {
        let (head_sequence, _) = self.head();
        let from = from.unwrap_or(1).max(1);
        let to = to.unwrap_or(head_sequence).min(head_sequence);

        let mut violations = Vec::new();
        let mut events_verified = 0u64;

        if from <= to {
            let mut previous = if from == 1 {
                String::new()
            } else {
                match self.store.get_audit_record(from - 1)? {
                    Some(record) => record.digest,
                    None => {
                        return Err(AppError::Integrity(format!(
                            "cannot seed verification: audit record {} is missing",
                            from - 1
                        )))
                    }
                }
            };

            let records = self.store.audit_range(from, to)?;
            let mut iter = records.into_iter().peekable();

            for sequence in from..=to {
                match iter.next_if(|r| r.sequence == sequence) {
                    Some(record) => {
                        let expected = chain_digest(&record.event, &previous);
                        events_verified += 1;
                        if expected != record.digest || record.previous_digest != previous {
                            violations.push(IntegrityViolation {
                                sequence,
                                kind: ViolationKind::DigestMismatch,
                                event_id: Some(record.event.event_id),
                                expected_digest: expected.clone(),
                                actual_digest: Some(record.digest.clone()),
                            });
                        }
                        previous = expected;
                    }
                    None => {
                        violations.push(IntegrityViolation {
                            sequence,
                            kind: ViolationKind::MissingRecord,
                            event_id: None,
                            expected_digest: String::new(),
                            actual_digest: None,
                        });
                        // 缺失记录之后的链无法复算，后续记录都会被标记
                        previous = String::new();
                    }
                }
            }
        }

        let report = IntegrityReport {
            id: Uuid::new_v4(),
            from_sequence: from,
            to_sequence: to,
            passed: violations.is_empty(),
            events_verified,
            violations,
            verified_at: self.clock.now(),
        };
        self.store.save_integrity_report(&report)?;

        if report.passed {
            tracing::info!(from, to, events_verified, "Audit chain verified");
        } else {
            metrics::counter!("sentinel_audit_integrity_failures_total").increment(1);
            tracing::error!(
                from,
                to,
                violations = report.violations.len(),
                first = report.violations.first().map(|v| v.sequence),
                "Audit chain integrity violated"
            );
        }

        let mut event = AuthEvent::new(AuthEventKind::IntegrityVerified, report.verified_at)
            .origin(&Origin::internal())
            .meta("report_id", report.id.to_string())
            .meta("from_sequence", from)
            .meta("to_sequence", to)
            .meta("events_verified", events_verified)
            .meta("violations", report.violations.len());
        if !report.passed {
            event = event.failed("audit chain integrity violated");
        }
        self.record(event)?;

        Ok(report)
    }

    /// Matching events, newest first. The time range is applied by the store.
    pub fn search(&self, filter: &AuditFilter) -> Result<Vec<AuditRecord>> {
        let (head_sequence, _) = self.head();
        let candidates = match (filter.start_time, filter.end_time) {
            (None, None) => self.store.audit_range(1, head_sequence)?,
            (from, to) => self.store.audit_in_period(from, to)?,
        };
        Ok(candidates
            .into_iter()
            .rev()
            .filter(|r| r.sequence <= head_sequence && filter.matches(&r.event))
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// All records in chain order
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        let (head_sequence, _) = self.head();
        self.store.audit_range(1, head_sequence)
    }

    pub fn integrity_reports(&self) -> Result<Vec<IntegrityReport>> {
        self.store.list_integrity_reports()
    }
}
