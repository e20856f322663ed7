//! Observability for the pool control loop: atomic operation counters, a
//! Prometheus text exporter, and an append-only audit log for claims,
//! creates, and destructive provider calls.

#![forbid(unsafe_code)]

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info, warn};
use uuid::Uuid;

// ─── Counters ───────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Atomic counters for the tick loop, claim coordinator, and provider calls.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub ticks_total: Counter,
    pub ticks_short_circuited: Counter,
    pub creates_total: Counter,
    pub creates_failed: Counter,
    pub claims_total: Counter,
    pub claims_failed: Counter,
    pub claims_rejected_no_idle: Counter,
    pub recycles_total: Counter,
    pub recycles_fallen_back_to_destroy: Counter,
    pub destroys_total: Counter,
    pub crashed_detected: Counter,
    pub orphans_deleted: Counter,
    pub heartbeat_cleanups: Counter,
    pub provider_calls_total: Counter,
    pub provider_call_errors: Counter,
    pub circuit_breaker_trips: Counter,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Renders [`PoolMetrics`] as Prometheus text exposition format.
pub struct MetricsExporter<'a> {
    metrics: &'a PoolMetrics,
    prefix: String,
}

impl<'a> MetricsExporter<'a> {
    pub fn new(metrics: &'a PoolMetrics) -> Self {
        Self {
            metrics,
            prefix: "agentpool".to_string(),
        }
    }

    pub fn render(&self) -> String {
        let m = self.metrics;
        let mut out = String::new();
        self.write(&mut out, "ticks_total", "Total reconciler ticks run", m.ticks_total.get());
        self.write(
            &mut out,
            "ticks_short_circuited",
            "Ticks that short-circuited on an unavailable provider listing",
            m.ticks_short_circuited.get(),
        );
        self.write(&mut out, "creates_total", "Total instance create attempts", m.creates_total.get());
        self.write(&mut out, "creates_failed", "Failed instance creates", m.creates_failed.get());
        self.write(&mut out, "claims_total", "Total successful claims", m.claims_total.get());
        self.write(&mut out, "claims_failed", "Claim attempts that failed after selection", m.claims_failed.get());
        self.write(
            &mut out,
            "claims_rejected_no_idle",
            "Claim attempts rejected for lack of an idle instance",
            m.claims_rejected_no_idle.get(),
        );
        self.write(&mut out, "recycles_total", "Total recycle attempts", m.recycles_total.get());
        self.write(
            &mut out,
            "recycles_fallen_back_to_destroy",
            "Recycles that fell back to destroy",
            m.recycles_fallen_back_to_destroy.get(),
        );
        self.write(&mut out, "destroys_total", "Total destroy operations", m.destroys_total.get());
        self.write(&mut out, "crashed_detected", "Instances newly marked crashed", m.crashed_detected.get());
        self.write(&mut out, "orphans_deleted", "Metadata-less orphans deleted", m.orphans_deleted.get());
        self.write(&mut out, "heartbeat_cleanups", "Cleanups triggered by heartbeat", m.heartbeat_cleanups.get());
        self.write(&mut out, "provider_calls_total", "Total provider API calls", m.provider_calls_total.get());
        self.write(&mut out, "provider_call_errors", "Total provider API errors", m.provider_call_errors.get());
        self.write(
            &mut out,
            "circuit_breaker_trips",
            "Times the creation circuit breaker tripped",
            m.circuit_breaker_trips.get(),
        );
        out
    }

    fn write(&self, out: &mut String, name: &str, help: &str, value: u64) {
        let p = &self.prefix;
        out.push_str(&format!("# HELP {p}_{name} {help}\n# TYPE {p}_{name} counter\n{p}_{name} {value}\n\n"));
    }
}

// ─── Audit log ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Claim,
    Recycle,
    Destroy,
    Dismiss,
    Reconcile,
    HeartbeatCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationOutcome {
    Attempted,
    Success,
    Failure,
    RolledBack,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub kind: OperationKind,
    pub resource_id: Option<String>,
    pub outcome: OperationOutcome,
    pub duration_ms: Option<u64>,
    pub details: HashMap<String, String>,
}

/// Append-only, in-memory, capacity-bounded audit log of every claim,
/// create, recycle, and destroy. Written before any destructive provider
/// call completes so a crash mid-operation still leaves a trace.
pub struct AuditLog {
    entries: RwLock<Vec<AuditEntry>>,
    max_entries: usize,
}

impl AuditLog {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            max_entries,
        }
    }

    pub fn default_capacity() -> Self {
        Self::new(10_000)
    }

    pub fn log(
        &self,
        kind: OperationKind,
        resource_id: Option<&str>,
        outcome: OperationOutcome,
        duration_ms: Option<u64>,
        details: HashMap<String, String>,
    ) {
        let entry = AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            kind,
            resource_id: resource_id.map(String::from),
            outcome,
            duration_ms,
            details,
        };

        match outcome {
            OperationOutcome::Attempted => info!(audit_id = %entry.id, kind = ?entry.kind, resource_id = ?entry.resource_id, "pool operation starting"),
            OperationOutcome::Success => info!(audit_id = %entry.id, kind = ?entry.kind, resource_id = ?entry.resource_id, "pool operation succeeded"),
            OperationOutcome::Failure => error!(audit_id = %entry.id, kind = ?entry.kind, resource_id = ?entry.resource_id, "pool operation failed"),
            OperationOutcome::RolledBack => warn!(audit_id = %entry.id, kind = ?entry.kind, resource_id = ?entry.resource_id, "pool operation rolled back"),
        }

        let mut entries = self.entries.write();
        entries.push(entry);
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(0..excess);
        }
    }

    pub fn query(&self, kind: Option<OperationKind>, limit: usize) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = PoolMetrics::new();
        m.ticks_total.inc();
        m.ticks_total.inc();
        m.creates_failed.inc();
        assert_eq!(m.ticks_total.get(), 2);
        assert_eq!(m.creates_failed.get(), 1);
    }

    #[test]
    fn exporter_renders_all_zero_counters_too() {
        let m = PoolMetrics::new();
        let rendered = MetricsExporter::new(&m).render();
        assert!(rendered.contains("agentpool_ticks_total 0"));
        assert!(rendered.contains("# TYPE agentpool_claims_total counter"));
    }

    #[test]
    fn audit_log_query_filters_by_kind() {
        let log = AuditLog::new(100);
        log.log(OperationKind::Create, Some("i-1"), OperationOutcome::Success, Some(10), HashMap::new());
        log.log(OperationKind::Claim, Some("i-1"), OperationOutcome::Success, Some(5), HashMap::new());

        let creates = log.query(Some(OperationKind::Create), 10);
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].resource_id.as_deref(), Some("i-1"));
    }

    #[test]
    fn audit_log_evicts_beyond_capacity() {
        let log = AuditLog::new(3);
        for i in 0..10 {
            log.log(OperationKind::Reconcile, Some(&format!("t-{i}")), OperationOutcome::Success, None, HashMap::new());
        }
        assert_eq!(log.count(), 3);
    }
}
