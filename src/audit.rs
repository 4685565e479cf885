//! Audit Sink (C9, §4.9).
//!
//! Append-only; writes must never block or fail the operation that produced
//! them (§5, §7 "Audit writes never raise into the caller"). The in-memory
//! reference sink both appends to its own log (for anything that wants to
//! query recent events) and emits a structured `tracing::info!` record, so
//! operators get a persisted trail and a live log stream from one write.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;

use crate::domain::{AuditKind, AuditRecord, AuditStatus};

/// Append-only event sink (C9).
///
/// Implementations must never propagate a write failure to the caller — log
/// it and move on. `Send + Sync` because every request path holds a shared
/// reference.
#[async_trait::async_trait]
pub trait AuditSink: Send + Sync + 'static {
    /// Append one record. Must not block token issuance on failure.
    async fn record(&self, record: AuditRecord);

    /// The most recent records of a given kind, newest first (bounded;
    /// intended for tests/admin inspection, not a general query API).
    async fn recent(&self, kind: AuditKind, limit: usize) -> Vec<AuditRecord>;
}

/// Build an [`AuditRecord`] and hand it to `sink`, swallowing nothing from
/// the caller's perspective — this function itself never fails.
pub async fn emit(
    sink: &dyn AuditSink,
    kind: AuditKind,
    event_type: &str,
    status: AuditStatus,
    subject_ids: Vec<String>,
    details: Value,
) {
    let record = AuditRecord {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        kind,
        subject_ids,
        event_type: event_type.to_string(),
        status,
        details,
        source_ip: None,
    };

    tracing::info!(
        audit.kind = ?record.kind,
        audit.event_type = %record.event_type,
        audit.status = ?record.status,
        audit.subject_ids = ?record.subject_ids,
        "audit event"
    );

    sink.record(record).await;
}

/// A synthetic token-id used for failure records that occur before a token
/// id exists (§4.9 "preserving the relational constraint").
#[must_use]
pub fn error_subject_id() -> String {
    format!("error-{}", uuid::Uuid::new_v4())
}

/// In-memory audit sink, keyed by kind with a bounded ring per kind so a
/// long-running process doesn't grow this unboundedly. Production
/// deployments swap this for a durable sink behind the same trait.
pub struct InMemoryAuditSink {
    by_kind: DashMap<AuditKind, Vec<AuditRecord>>,
    cap_per_kind: usize,
}

impl InMemoryAuditSink {
    /// A sink retaining up to `cap_per_kind` records per kind.
    #[must_use]
    pub fn new(cap_per_kind: usize) -> Self {
        Self { by_kind: DashMap::new(), cap_per_kind }
    }
}

impl Default for InMemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait::async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: AuditRecord) {
        let mut entry = self.by_kind.entry(record.kind).or_default();
        entry.push(record);
        let cap = self.cap_per_kind;
        let len = entry.len();
        if len > cap {
            entry.drain(0..len - cap);
        }
    }

    async fn recent(&self, kind: AuditKind, limit: usize) -> Vec<AuditRecord> {
        let Some(entries) = self.by_kind.get(&kind) else { return Vec::new() };
        entries.iter().rev().take(limit).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn recent_returns_newest_first() {
        // GIVEN: three token events appended in order
        let sink = InMemoryAuditSink::default();
        for i in 0..3 {
            emit(&sink, AuditKind::Token, "issued", AuditStatus::Success, vec![format!("tok-{i}")], json!({})).await;
        }

        // WHEN: querying recent
        let recent = sink.recent(AuditKind::Token, 2).await;

        // THEN: newest two, newest first
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].subject_ids, vec!["tok-2".to_string()]);
        assert_eq!(recent[1].subject_ids, vec!["tok-1".to_string()]);
    }

    #[tokio::test]
    async fn recent_is_empty_for_unused_kind() {
        let sink = InMemoryAuditSink::default();
        assert!(sink.recent(AuditKind::Delegation, 10).await.is_empty());
    }

    #[tokio::test]
    async fn ring_buffer_caps_retention_per_kind() {
        let sink = InMemoryAuditSink::new(2);
        for i in 0..5 {
            emit(&sink, AuditKind::Policy, "decision", AuditStatus::Success, vec![format!("p-{i}")], json!({})).await;
        }

        let all = sink.recent(AuditKind::Policy, 100).await;
        assert_eq!(all.len(), 2);
    }
}
