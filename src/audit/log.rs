//! Audit log writer
//!
//! Inserts audit events into the append-only `audit_logs` table. The
//! writer never fails the originating request: a primary write failure
//! emits the full redacted event to a structured fallback channel and
//! increments a counter for alerting.

use chrono::{Duration, Utc};
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use super::{AuditAction, AuditEvent, PiiRedactor, Result};

/// Tracing target of the fallback channel. Infrastructure routes this
/// target to a durable secondary sink.
pub const FALLBACK_TARGET: &str = "audit.fallback";

/// Receipt describing where an event landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditWriteReceipt {
    /// Persisted to the primary audit table
    Primary(Uuid),
    /// Primary write failed; emitted on the fallback channel
    Fallback,
}

/// Append-only audit log backed by Postgres.
pub struct AuditLog {
    pool: PgPool,
    fallback_count: AtomicU64,
}

impl AuditLog {
    /// Create an audit log writer.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            fallback_count: AtomicU64::new(0),
        }
    }

    /// Write an audit event.
    ///
    /// Metadata is PII-redacted before insertion. On primary failure the
    /// redacted event is emitted on [`FALLBACK_TARGET`] and the call still
    /// succeeds; the caller's request must never fail for an audit error.
    pub async fn write(&self, event: AuditEvent) -> AuditWriteReceipt {
        let redacted = PiiRedactor::redact(&event.metadata);

        match self.insert(&event, &redacted).await {
            Ok(id) => AuditWriteReceipt::Primary(id),
            Err(err) => {
                self.fallback_count.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    target: FALLBACK_TARGET,
                    tenant_id = %event.tenant_id,
                    action = event.action.as_str(),
                    outcome = event.outcome.as_str(),
                    correlation_id = %event.correlation_id,
                    error = %err,
                    metadata = %redacted,
                    "audit primary write failed; event routed to fallback channel"
                );
                AuditWriteReceipt::Fallback
            }
        }
    }

    /// Number of events that fell back since process start. Exposed for
    /// the alerting metric.
    pub fn fallback_count(&self) -> u64 {
        self.fallback_count.load(Ordering::Relaxed)
    }

    async fn insert(&self, event: &AuditEvent, redacted: &serde_json::Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r"
            INSERT INTO audit_logs (
                id, tenant_id, user_id, action, timestamp, ip_address,
                user_agent, resource_type, resource_id, event_metadata,
                correlation_id, source, outcome, error_code
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ",
        )
        .bind(id)
        .bind(event.tenant_id)
        .bind(event.user_id)
        .bind(event.action.as_str())
        .bind(event.timestamp)
        .bind(&event.ip_address)
        .bind(&event.user_agent)
        .bind(&event.resource_type)
        .bind(&event.resource_id)
        .bind(redacted)
        .bind(event.correlation_id)
        .bind(event.source.as_str())
        .bind(event.outcome.as_str())
        .bind(&event.error_code)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Count events for a tenant and action within a time range.
    pub async fn count_by_action(
        &self,
        tenant_id: Uuid,
        action: AuditAction,
        since: chrono::DateTime<Utc>,
    ) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM audit_logs
            WHERE tenant_id = $1 AND action = $2 AND timestamp >= $3
            ",
        )
        .bind(tenant_id)
        .bind(action.as_str())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    // ========================================================================
    // Retention
    // ========================================================================

    /// Delete records older than the retention window.
    ///
    /// This is the single sanctioned deletion path and must run under the
    /// table owner role (the application role is insert-only by trigger).
    /// The sweep itself is audited.
    pub async fn apply_retention(&self, tenant_id: Uuid, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);

        self.write(
            AuditEvent::new(tenant_id, AuditAction::AuditRetentionStarted)
                .with_source(super::AuditSource::System)
                .with_metadata(serde_json::json!({
                    "retention_days": retention_days,
                    "cutoff": cutoff.to_rfc3339(),
                })),
        )
        .await;

        let result = sqlx::query(
            r"
            DELETE FROM audit_logs
            WHERE tenant_id = $1 AND timestamp < $2
            ",
        )
        .bind(tenant_id)
        .bind(cutoff)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) => {
                let deleted = done.rows_affected();
                self.write(
                    AuditEvent::new(tenant_id, AuditAction::AuditRetentionCompleted)
                        .with_source(super::AuditSource::System)
                        .with_metadata(serde_json::json!({"deleted": deleted})),
                )
                .await;
                Ok(deleted)
            }
            Err(err) => {
                self.write(
                    AuditEvent::new(tenant_id, AuditAction::AuditRetentionFailed)
                        .with_source(super::AuditSource::System)
                        .failed("audit_write_failed"),
                )
                .await;
                Err(err.into())
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditOutcome as Outcome;

    #[test]
    fn test_receipt_variants() {
        let id = Uuid::new_v4();
        assert_eq!(AuditWriteReceipt::Primary(id), AuditWriteReceipt::Primary(id));
        assert_ne!(AuditWriteReceipt::Primary(id), AuditWriteReceipt::Fallback);
    }

    #[test]
    fn test_event_metadata_is_redacted_shape() {
        // The writer redacts before insert; verify the redaction applied to
        // a representative event payload keeps structure.
        let event = AuditEvent::new(Uuid::new_v4(), AuditAction::StoreConnected).with_metadata(
            serde_json::json!({"access_token": "shpat_x", "shop_domain": "s.myshopify.com"}),
        );
        let redacted = PiiRedactor::redact(&event.metadata);
        assert_eq!(redacted["access_token"], "[REDACTED]");
        assert_eq!(redacted["shop_domain"], "s.myshopify.com");
        assert_eq!(event.outcome, Outcome::Success);
    }

    // Write-path and retention tests require a Postgres instance with the
    // append-only trigger installed; covered by integration environments.
}
